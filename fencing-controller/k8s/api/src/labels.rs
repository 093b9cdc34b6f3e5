//! Well-known labels and annotations.

/// Cluster annotation holding the JSON array of fenced instance names.
pub const FENCED_INSTANCES_ANNOTATION: &str = "postgresql.pgfence.io/fencedInstances";

/// Pod annotation recording that the instance has been fenced.
pub const FENCED_MARKER_ANNOTATION: &str = "postgresql.pgfence.io/fenced";

/// Pod label naming the cluster an instance belongs to.
pub const CLUSTER_LABEL: &str = "postgresql.pgfence.io/cluster";

/// Pod label holding the instance's role, `primary` or `replica`.
pub const INSTANCE_ROLE_LABEL: &str = "postgresql.pgfence.io/instanceRole";

pub const ROLE_PRIMARY: &str = "primary";
pub const ROLE_REPLICA: &str = "replica";

/// The name of the database container in instance pods.
pub const POSTGRES_CONTAINER: &str = "postgres";
