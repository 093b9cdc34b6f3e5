use pg_fencing_controller_core::{
    store::{self, DeclarationStore, Versioned},
    FencingSet,
};
use pg_fencing_controller_k8s_api::{
    labels, Api, Client, Cluster, Error, Patch, PatchParams, ResourceExt,
};

/// Stores a cluster's fencing declaration in its fencing annotation.
///
/// The cluster's `resourceVersion` serves as the version token. Writes carry
/// it in the patch so that the API server rejects them with a conflict when
/// the cluster changed in the meantime.
#[derive(Clone)]
pub struct ClusterDeclarations {
    api: Api<Cluster>,
    name: String,
}

// === impl ClusterDeclarations ===

impl ClusterDeclarations {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl DeclarationStore for ClusterDeclarations {
    async fn get(&self) -> Result<Versioned<FencingSet>, store::Error> {
        let cluster = self.api.get(&self.name).await.map_err(backend)?;
        let version = cluster.resource_version().unwrap_or_default();
        match FencingSet::from_annotation(cluster.fenced_instances()) {
            Ok(value) => Ok(Versioned { value, version }),
            Err(error) => Err(store::Error::Malformed { version, error }),
        }
    }

    async fn set(&self, fencing: &FencingSet, version: &str) -> Result<(), store::Error> {
        let patch = make_patch(fencing, version);
        tracing::trace!(cluster = %self.name, %patch, "Patching fencing annotation");
        match self
            .api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Api(error)) if error.code == 409 => Err(store::Error::Conflict),
            Err(error) => Err(backend(error)),
        }
    }
}

fn backend(error: Error) -> store::Error {
    store::Error::Backend(error.into())
}

/// Builds a merge patch that sets (or, for an empty declaration, removes) the
/// fencing annotation, conditional on `version`.
fn make_patch(fencing: &FencingSet, version: &str) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": version,
            "annotations": {
                (labels::FENCED_INSTANCES_ANNOTATION): fencing.to_annotation(),
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn patch_sets_annotation() {
        let patch = make_patch(&FencingSet::instances(["pg-2", "pg-1"]), "42");
        assert_eq!(
            patch,
            serde_json::json!({
                "metadata": {
                    "resourceVersion": "42",
                    "annotations": {
                        "postgresql.pgfence.io/fencedInstances": r#"["pg-1","pg-2"]"#,
                    },
                },
            })
        );
    }

    #[test]
    fn patch_removes_empty_annotation() {
        let patch = make_patch(&FencingSet::none(), "7");
        assert_eq!(
            patch,
            serde_json::json!({
                "metadata": {
                    "resourceVersion": "7",
                    "annotations": {
                        "postgresql.pgfence.io/fencedInstances": null,
                    },
                },
            })
        );
    }

    #[test]
    fn patch_sets_wildcard() {
        let patch = make_patch(&FencingSet::All, "1");
        assert_eq!(
            patch["metadata"]["annotations"][labels::FENCED_INSTANCES_ANNOTATION],
            r#"["*"]"#
        );
    }
}
