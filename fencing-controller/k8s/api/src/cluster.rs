use crate::labels;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A replicated PostgreSQL cluster.
///
/// Only the fields fencing depends on are modeled; the rest of the resource is
/// owned by the operator that provisions instances.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "postgresql.pgfence.io",
    version = "v1",
    kind = "Cluster",
    status = "ClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// The number of instances in the cluster.
    pub instances: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// The instance currently serving as primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_primary: Option<String>,

    /// The instance a switchover or failover is promoting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_primary: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fencing: Option<FencingStatus>,
}

/// Per-instance fencing progress, as published by the fencing controller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FencingStatus {
    /// Maps each instance to its fencing state.
    #[serde(default)]
    pub instances: BTreeMap<String, String>,

    /// Whether every instance is in its declared state.
    #[serde(default)]
    pub converged: bool,
}

impl Cluster {
    /// The raw fencing declaration, if the annotation is set.
    pub fn fenced_instances(&self) -> Option<&str> {
        self.annotations()
            .get(labels::FENCED_INSTANCES_ANNOTATION)
            .map(String::as_str)
    }

    pub fn current_primary(&self) -> Option<&str> {
        self.status.as_ref()?.current_primary.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_status() {
        let cluster = serde_json::from_value::<Cluster>(serde_json::json!({
            "apiVersion": "postgresql.pgfence.io/v1",
            "kind": "Cluster",
            "metadata": {
                "name": "pg",
                "namespace": "db",
                "annotations": {
                    "postgresql.pgfence.io/fencedInstances": "[\"pg-1\"]",
                },
            },
            "spec": { "instances": 3 },
            "status": {
                "currentPrimary": "pg-1",
                "fencing": { "instances": { "pg-1": "Fenced" }, "converged": true },
            },
        }))
        .expect("cluster must deserialize");

        assert_eq!(cluster.fenced_instances(), Some(r#"["pg-1"]"#));
        assert_eq!(cluster.current_primary(), Some("pg-1"));
        let fencing = cluster.status.and_then(|s| s.fencing).unwrap();
        assert!(fencing.converged);
        assert_eq!(fencing.instances.get("pg-1").map(String::as_str), Some("Fenced"));
    }
}
