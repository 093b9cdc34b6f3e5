//! Fencing controller index
//!
//! Maintains a view of every `Cluster` and of the instance pods that belong to
//! it. Pods are associated with a cluster through the cluster label:
//!
//! ```text
//! [ Cluster ] <- (label) [ Pod ]
//! ```
//!
//! Whenever anything that affects fencing changes (the fencing annotation, the
//! primary designation, or an instance's readiness, role or fence marker) the
//! index publishes the cluster's id on its trigger channel so that the cluster
//! is reconciled.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster;
mod pod;


use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use pg_fencing_controller_core::{
    FencingSet, InstanceId, InstanceStatus, Observation, ParseError, RoleAssignment,
};
use pg_fencing_controller_k8s_api::ResourceId;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;

pub type SharedIndex = Arc<RwLock<Index>>;

pub struct Index {
    clusters: HashMap<ResourceId, ClusterEntry>,

    /// Maps each indexed pod to the name of its cluster.
    pods: HashMap<ResourceId, String>,

    triggers: UnboundedSender<ResourceId>,
}

#[derive(Debug, Default)]
struct ClusterEntry {
    /// Unset until the `Cluster` resource itself has been observed.
    resource: Option<ClusterResource>,
    instances: BTreeMap<InstanceId, InstanceStatus>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ClusterResource {
    fenced_instances: Option<String>,
    current_primary: Option<String>,
}

// === impl Index ===

impl Index {
    pub fn shared(triggers: UnboundedSender<ResourceId>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            clusters: HashMap::new(),
            pods: HashMap::new(),
            triggers,
        }))
    }

    /// Returns the ids of all clusters whose resource has been observed.
    pub fn cluster_ids(&self) -> Vec<ResourceId> {
        let mut ids = self
            .clusters
            .iter()
            .filter(|(_, entry)| entry.resource.is_some())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Builds an observation of the cluster's declaration and inventory.
    ///
    /// Returns `None` if the cluster does not exist, and an error if its
    /// fencing annotation cannot be parsed.
    pub fn observe(&self, id: &ResourceId) -> Option<Result<Observation, ParseError>> {
        let entry = self.clusters.get(id)?;
        let resource = entry.resource.as_ref()?;

        let fencing = match FencingSet::from_annotation(resource.fenced_instances.as_deref()) {
            Ok(fencing) => fencing,
            Err(error) => return Some(Err(error)),
        };

        // The cluster status is authoritative for the primary designation;
        // pod labels are only consulted before it has been published.
        let roles = match resource.current_primary.as_deref() {
            Some(primary) => RoleAssignment::new(Some(primary.into())),
            None => RoleAssignment::from_instances(entry.instances.values()),
        };
        let instances = entry
            .instances
            .values()
            .map(|status| InstanceStatus {
                role: roles.role_of(&status.id),
                ..status.clone()
            })
            .collect();

        Some(Ok(Observation {
            fencing,
            instances,
            roles,
        }))
    }

    fn trigger(&self, id: ResourceId) {
        if self.triggers.send(id).is_err() {
            tracing::debug!("Reconciler is no longer running");
        }
    }

    /// Drops entries that no longer hold a resource or any instance.
    fn gc(&mut self, id: &ResourceId) {
        if let Some(entry) = self.clusters.get(id) {
            if entry.resource.is_none() && entry.instances.is_empty() {
                self.clusters.remove(id);
            }
        }
    }
}
