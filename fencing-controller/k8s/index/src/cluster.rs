use crate::{ClusterEntry, ClusterResource, Index};
use pg_fencing_controller_k8s_api::{Cluster, ResourceExt, ResourceId};

impl kubert::index::IndexNamespacedResource<Cluster> for Index {
    fn apply(&mut self, cluster: Cluster) {
        let namespace = cluster.namespace().expect("Cluster must have a namespace");
        let name = cluster.name_unchecked();
        let id = ResourceId::new(namespace, name);

        let resource = ClusterResource {
            fenced_instances: cluster.fenced_instances().map(str::to_string),
            current_primary: cluster.current_primary().map(str::to_string),
        };

        // Status updates published by the controller itself (and unrelated
        // spec changes) don't warrant another pass.
        let entry = self.clusters.entry(id.clone()).or_insert_with(ClusterEntry::default);
        if entry.resource.as_ref() == Some(&resource) {
            return;
        }
        tracing::debug!(
            %id,
            fenced_instances = ?resource.fenced_instances,
            current_primary = ?resource.current_primary,
            "Cluster updated",
        );
        entry.resource = Some(resource);
        self.trigger(id);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        let Some(entry) = self.clusters.get_mut(&id) else {
            return;
        };
        if entry.resource.take().is_some() {
            tracing::debug!(%id, "Cluster deleted");
            self.gc(&id);
            self.trigger(id);
        }
    }

    // Since apply only reindexes a single Cluster at a time, there's no need
    // to handle resets specially.
}
