use crate::Index;
use pg_fencing_controller_core::{InstanceId, InstanceStatus, Role};
use pg_fencing_controller_k8s_api::{labels, Pod, ResourceExt, ResourceId};

impl kubert::index::IndexNamespacedResource<Pod> for Index {
    fn apply(&mut self, pod: Pod) {
        let namespace = pod.namespace().expect("Pod must have a namespace");
        let name = pod.name_unchecked();
        let pod_id = ResourceId::new(namespace.clone(), name);

        // Pods that are shutting down no longer count as instances.
        let cluster = pod
            .labels()
            .get(labels::CLUSTER_LABEL)
            .filter(|_| pod.metadata.deletion_timestamp.is_none())
            .cloned();
        let Some(cluster) = cluster else {
            self.remove_pod(&pod_id);
            return;
        };

        // A relabeled pod leaves its previous cluster.
        if self.pods.get(&pod_id).is_some_and(|c| *c != cluster) {
            self.remove_pod(&pod_id);
        }

        let status = instance_status(&pod);
        let id = ResourceId::new(namespace, cluster.clone());
        self.pods.insert(pod_id, cluster);
        let entry = self.clusters.entry(id.clone()).or_default();
        if entry.instances.get(&status.id) == Some(&status) {
            return;
        }
        tracing::debug!(
            cluster = %id,
            instance = %status.id,
            ready = status.ready,
            role = %status.role,
            fence_marker = status.fence_marker,
            "Instance updated",
        );
        entry.instances.insert(status.id.clone(), status);
        self.trigger(id);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.remove_pod(&ResourceId::new(namespace, name));
    }
}

impl Index {
    fn remove_pod(&mut self, pod_id: &ResourceId) {
        let Some(cluster) = self.pods.remove(pod_id) else {
            return;
        };
        let id = ResourceId::new(pod_id.namespace.clone(), cluster);
        let removed = self
            .clusters
            .get_mut(&id)
            .and_then(|entry| entry.instances.remove(pod_id.name.as_str()));
        if removed.is_some() {
            tracing::debug!(cluster = %id, instance = %pod_id.name, "Instance removed");
            self.gc(&id);
            self.trigger(id);
        }
    }
}

fn instance_status(pod: &Pod) -> InstanceStatus {
    let role = match pod.labels().get(labels::INSTANCE_ROLE_LABEL).map(String::as_str) {
        Some(labels::ROLE_PRIMARY) => Role::Primary,
        Some(labels::ROLE_REPLICA) | None => Role::Replica,
        Some(role) => {
            tracing::debug!(pod = %pod.name_unchecked(), %role, "Unknown instance role; treating as replica");
            Role::Replica
        }
    };

    let ready = pod
        .status
        .iter()
        .flat_map(|status| status.container_statuses.iter().flatten())
        .any(|c| c.name == labels::POSTGRES_CONTAINER && c.ready);

    let fence_marker = pod
        .annotations()
        .get(labels::FENCED_MARKER_ANNOTATION)
        .is_some_and(|v| v == "true");

    InstanceStatus {
        id: InstanceId::new(pod.name_unchecked()),
        ready,
        role,
        fence_marker,
    }
}
