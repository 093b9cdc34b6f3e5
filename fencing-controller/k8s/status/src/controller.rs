use crate::{ControllerMetrics, STATUS_CONTROLLER_NAME};
use ahash::AHashMap as HashMap;
use kubert::lease::Claim;
use pg_fencing_controller_core::Convergence;
use pg_fencing_controller_k8s_api::{
    Api, Client, Cluster, FencingStatus, Patch, PatchParams, ResourceId,
};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    time::{self, Duration},
};

/// A cluster's latest fencing progress, or `None` once the cluster has been
/// deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub id: ResourceId,
    pub status: Option<FencingStatus>,
}

pub struct Controller {
    claims: watch::Receiver<Arc<Claim>>,
    client: Client,
    name: String,
    updates: mpsc::Receiver<Update>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
    published: Published,
}

/// The statuses this controller has written, so that unchanged results are not
/// patched again.
#[derive(Debug, Default)]
pub(crate) struct Published(HashMap<ResourceId, FencingStatus>);

// === impl Controller ===

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        client: Client,
        name: String,
        updates: mpsc::Receiver<Update>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            claims,
            client,
            name,
            updates,
            patch_timeout,
            metrics,
            published: Published::default(),
        }
    }

    pub async fn run(mut self) {
        let patch_params = PatchParams {
            field_manager: Some(STATUS_CONTROLLER_NAME.to_string()),
            ..Default::default()
        };

        while let Some(Update { id, status }) = self.updates.recv().await {
            let Some(status) = status else {
                self.published.forget(&id);
                continue;
            };

            // Only the lease holder writes status. When leadership is lost the
            // cache is dropped so that a later claim republishes everything.
            if !self.claims.borrow().is_current_for(&self.name) {
                tracing::debug!(%id, "Not the lease holder; skipping status update");
                self.metrics.patch_skipped.inc();
                self.published.clear();
                continue;
            }

            if !self.published.is_changed(&id, &status) {
                tracing::trace!(%id, "Status unchanged");
                continue;
            }

            let api = Api::<Cluster>::namespaced(self.client.clone(), &id.namespace);

            // A merge patch only removes map keys that are explicitly nulled, so
            // the instances currently in the resource's status must be known.
            let previous = match self.published.get(&id) {
                Some(previous) => Some(previous.clone()),
                None => match time::timeout(self.patch_timeout, api.get_status(&id.name)).await {
                    Ok(Ok(cluster)) => cluster.status.and_then(|s| s.fencing),
                    Ok(Err(error)) => {
                        tracing::error!(namespace = %id.namespace, name = %id.name, %error, "Failed to fetch Cluster status");
                        self.metrics.patch_failed.inc();
                        continue;
                    }
                    Err(_) => {
                        tracing::error!(namespace = %id.namespace, name = %id.name, "Timed out fetching Cluster status");
                        self.metrics.patch_timeout.inc();
                        continue;
                    }
                },
            };

            let patch = make_patch(previous.as_ref(), &status);
            match time::timeout(
                self.patch_timeout,
                api.patch_status(&id.name, &patch_params, &patch),
            )
            .await
            {
                Ok(Ok(_)) => {
                    tracing::debug!(%id, converged = status.converged, "Patched Cluster status");
                    self.metrics.patch_succeeded.inc();
                    self.published.record(id, status);
                }
                Ok(Err(error)) => {
                    tracing::error!(namespace = %id.namespace, name = %id.name, %error, "Failed to patch Cluster status");
                    self.metrics.patch_failed.inc();
                }
                Err(_) => {
                    tracing::error!(namespace = %id.namespace, name = %id.name, "Timed out patching Cluster status");
                    self.metrics.patch_timeout.inc();
                }
            }
        }
    }
}

// === impl Published ===

impl Published {
    pub(crate) fn is_changed(&self, id: &ResourceId, status: &FencingStatus) -> bool {
        self.0.get(id) != Some(status)
    }

    pub(crate) fn get(&self, id: &ResourceId) -> Option<&FencingStatus> {
        self.0.get(id)
    }

    pub(crate) fn record(&mut self, id: ResourceId, status: FencingStatus) {
        self.0.insert(id, status);
    }

    pub(crate) fn forget(&mut self, id: &ResourceId) {
        self.0.remove(id);
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }
}

/// Renders the outcome of a reconciliation pass as the status the controller
/// publishes.
pub fn make_status(convergence: &Convergence) -> FencingStatus {
    FencingStatus {
        instances: convergence
            .states
            .iter()
            .map(|(id, state)| (id.to_string(), state.to_string()))
            .collect(),
        converged: convergence.converged,
    }
}

/// Builds the merge patch that replaces `previous` with `status`. Instances
/// that are no longer reported are set to `null`, which removes them.
pub(crate) fn make_patch(
    previous: Option<&FencingStatus>,
    status: &FencingStatus,
) -> Patch<serde_json::Value> {
    let mut instances = serde_json::Map::new();
    for name in previous.into_iter().flat_map(|p| p.instances.keys()) {
        if !status.instances.contains_key(name) {
            instances.insert(name.clone(), serde_json::Value::Null);
        }
    }
    for (name, state) in &status.instances {
        instances.insert(name.clone(), state.clone().into());
    }

    Patch::Merge(serde_json::json!({
        "status": {
            "fencing": {
                "instances": instances,
                "converged": status.converged,
            },
        },
    }))
}
