//! Drives a fencing reconciler for every indexed cluster.

use crate::{
    client::PodExec,
    core::{executor::Executor, Reconciler, RetryPolicy, TopologyGuard},
    index::SharedIndex,
    k8s::{Client, ResourceId},
    metrics::{ExecutorMetrics, MeteredExecutor},
    status,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kubert::lease::Claim;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    time::{self, Duration},
};
use tracing::{debug, info_span, warn, Instrument};

/// The topology guard of every cluster this controller reconciles.
pub type Guards = Arc<RwLock<HashMap<ResourceId, TopologyGuard>>>;

type ClusterReconciler = Reconciler<MeteredExecutor<Executor<PodExec>>>;

#[derive(Clone, Debug)]
pub struct Config {
    pub executor_timeout: Duration,
    pub reconciliation_period: Duration,
    pub container: String,
    pub pgdata: String,
    pub retry: RetryPolicy,
}

pub struct Controller {
    config: Config,
    client: Client,
    index: SharedIndex,
    triggers: mpsc::UnboundedReceiver<ResourceId>,
    claims: watch::Receiver<Arc<Claim>>,
    hostname: String,
    statuses: mpsc::Sender<status::Update>,
    metrics: ExecutorMetrics,

    reconcilers: HashMap<ResourceId, Arc<ClusterReconciler>>,
    guards: Guards,

    /// Clusters with a delayed pass already scheduled.
    requeued: Arc<Mutex<HashSet<ResourceId>>>,
}

// === impl Controller ===

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        client: Client,
        index: SharedIndex,
        triggers: mpsc::UnboundedReceiver<ResourceId>,
        claims: watch::Receiver<Arc<Claim>>,
        hostname: String,
        statuses: mpsc::Sender<status::Update>,
        metrics: ExecutorMetrics,
    ) -> Self {
        Self {
            config,
            client,
            index,
            triggers,
            claims,
            hostname,
            statuses,
            metrics,
            reconcilers: HashMap::new(),
            guards: Guards::default(),
            requeued: Default::default(),
        }
    }

    pub fn guards(&self) -> Guards {
        self.guards.clone()
    }

    /// Reconciles a cluster whenever the index reports a change, when a
    /// not-yet-converged cluster's backoff elapses, when this controller
    /// acquires the lease, and periodically.
    pub async fn run(mut self) {
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel();
        let mut interval = time::interval(self.config.reconciliation_period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            let ids = tokio::select! {
                id = self.triggers.recv() => match id {
                    Some(id) => vec![id],
                    None => {
                        debug!("Index closed; stopping");
                        return;
                    }
                },
                Some(id) = requeue_rx.recv() => {
                    self.requeued.lock().remove(&id);
                    vec![id]
                }
                _ = interval.tick() => self.index.read().cluster_ids(),
                res = self.claims.changed() => {
                    if res.is_err() {
                        debug!("Lease manager stopped");
                        return;
                    }
                    self.index.read().cluster_ids()
                }
            };

            for id in ids {
                self.reconcile(id, &requeue_tx);
            }
        }
    }

    fn reconcile(&mut self, id: ResourceId, requeue: &mpsc::UnboundedSender<ResourceId>) {
        let observation = self.index.read().observe(&id);
        let observation = match observation {
            Some(Ok(observation)) => observation,
            Some(Err(error)) => {
                // The instances keep their current state until the declaration
                // is fixed.
                warn!(cluster = %id, %error, "Invalid fencing declaration");
                return;
            }
            None => {
                if self.reconcilers.remove(&id).is_some() {
                    debug!(cluster = %id, "Cluster deleted");
                    self.guards.write().remove(&id);
                    let _ = self.statuses.try_send(status::Update { id, status: None });
                }
                return;
            }
        };

        if !self.claims.borrow().is_current_for(&self.hostname) {
            debug!(cluster = %id, "Not the lease holder; skipping reconciliation");
            return;
        }

        let reconciler = self.reconciler(&id);
        let statuses = self.statuses.clone();
        let requeued = self.requeued.clone();
        let requeue = requeue.clone();
        let span = info_span!("cluster", namespace = %id.namespace, name = %id.name);
        tokio::spawn(
            async move {
                let convergence = reconciler.reconcile(&observation).await;
                debug!(converged = convergence.converged, "Reconciled");

                let update = status::Update {
                    id: id.clone(),
                    status: Some(status::make_status(&convergence)),
                };
                if statuses.send(update).await.is_err() {
                    debug!("Status controller stopped");
                }

                let Some(delay) = convergence.retry_after else {
                    return;
                };
                if !requeued.lock().insert(id.clone()) {
                    return;
                }
                time::sleep(delay).await;
                let _ = requeue.send(id);
            }
            .instrument(span),
        );
    }

    fn reconciler(&mut self, id: &ResourceId) -> Arc<ClusterReconciler> {
        if let Some(reconciler) = self.reconcilers.get(id) {
            return reconciler.clone();
        }

        let control = PodExec::new(
            self.client.clone(),
            &id.namespace,
            self.config.container.clone(),
            self.config.pgdata.clone(),
        );
        let executor = MeteredExecutor::new(
            Executor::new(control, self.config.executor_timeout),
            self.metrics.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(executor, self.config.retry));
        self.guards.write().insert(id.clone(), reconciler.guard());
        self.reconcilers.insert(id.clone(), reconciler.clone());
        reconciler
    }
}
