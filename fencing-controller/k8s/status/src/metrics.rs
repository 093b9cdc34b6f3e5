use prometheus_client::{metrics::counter::Counter, registry::Registry};

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    pub(crate) patch_succeeded: Counter,
    pub(crate) patch_failed: Counter,
    pub(crate) patch_timeout: Counter,
    pub(crate) patch_skipped: Counter,
}

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Counter of successful Cluster status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Counter of failed Cluster status patches",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Counter of Cluster status patches that timed out",
            patch_timeout.clone(),
        );

        let patch_skipped = Counter::default();
        prom.register(
            "patch_skipped",
            "Counter of status updates dropped because this controller does not hold the lease",
            patch_skipped.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
            patch_skipped,
        }
    }
}
