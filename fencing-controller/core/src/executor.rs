//! Per-instance fencing side effects.

use crate::{InstanceId, Role};
use std::time::Duration;
use tokio::time;
use tracing::debug;

/// How often a freshly unfenced replica is checked for a WAL receiver.
const STREAMING_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Control over whether a database instance accepts client connections.
///
/// Implementations must leave the instance's role metadata and its recovery
/// configuration untouched so that a replica can resume streaming once it
/// accepts connections again.
#[async_trait::async_trait]
pub trait ConnectionControl: Send + Sync {
    async fn is_accepting(&self, instance: &InstanceId) -> anyhow::Result<bool>;

    async fn refuse_connections(&self, instance: &InstanceId) -> anyhow::Result<()>;

    async fn accept_connections(&self, instance: &InstanceId) -> anyhow::Result<()>;

    /// Persists (or clears) a marker on the instance recording that it is
    /// fenced, so that the fence survives a controller restart.
    async fn mark_fenced(&self, instance: &InstanceId, fenced: bool) -> anyhow::Result<()>;

    /// Returns the number of WAL receivers running on the instance.
    async fn wal_receivers(&self, instance: &InstanceId) -> anyhow::Result<u32>;
}

/// Fences and unfences individual instances.
///
/// Both operations are idempotent: invoking either twice in a row leaves the
/// instance in the same state as invoking it once.
#[async_trait::async_trait]
pub trait Execute: Send + Sync {
    async fn fence(&self, instance: &InstanceId, role: Role) -> Result<(), ExecutionError>;

    async fn unfence(&self, instance: &InstanceId, role: Role) -> Result<(), ExecutionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("instance unreachable: {0}")]
    Unreachable(#[source] anyhow::Error),

    #[error("replica is not streaming: expected 1 WAL receiver, found {0}")]
    NotStreaming(u32),
}

/// Executes fencing through a [`ConnectionControl`], bounding every operation
/// by a timeout.
#[derive(Clone, Debug)]
pub struct Executor<C> {
    control: C,
    timeout: Duration,
}

// === impl Executor ===

impl<C> Executor<C> {
    pub fn new(control: C, timeout: Duration) -> Self {
        Self { control, timeout }
    }
}

#[async_trait::async_trait]
impl<C: ConnectionControl> Execute for Executor<C> {
    async fn fence(&self, instance: &InstanceId, role: Role) -> Result<(), ExecutionError> {
        let fence = async {
            // The marker goes first so that an interrupted fence is still
            // adopted after a restart.
            self.control.mark_fenced(instance, true).await?;
            if self.control.is_accepting(instance).await? {
                debug!(%instance, %role, "Refusing connections");
                self.control.refuse_connections(instance).await?;
            }
            Ok::<_, anyhow::Error>(())
        };

        match time::timeout(self.timeout, fence).await {
            Ok(res) => res.map_err(ExecutionError::Unreachable),
            Err(_) => Err(ExecutionError::Timeout(self.timeout)),
        }
    }

    async fn unfence(&self, instance: &InstanceId, role: Role) -> Result<(), ExecutionError> {
        let mut receivers = None;
        let unfence = async {
            if !self.control.is_accepting(instance).await? {
                debug!(%instance, %role, "Accepting connections");
                self.control.accept_connections(instance).await?;
            }

            // A replica must be streaming from its primary again before it
            // counts as unfenced.
            if role == Role::Replica {
                loop {
                    let n = self.control.wal_receivers(instance).await?;
                    receivers = Some(n);
                    if n == 1 {
                        break;
                    }
                    debug!(%instance, receivers = n, "Waiting for replica to resume streaming");
                    time::sleep(STREAMING_POLL_INTERVAL).await;
                }
            }

            self.control.mark_fenced(instance, false).await?;
            Ok::<_, anyhow::Error>(())
        };

        let res = time::timeout(self.timeout, unfence).await;
        match res {
            Ok(res) => res.map_err(ExecutionError::Unreachable),
            Err(_) => match receivers {
                Some(n) if n != 1 => Err(ExecutionError::NotStreaming(n)),
                _ => Err(ExecutionError::Timeout(self.timeout)),
            },
        }
    }
}
