//! The fencing control loop.
//!
//! A [`Reconciler`] is level-triggered: every call to
//! [`Reconciler::reconcile`] compares the declared [`FencingSet`] with the
//! tracked state of every live instance and issues whatever fence or unfence
//! operations are needed to converge. Passes may run concurrently. Operations
//! on distinct instances proceed in parallel, while each instance holds an
//! exclusive lock for the duration of its operation; a pass that finds an
//! instance busy leaves it to the pass that owns the lock.
//!
//! Failed operations leave the instance in its in-progress state and are
//! retried by a later pass once the instance's backoff has elapsed.
//!
//! An instance's lock outlives its tracked state: if an instance leaves the
//! inventory and returns while an operation on it is still running, the new
//! state waits for that operation to finish, and the old operation's outcome
//! is not applied to the new state.

use crate::{
    executor::Execute, guard::TopologyGuard, state::Action, FencingSet, FencingState, InstanceId,
    InstanceStatus, Role, RoleAssignment, RoleViolation,
};
use ahash::AHashMap as HashMap;
use futures::future;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// A point-in-time view of a cluster's declaration and inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub fencing: FencingSet,
    pub instances: Vec<InstanceStatus>,
    pub roles: RoleAssignment,
}

/// The outcome of a reconciliation pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Convergence {
    pub states: BTreeMap<InstanceId, FencingState>,

    /// True when every live instance is in the state its declaration calls
    /// for.
    pub converged: bool,

    /// When the cluster is not converged, how long to wait before the next
    /// pass.
    pub retry_after: Option<Duration>,

    pub violations: Vec<RoleViolation>,
}

/// Bounds the exponential backoff applied to an instance after failed
/// operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

pub struct Reconciler<E> {
    executor: Arc<E>,
    retry: RetryPolicy,
    instances: Instances,

    /// Per-instance operation locks. An entry is kept while its instance is
    /// live or while an operation still holds it.
    locks: parking_lot::Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,

    generations: AtomicU64,
}

pub(crate) type Instances = Arc<RwLock<HashMap<InstanceId, Slot>>>;

#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) state: FencingState,

    /// The role the instance held when it was fenced.
    pub(crate) frozen_role: Option<Role>,

    /// Distinguishes this slot from earlier slots of the same instance.
    generation: u64,
    backoff: Backoff,
}

#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    not_before: Option<Instant>,
}

struct Operation {
    id: InstanceId,
    generation: u64,
    role: Role,
    action: Action,
    _permit: OwnedMutexGuard<()>,
}

// === impl RetryPolicy ===

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

// === impl Reconciler ===

impl<E: Execute> Reconciler<E> {
    pub fn new(executor: E, retry: RetryPolicy) -> Self {
        Self {
            executor: Arc::new(executor),
            retry,
            instances: Default::default(),
            locks: Default::default(),
            generations: AtomicU64::new(0),
        }
    }

    /// Returns a guard over this reconciler's instance states.
    pub fn guard(&self) -> TopologyGuard {
        TopologyGuard::new(self.instances.clone())
    }

    pub fn state(&self, id: &InstanceId) -> Option<FencingState> {
        self.instances.read().get(id).map(|slot| slot.state)
    }

    pub fn states(&self) -> BTreeMap<InstanceId, FencingState> {
        self.instances
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.state))
            .collect()
    }

    /// Runs a single reconciliation pass, returning once every operation it
    /// issued has completed.
    pub async fn reconcile(&self, observation: &Observation) -> Convergence {
        let declared = observation
            .fencing
            .resolve(observation.instances.iter().map(|i| &i.id));

        let ops = self.plan(observation, &declared);
        if !ops.is_empty() {
            debug!(ops = ops.len(), "Executing fencing operations");
        }
        future::join_all(ops.into_iter().map(|op| self.execute(op))).await;

        self.converge(observation, &declared)
    }

    /// Advances instance states toward the declaration and claims the lock of
    /// every instance that needs an operation.
    fn plan(&self, observation: &Observation, declared: &BTreeSet<InstanceId>) -> Vec<Operation> {
        let now = Instant::now();
        let mut instances = self.instances.write();
        let mut locks = self.locks.lock();
        let is_live = |id: &InstanceId| observation.instances.iter().any(|i| i.id == *id);

        // Instances that left the inventory are forgotten, including any
        // pending request. Their locks stay until in-flight operations end.
        instances.retain(|id, slot| {
            let live = is_live(id);
            if !live {
                debug!(instance = %id, state = %slot.state, "Instance removed; dropping state");
            }
            live
        });
        locks.retain(|id, lock| is_live(id) || Arc::strong_count(lock) > 1);

        let mut ops = Vec::new();
        for status in &observation.instances {
            let lock = locks.entry(status.id.clone()).or_default().clone();
            let slot = instances.entry(status.id.clone()).or_insert_with(|| {
                Slot::adopt(status, self.generations.fetch_add(1, Ordering::Relaxed))
            });

            let Ok(permit) = lock.try_lock_owned() else {
                debug!(instance = %status.id, state = %slot.state, "Operation already in flight");
                continue;
            };

            // Another controller may have fenced an instance this one already
            // tracks as unfenced.
            if slot.state == FencingState::Unfenced && status.fence_marker {
                debug!(instance = %status.id, "Adopting fence marker");
                slot.state = FencingState::FencingRequested;
                slot.frozen_role = Some(status.role);
                slot.backoff = Backoff::default();
            }

            let (next, action) = slot.state.step(declared.contains(&status.id));
            let Some(action) = action else {
                continue;
            };

            if next == slot.state {
                if slot.backoff.pending(now) {
                    continue;
                }
            } else {
                debug!(instance = %status.id, from = %slot.state, to = %next, "Transitioning");
                if next == FencingState::FencingRequested && slot.frozen_role.is_none() {
                    slot.frozen_role = Some(observation.roles.role_of(&status.id));
                }
                slot.state = next;
                slot.backoff = Backoff::default();
            }

            ops.push(Operation {
                id: status.id.clone(),
                generation: slot.generation,
                role: observation.roles.role_of(&status.id),
                action,
                _permit: permit,
            });
        }
        ops
    }

    async fn execute(&self, op: Operation) {
        let Operation {
            id,
            generation,
            role,
            action,
            ..
        } = &op;
        let res = match action {
            Action::Fence => self.executor.fence(id, *role).await,
            Action::Unfence => self.executor.unfence(id, *role).await,
        };

        let mut instances = self.instances.write();
        let slot = instances
            .get_mut(id)
            .filter(|slot| slot.generation == *generation);
        let Some(slot) = slot else {
            debug!(instance = %id, %action, "Instance removed during operation");
            return;
        };
        match res {
            Ok(()) => {
                let state = slot.state.confirm(*action);
                if state != slot.state {
                    info!(instance = %id, %role, %state, "Fencing state converged");
                }
                if state == FencingState::Unfenced {
                    slot.frozen_role = None;
                }
                slot.state = state;
                slot.backoff = Backoff::default();
            }
            Err(error) => {
                let delay = slot.backoff.failed(&self.retry, Instant::now());
                warn!(instance = %id, %action, %error, retry_in = ?delay, "Fencing operation failed");
            }
        }
    }

    fn converge(&self, observation: &Observation, declared: &BTreeSet<InstanceId>) -> Convergence {
        let violations = self.guard().audit(&observation.roles);
        for violation in &violations {
            error!(%violation, "Role assignment changed while fenced");
        }

        let now = Instant::now();
        let instances = self.instances.read();
        let mut converged = true;
        let mut retry_after = None::<Duration>;
        let mut states = BTreeMap::new();
        for status in &observation.instances {
            let Some(slot) = instances.get(&status.id) else {
                continue;
            };
            if !slot.state.is_converged(declared.contains(&status.id)) {
                converged = false;
                let delay = slot.backoff.remaining(now).unwrap_or(self.retry.base);
                retry_after = Some(retry_after.map_or(delay, |d| d.min(delay)));
            }
            states.insert(status.id.clone(), slot.state);
        }

        Convergence {
            states,
            converged,
            retry_after,
            violations,
        }
    }
}

// === impl Slot ===

impl Slot {
    /// Creates the state for a newly observed instance. The marker is written
    /// before connections are refused, so an instance carrying it is only
    /// known to be fencing; the next operation settles it either way.
    fn adopt(status: &InstanceStatus, generation: u64) -> Self {
        let (state, frozen_role) = if status.fence_marker {
            debug!(instance = %status.id, "Adopting fenced instance");
            (FencingState::FencingRequested, Some(status.role))
        } else {
            (FencingState::Unfenced, None)
        };
        Self {
            state,
            frozen_role,
            generation,
            backoff: Backoff::default(),
        }
    }
}

// === impl Backoff ===

impl Backoff {
    fn pending(&self, now: Instant) -> bool {
        self.not_before.is_some_and(|t| now < t)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.not_before
            .map(|t| t.saturating_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    fn failed(&mut self, policy: &RetryPolicy, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = policy.delay(self.failures);
        self.not_before = Some(now + delay);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max() {
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
        };
        let delays = (1..=6).map(|n| policy.delay(n)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 10, 10].map(Duration::from_secs).to_vec()
        );
        assert_eq!(policy.delay(u32::MAX), policy.max);
    }
}
