use crate::{reconcile::Instances, FencingState, InstanceId, Role, RoleAssignment};

/// Answers whether an instance's role may change, given its fencing state.
///
/// While an instance is fenced (or being fenced) its role is frozen: it may be
/// neither promoted nor demoted, and a fenced primary stays primary. Primary
/// election and switchover automation consult the guard before acting.
#[derive(Clone, Debug)]
pub struct TopologyGuard {
    instances: Instances,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RoleViolation {
    #[error("instance {instance} is {state}; its role cannot change")]
    Frozen {
        instance: InstanceId,
        state: FencingState,
    },

    #[error("instance {instance} was {expected} when it was fenced but is now {actual}")]
    Changed {
        instance: InstanceId,
        expected: Role,
        actual: Role,
    },
}

// === impl TopologyGuard ===

impl TopologyGuard {
    pub(crate) fn new(instances: Instances) -> Self {
        Self { instances }
    }

    /// Instances the guard does not know about are unconstrained.
    pub fn is_role_change_allowed(&self, id: &InstanceId) -> bool {
        self.instances
            .read()
            .get(id)
            .map_or(true, |slot| !slot.state.is_fencing())
    }

    /// Checks a proposed move of the primary designation from `from` to `to`.
    /// Neither end may be frozen.
    pub fn check_primary_change(
        &self,
        from: Option<&InstanceId>,
        to: Option<&InstanceId>,
    ) -> Result<(), RoleViolation> {
        if from == to {
            return Ok(());
        }

        let instances = self.instances.read();
        for id in [from, to].into_iter().flatten() {
            if let Some(slot) = instances.get(id) {
                if slot.state.is_fencing() {
                    return Err(RoleViolation::Frozen {
                        instance: id.clone(),
                        state: slot.state,
                    });
                }
            }
        }
        Ok(())
    }

    /// Compares the observed roles of fenced instances with the roles they
    /// held when they were fenced.
    pub fn audit(&self, roles: &RoleAssignment) -> Vec<RoleViolation> {
        let instances = self.instances.read();
        let mut violations = instances
            .iter()
            .filter(|(_, slot)| slot.state.is_fencing())
            .filter_map(|(id, slot)| {
                let expected = slot.frozen_role?;
                let actual = roles.role_of(id);
                (expected != actual).then(|| RoleViolation::Changed {
                    instance: id.clone(),
                    expected,
                    actual,
                })
            })
            .collect::<Vec<_>>();
        violations.sort_by(|a, b| a.instance().cmp(b.instance()));
        violations
    }

    pub fn fenced(&self) -> Vec<InstanceId> {
        let mut ids = self
            .instances
            .read()
            .iter()
            .filter(|(_, slot)| slot.state.is_fencing())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

// === impl RoleViolation ===

impl RoleViolation {
    pub fn instance(&self) -> &InstanceId {
        match self {
            Self::Frozen { instance, .. } | Self::Changed { instance, .. } => instance,
        }
    }
}
