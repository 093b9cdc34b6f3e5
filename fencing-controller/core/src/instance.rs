use serde::{Deserialize, Serialize};
use std::{borrow::Borrow, fmt};

/// The stable name of one cluster member (its pod name).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Primary,
    Replica,
}

/// A live member of a cluster, as reported by the instance inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceStatus {
    pub id: InstanceId,

    /// Whether the instance's database container reports ready.
    ///
    /// The reconciler does not consult readiness. It is part of the observed
    /// status so that readiness changes (such as a fenced instance restarting)
    /// trigger a reconciliation pass.
    pub ready: bool,

    pub role: Role,

    /// Set when the instance carries a persisted fence marker, i.e. it was
    /// fenced by a previous incarnation of the controller.
    pub fence_marker: bool,
}

/// The cluster's primary designation. Every instance that is not the primary is
/// a replica.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleAssignment {
    primary: Option<InstanceId>,
}

// === impl InstanceId ===

impl InstanceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for InstanceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl Role ===

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl RoleAssignment ===

impl RoleAssignment {
    pub fn new(primary: Option<InstanceId>) -> Self {
        Self { primary }
    }

    /// Derives the assignment from the roles the inventory reports.
    pub fn from_instances<'a>(instances: impl IntoIterator<Item = &'a InstanceStatus>) -> Self {
        let primary = instances
            .into_iter()
            .find(|i| i.role == Role::Primary)
            .map(|i| i.id.clone());
        Self { primary }
    }

    pub fn primary(&self) -> Option<&InstanceId> {
        self.primary.as_ref()
    }

    pub fn role_of(&self, id: &InstanceId) -> Role {
        if self.primary.as_ref() == Some(id) {
            Role::Primary
        } else {
            Role::Replica
        }
    }
}
