//! PostgreSQL cluster fencing
//!
//! Fencing stops a database instance from accepting client connections while
//! leaving it provisioned and keeping its place in the cluster's
//! primary/replica topology. The set of fenced instances is declared on the
//! cluster (see [`FencingSet`]) and mutated through [`command`]s; a
//! [`reconcile::Reconciler`] drives every live instance toward the declared
//! state through an [`executor::Execute`] implementation:
//!
//! ```text
//! [ command ] -> [ DeclarationStore ] -> [ Reconciler ] -> [ Executor ] -> [ instance ]
//!                                              |
//!                                       [ TopologyGuard ]
//! ```
//!
//! Per-instance progress is tracked as a [`FencingState`]. The state is derived:
//! it is recomputed from the declaration and the live inventory on every pass
//! and is forgotten as soon as an instance leaves the inventory.
//!
//! The [`guard::TopologyGuard`] is a read-only view over the same states that
//! other subsystems consult before changing an instance's role.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod command;
pub mod executor;
mod fencing_set;
pub mod guard;
mod instance;
pub mod reconcile;
mod state;
pub mod store;


pub use self::{
    fencing_set::{FencingSet, ParseError, WILDCARD},
    guard::{RoleViolation, TopologyGuard},
    instance::{InstanceId, InstanceStatus, Role, RoleAssignment},
    reconcile::{Convergence, Observation, Reconciler, RetryPolicy},
    state::{Action, FencingState},
};
