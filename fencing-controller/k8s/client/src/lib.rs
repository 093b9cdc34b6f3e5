//! Kubernetes-backed implementations of the fencing core's collaborators.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod declarations;
mod exec;

pub use self::{declarations::ClusterDeclarations, exec::PodExec};
