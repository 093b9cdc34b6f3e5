//! Publishes fencing progress on the `Cluster` status subresource.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod metrics;

#[cfg(test)]
mod tests;

pub use self::{
    controller::{make_status, Controller, Update},
    metrics::ControllerMetrics,
};

pub const STATUS_CONTROLLER_NAME: &str = "fencing-controller";
