#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use pg_fencing_controller_core as core;
pub use pg_fencing_controller_k8s_api as k8s;
pub use pg_fencing_controller_k8s_client as client;
pub use pg_fencing_controller_k8s_index as index;
pub use pg_fencing_controller_k8s_status as status;

mod admission;
mod args;
mod controller;
mod lease;
mod metrics;

pub use self::args::Args;
