#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod labels;
mod resource_id;

pub use self::{
    cluster::{Cluster, ClusterSpec, ClusterStatus, FencingStatus},
    resource_id::ResourceId,
};
pub use k8s_openapi::{
    api::{
        self,
        coordination::v1::Lease,
        core::v1::{ContainerStatus, Pod, PodSpec, PodStatus},
    },
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Status, Time},
};
pub use kube::{
    api::{Api, AttachParams, ObjectMeta, Patch, PatchParams, ResourceExt},
    error::ErrorResponse,
    runtime::watcher,
    Client, Error, Resource,
};
