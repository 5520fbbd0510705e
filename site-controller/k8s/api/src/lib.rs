#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod names;
pub mod policy;

pub use self::{
    labels::{Labels, Selector},
    policy::{ClusterPolicy, ClusterPolicySpec},
};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::Deployment,
        core::v1::{ConfigMap, Namespace, Secret, Service, ServicePort, ServiceSpec},
        networking::v1::Ingress,
    },
    ByteString,
};
pub use kube::{
    api::{
        Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, ObjectMeta,
        Patch, PatchParams, PostParams, ResourceExt,
    },
    Client, Error, Resource,
};
