//! Kubernetes implementations of the site controller's persistence and
//! inspection seams.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod ingress;
mod policy;
mod restart;
mod router_config;
mod secrets;

pub use self::{
    ingress::KubeIngress, policy::KubePolicySource, restart::DeploymentRestarter,
    router_config::KubeRouterConfig, secrets::KubeSecrets,
};
pub use van_site_controller_core as core;
pub use van_site_controller_k8s_api as k8s;

use self::core::store;

/// Maps API errors onto the store's conflict and existence errors.
fn store_error(kind: &'static str, name: &str, error: k8s::Error) -> store::Error {
    let name = name.to_string();
    match error {
        k8s::Error::Api(rsp) if rsp.code == 404 => store::Error::NotFound { kind, name },
        k8s::Error::Api(rsp) if rsp.code == 409 && rsp.reason == "AlreadyExists" => {
            store::Error::AlreadyExists { kind, name }
        }
        k8s::Error::Api(rsp) if rsp.code == 409 => store::Error::Conflict { kind, name },
        error => store::Error::Other(error.into()),
    }
}

/// Returns true for errors that indicate the resource type is not served or
/// not visible to this controller.
fn is_unavailable(error: &k8s::Error) -> bool {
    matches!(error, k8s::Error::Api(rsp) if rsp.code == 403 || rsp.code == 404)
}

#[cfg(test)]
fn api_error(code: u16, reason: &str) -> k8s::Error {
    k8s::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} for test"),
        reason: reason.to_string(),
        code,
    })
}
