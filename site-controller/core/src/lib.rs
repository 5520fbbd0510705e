#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod certs;
pub mod claims;
mod error;
pub mod issue;
pub mod link;
pub mod policy;
pub mod resolve;
pub mod retry;
pub mod revoke;
pub mod router;
mod secret;
pub mod site;
pub mod store;
pub mod token;


pub use self::{
    error::{Error, Result},
    secret::SecretExt,
    site::{RouterMode, Site, Version},
};
pub use van_site_controller_k8s_api as k8s;
