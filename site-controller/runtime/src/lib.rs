#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use van_site_controller_core as core;
pub use van_site_controller_k8s_api as k8s;
pub use van_site_controller_k8s_store as store;

mod api;
mod args;
mod controller;
mod exchange;
mod metrics;

pub use self::{args::Args, exchange::HttpsClaimExchange};
