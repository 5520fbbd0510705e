//! Persistence seams for secrets and the router configuration.
//!
//! Every mutation of an existing object is conditional on the version that
//! was read, so concurrent writers observe a [`Error::Conflict`] rather than
//! silently overwriting each other.

pub mod memory;

use crate::{k8s::Secret, router::RouterConfig};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub type SharedSecrets = Arc<dyn SecretStore>;
pub type SharedRouterConfig = Arc<dyn RouterConfigStore>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name:?} was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A value paired with the opaque version it was read at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: String,
}

/// Secrets in the site's namespace.
///
/// Secrets returned by the store carry their current resource version.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Secret>, Error>;

    /// Lists the secrets labeled with the given artifact type.
    async fn list(&self, kind: &str) -> Result<Vec<Secret>, Error>;

    async fn create(&self, secret: Secret) -> Result<Secret, Error>;

    /// Replaces a secret, failing with [`Error::Conflict`] when its resource
    /// version does not match the stored one.
    async fn replace(&self, secret: Secret) -> Result<Secret, Error>;

    async fn delete(&self, name: &str) -> Result<(), Error>;
}

/// The single router configuration document of a site.
#[async_trait]
pub trait RouterConfigStore: Send + Sync {
    async fn get(&self) -> Result<Versioned<RouterConfig>, Error>;

    /// Stores `config` if the document is still at `version`, returning the
    /// new version.
    async fn compare_and_swap(&self, config: RouterConfig, version: &str)
        -> Result<String, Error>;
}

// === impl Error ===

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
