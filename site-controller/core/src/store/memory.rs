//! In-process stores, used by tests and by tooling that operates on a
//! detached copy of a site.

use super::{Error, RouterConfigStore, SecretStore, Versioned};
use crate::{
    k8s::{names::TYPE_LABEL, ResourceExt, Secret},
    router::RouterConfig,
    secret::SecretExt,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct Secrets {
    state: Mutex<SecretsState>,
}

#[derive(Debug, Default)]
struct SecretsState {
    secrets: BTreeMap<String, Secret>,
    version: u64,
}

#[derive(Debug)]
pub struct RouterConfigs {
    state: Mutex<ConfigState>,
}

#[derive(Debug)]
struct ConfigState {
    config: RouterConfig,
    version: u64,
    writes: usize,
}

// === impl Secrets ===

impl Secrets {
    pub fn names(&self) -> Vec<String> {
        self.state.lock().secrets.keys().cloned().collect()
    }
}

impl SecretsState {
    fn next_version(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }
}

#[async_trait]
impl SecretStore for Secrets {
    async fn get(&self, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.state.lock().secrets.get(name).cloned())
    }

    async fn list(&self, kind: &str) -> Result<Vec<Secret>, Error> {
        let state = self.state.lock();
        Ok(state
            .secrets
            .values()
            .filter(|s| s.label(TYPE_LABEL) == Some(kind))
            .cloned()
            .collect())
    }

    async fn create(&self, mut secret: Secret) -> Result<Secret, Error> {
        let name = secret.name_any();
        let mut state = self.state.lock();
        if state.secrets.contains_key(&name) {
            return Err(Error::AlreadyExists {
                kind: "secret",
                name,
            });
        }
        secret.metadata.resource_version = state.next_version();
        state.secrets.insert(name, secret.clone());
        Ok(secret)
    }

    async fn replace(&self, mut secret: Secret) -> Result<Secret, Error> {
        let name = secret.name_any();
        let mut state = self.state.lock();
        let current = state
            .secrets
            .get(&name)
            .ok_or_else(|| Error::NotFound {
                kind: "secret",
                name: name.clone(),
            })?;
        if secret.metadata.resource_version.is_some()
            && secret.metadata.resource_version != current.metadata.resource_version
        {
            return Err(Error::Conflict {
                kind: "secret",
                name,
            });
        }
        secret.metadata.resource_version = state.next_version();
        state.secrets.insert(name, secret.clone());
        Ok(secret)
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.state.lock().secrets.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound {
                kind: "secret",
                name: name.to_string(),
            }),
        }
    }
}

// === impl RouterConfigs ===

impl RouterConfigs {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            state: Mutex::new(ConfigState {
                config,
                version: 1,
                writes: 0,
            }),
        }
    }

    pub fn current(&self) -> RouterConfig {
        self.state.lock().config.clone()
    }

    /// The number of successful writes since creation.
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }
}

#[async_trait]
impl RouterConfigStore for RouterConfigs {
    async fn get(&self) -> Result<Versioned<RouterConfig>, Error> {
        let state = self.state.lock();
        Ok(Versioned {
            value: state.config.clone(),
            version: state.version.to_string(),
        })
    }

    async fn compare_and_swap(
        &self,
        config: RouterConfig,
        version: &str,
    ) -> Result<String, Error> {
        let mut state = self.state.lock();
        if state.version.to_string() != version {
            return Err(Error::Conflict {
                kind: "router config",
                name: "router".to_string(),
            });
        }
        state.config = config;
        state.version += 1;
        state.writes += 1;
        Ok(state.version.to_string())
    }
}
