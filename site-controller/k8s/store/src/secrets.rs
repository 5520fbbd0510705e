use crate::{
    core::store::{self, SecretStore},
    k8s::{
        names::type_selector, Api, Client, DeleteParams, ListParams, PostParams, ResourceExt,
        Secret,
    },
    store_error,
};
use async_trait::async_trait;

const KIND: &str = "secret";

/// Secrets in the site's namespace.
#[derive(Clone)]
pub struct KubeSecrets {
    api: Api<Secret>,
}

impl KubeSecrets {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecrets {
    async fn get(&self, name: &str) -> Result<Option<Secret>, store::Error> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| store_error(KIND, name, e))
    }

    async fn list(&self, kind: &str) -> Result<Vec<Secret>, store::Error> {
        let params = ListParams::default().labels(&type_selector(kind));
        let list = self
            .api
            .list(&params)
            .await
            .map_err(|e| store_error(KIND, kind, e))?;
        Ok(list.items)
    }

    async fn create(&self, mut secret: Secret) -> Result<Secret, store::Error> {
        let name = secret.name_any();
        secret.metadata.resource_version = None;
        let secret = self
            .api
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| store_error(KIND, &name, e))?;
        tracing::debug!(%name, "Created secret");
        Ok(secret)
    }

    async fn replace(&self, secret: Secret) -> Result<Secret, store::Error> {
        let name = secret.name_any();
        // The API server rejects the update when the resource version is stale.
        self.api
            .replace(&name, &PostParams::default(), &secret)
            .await
            .map_err(|e| store_error(KIND, &name, e))
    }

    async fn delete(&self, name: &str) -> Result<(), store::Error> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| store_error(KIND, name, e))?;
        tracing::debug!(%name, "Deleted secret");
        Ok(())
    }
}
