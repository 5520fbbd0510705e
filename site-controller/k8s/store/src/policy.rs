use crate::{
    core::policy::PolicySource,
    is_unavailable,
    k8s::{Api, ClusterPolicy, Client, Labels, ListParams, Namespace, Resource},
};
use async_trait::async_trait;

/// Reads cluster policies and namespace labels through the API server.
///
/// Enforcement is disabled when the policy CRD is not installed or this
/// controller may not read it.
#[derive(Clone)]
pub struct KubePolicySource {
    client: Client,
}

impl KubePolicySource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn crd_installed(&self) -> anyhow::Result<bool> {
        let api_version = ClusterPolicy::api_version(&());
        match self.client.list_api_group_resources(&api_version).await {
            Ok(list) => {
                let kind = ClusterPolicy::kind(&());
                Ok(list.resources.iter().any(|r| r.kind == kind))
            }
            Err(error) if is_unavailable(&error) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl PolicySource for KubePolicySource {
    async fn cluster_policies(&self) -> anyhow::Result<Option<Vec<ClusterPolicy>>> {
        if !self.crd_installed().await? {
            tracing::debug!("Cluster policy resource not found; policy is disabled");
            return Ok(None);
        }
        let api = Api::<ClusterPolicy>::all(self.client.clone());
        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(Some(list.items)),
            Err(error) if is_unavailable(&error) => {
                tracing::warn!(%error, "Cannot read cluster policies; policy is disabled");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn namespace_labels(&self, namespace: &str) -> anyhow::Result<Labels> {
        let api = Api::<Namespace>::all(self.client.clone());
        let ns = api.get(namespace).await?;
        Ok(Labels::from(ns.metadata.labels))
    }
}
