use crate::{
    core::revoke::RouterRestarter,
    k8s::{names::ROUTER_DEPLOYMENT, Api, Client, Deployment, Patch, PatchParams},
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Restarts the router by touching its pod template, causing a rollout.
#[derive(Clone)]
pub struct DeploymentRestarter {
    api: Api<Deployment>,
    name: String,
}

impl DeploymentRestarter {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: ROUTER_DEPLOYMENT.to_string(),
        }
    }
}

#[async_trait]
impl RouterRestarter for DeploymentRestarter {
    async fn restart(&self) -> anyhow::Result<()> {
        let patch = restart_patch(Utc::now());
        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        tracing::info!(deployment = %self.name, "Restarted router");
        Ok(())
    }
}

fn restart_patch(now: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        RESTARTED_AT_ANNOTATION: now.to_rfc3339_opts(SecondsFormat::Secs, true),
                    }
                }
            }
        }
    })
}
