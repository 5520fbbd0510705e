use crate::{
    certs::CertificateManager,
    k8s::{
        names::{ROUTER_SERVICE, SITE_CA_SECRET, SITE_SERVER_SECRET, TYPE_CLAIM_RECORD},
        ResourceExt,
    },
    resolve::{self, EndpointResolver},
    site::Site,
    store::SharedSecrets,
    Error, Result,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Restarts the site's router so that it reloads its credentials.
#[async_trait]
pub trait RouterRestarter: Send + Sync {
    async fn restart(&self) -> anyhow::Result<()>;
}

/// Invalidates every credential this site has issued.
#[derive(Clone)]
pub struct RevocationManager {
    site: Arc<Site>,
    secrets: SharedSecrets,
    certs: CertificateManager,
    resolver: EndpointResolver,
    restarter: Arc<dyn RouterRestarter>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Revocation {
    /// Outstanding claims that can no longer be redeemed.
    pub claims_deleted: usize,
}

impl RevocationManager {
    pub fn new(
        site: Arc<Site>,
        secrets: SharedSecrets,
        resolver: EndpointResolver,
        restarter: Arc<dyn RouterRestarter>,
    ) -> Self {
        Self {
            certs: CertificateManager::new(secrets.clone()),
            site,
            secrets,
            resolver,
            restarter,
        }
    }

    /// Deletes outstanding claims, regenerates the site CA and the router's
    /// server credential, then restarts the router.
    ///
    /// Links created from earlier tokens fail to authenticate once the
    /// router has restarted. The local CA and the site's own outgoing links
    /// are unaffected.
    pub async fn revoke_access(&self) -> Result<Revocation> {
        // Resolve first so that a resolution failure leaves everything intact.
        let endpoints = self.resolver.resolve_router().await?;
        let hosts = resolve::site_server_hosts(&self.site.namespace, &endpoints);

        let mut claims_deleted = 0;
        for record in self.secrets.list(TYPE_CLAIM_RECORD).await? {
            let name = record.name_any();
            match self.secrets.delete(&name).await {
                Ok(()) => claims_deleted += 1,
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error.into()),
            }
        }

        self.certs.regenerate(SITE_CA_SECRET).await?;
        self.certs
            .regenerate_credential(SITE_SERVER_SECRET, ROUTER_SERVICE, &hosts, SITE_CA_SECRET)
            .await?;

        self.restarter.restart().await.map_err(Error::Restart)?;
        tracing::info!(claims_deleted, ?hosts, "Revoked access to this site");
        Ok(Revocation { claims_deleted })
    }
}
