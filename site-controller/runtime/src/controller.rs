use crate::{
    core::{
        certs::CertificateManager,
        claims::ClaimRedeemer,
        issue::TokenIssuer,
        link::LinkApplier,
        policy::ClusterPolicyValidator,
        resolve::{self, EndpointResolver},
        revoke::RevocationManager,
        store::{SharedRouterConfig, SharedSecrets},
        Site,
    },
    exchange::HttpsClaimExchange,
    k8s::names::ROUTER_SERVICE,
    store::{DeploymentRestarter, KubeIngress, KubePolicySource, KubeRouterConfig, KubeSecrets},
};
use anyhow::Result;
use kube::Client;
use std::{sync::Arc, time::Duration};

/// The site's components, wired to the cluster.
#[derive(Clone)]
pub(crate) struct Controller {
    pub site: Arc<Site>,
    pub certs: CertificateManager,
    pub resolver: EndpointResolver,
    pub policy: ClusterPolicyValidator,
    pub issuer: TokenIssuer,
    pub redeemer: ClaimRedeemer,
    pub links: LinkApplier,
    pub revoker: RevocationManager,
}

impl Controller {
    pub fn new(client: Client, site: Site, resolve_timeout: Duration, claim_timeout: Duration) -> Self {
        let site = Arc::new(site);
        let ns = site.namespace.as_str();

        let secrets: SharedSecrets = Arc::new(KubeSecrets::new(client.clone(), ns));
        let routers: SharedRouterConfig = Arc::new(KubeRouterConfig::new(client.clone(), ns));
        let resolver = EndpointResolver::new(&site, Arc::new(KubeIngress::new(client.clone(), ns)))
            .with_timeout(EndpointResolver::DEFAULT_POLL_INTERVAL, resolve_timeout);
        let policy =
            ClusterPolicyValidator::new(ns, Arc::new(KubePolicySource::new(client.clone())));
        let restarter = Arc::new(DeploymentRestarter::new(client, ns));

        let issuer = TokenIssuer::new(
            site.clone(),
            routers.clone(),
            secrets.clone(),
            resolver.clone(),
            policy.clone(),
        );
        let redeemer = ClaimRedeemer::new(site.clone(), secrets.clone(), issuer.clone());
        let links = LinkApplier::new(site.clone(), routers, secrets.clone(), policy.clone())
            .with_claims(Arc::new(HttpsClaimExchange::new(claim_timeout)));
        let revoker =
            RevocationManager::new(site.clone(), secrets.clone(), resolver.clone(), restarter);

        Self {
            certs: CertificateManager::new(secrets),
            site,
            resolver,
            policy,
            issuer,
            redeemer,
            links,
            revoker,
        }
    }

    /// Creates the site's certificate authorities and the router's server
    /// credential if they do not exist.
    pub async fn init(&self) -> Result<()> {
        // Edge sites accept no links, so their router is only addressed
        // from within the cluster.
        let hosts = if self.site.is_edge() {
            vec![
                ROUTER_SERVICE.to_string(),
                format!("{ROUTER_SERVICE}.{}", self.site.namespace),
            ]
        } else {
            let endpoints = self.resolver.resolve_router().await?;
            resolve::site_server_hosts(&self.site.namespace, &endpoints)
        };
        self.certs.ensure_site_credentials(&hosts).await?;
        tracing::info!(site = %self.site.id, ?hosts, "Initialized site credentials");
        Ok(())
    }
}
