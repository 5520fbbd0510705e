use crate::{
    certs::{CertificateAuthority, CertificateManager},
    claims::ClaimRecord,
    k8s::names::{
        CA_CERT_KEY, CLAIM_PASSWORD_KEY, CLAIM_URL_ANNOTATION, GENERATED_BY_ANNOTATION,
        LOCAL_ACCESS_ONLY_ANNOTATION, SITE_CA_SECRET, SITE_VERSION_ANNOTATION,
        TYPE_CLAIM_REQUEST, TYPE_LABEL, TYPE_TOKEN,
    },
    k8s::Secret,
    policy::{Action, ClusterPolicyValidator},
    resolve::{EndpointResolver, RouterEndpoints},
    secret::{self, SecretExt},
    site::Site,
    store::{SharedRouterConfig, SharedSecrets},
    token::{self, ClaimToken, ConnectionToken},
    Error, Result,
};
use chrono::Utc;
use rand::distributions::{Alphanumeric, DistString};
use std::{sync::Arc, time::Duration};

/// Length of generated claim passwords.
const PASSWORD_LEN: usize = 24;

/// Issues connection tokens and claim tokens that let other sites link to
/// this one.
#[derive(Clone)]
pub struct TokenIssuer {
    site: Arc<Site>,
    routers: SharedRouterConfig,
    secrets: SharedSecrets,
    certs: CertificateManager,
    resolver: EndpointResolver,
    policy: ClusterPolicyValidator,
}

/// Everything a connection token is issued from, gathered before anything
/// is signed.
pub(crate) struct ConnectionGrant {
    ca: CertificateAuthority,
    endpoints: RouterEndpoints,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimOptions {
    /// Names the claim; a random name is used when unset.
    pub name: Option<String>,
    /// The claim password; a random password is used when unset.
    pub password: Option<Vec<u8>>,
    pub expiry: Duration,
    pub uses: u32,
}

impl Default for ClaimOptions {
    fn default() -> Self {
        Self {
            name: None,
            password: None,
            expiry: Duration::from_secs(15 * 60),
            uses: 1,
        }
    }
}

impl TokenIssuer {
    pub fn new(
        site: Arc<Site>,
        routers: SharedRouterConfig,
        secrets: SharedSecrets,
        resolver: EndpointResolver,
        policy: ClusterPolicyValidator,
    ) -> Self {
        Self {
            certs: CertificateManager::new(secrets.clone()),
            site,
            routers,
            secrets,
            resolver,
            policy,
        }
    }

    /// Issues a connection token carrying a client credential for `subject`,
    /// valid for every host the token's endpoints name.
    ///
    /// Returns the token and whether its endpoints are only reachable from
    /// within this site's cluster.
    pub async fn create_connection_token(&self, subject: &str) -> Result<(ConnectionToken, bool)> {
        let grant = self.grant_connection().await?;
        self.connection_token(subject, &grant)
    }

    /// Checks that this site accepts incoming links and resolves the
    /// endpoints and authority a connection token is issued from.
    pub(crate) async fn grant_connection(&self) -> Result<ConnectionGrant> {
        self.accepts_links().await?;
        self.policy.require(Action::IncomingLink).await?;
        let ca = self.certs.load_ca(SITE_CA_SECRET).await?;
        let endpoints = self.resolver.resolve_router().await?;
        Ok(ConnectionGrant { ca, endpoints })
    }

    pub(crate) fn connection_token(
        &self,
        subject: &str,
        grant: &ConnectionGrant,
    ) -> Result<(ConnectionToken, bool)> {
        let endpoints = &grant.endpoints;
        let mut secret = grant.ca.sign(subject, subject, &endpoints.hosts())?;
        secret.set_label(TYPE_LABEL, TYPE_TOKEN);
        for (role, endpoint) in endpoints.by_role() {
            secret.set_annotation(&token::host_annotation(role), endpoint.host.clone());
            secret.set_annotation(&token::port_annotation(role), endpoint.port.to_string());
        }
        let local_only = endpoints.is_local_access_only();
        self.stamp(&mut secret, local_only);

        tracing::info!(
            %subject,
            inter_router = %endpoints.inter_router,
            edge = %endpoints.edge,
            local_only,
            "Issued connection token"
        );
        Ok((ConnectionToken::new_unchecked(secret), local_only))
    }

    /// Records a claim and issues a token that can be redeemed for a
    /// connection token up to `uses` times before `expiry` elapses.
    pub async fn create_claim_token(&self, options: ClaimOptions) -> Result<(ClaimToken, bool)> {
        self.accepts_links().await?;
        if options.uses == 0 {
            return Err(Error::InvalidArgument(
                "a claim must allow at least one use".to_string(),
            ));
        }
        let expiry = chrono::Duration::from_std(options.expiry)
            .ok()
            .filter(|d| *d > chrono::Duration::zero())
            .ok_or_else(|| Error::InvalidArgument("a claim must have a future expiry".to_string()))?;
        self.policy.require(Action::IncomingLink).await?;

        let endpoint = self.resolver.resolve_claims().await?;
        let ca = self.certs.load_ca(SITE_CA_SECRET).await?;

        let name = options
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let password = options
            .password
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| {
                Alphanumeric
                    .sample_string(&mut rand::thread_rng(), PASSWORD_LEN)
                    .into_bytes()
            });

        let record = ClaimRecord::new(
            name.clone(),
            password.clone(),
            options.uses,
            Utc::now() + expiry,
            &self.site,
        );
        self.secrets.create(record.to_secret()).await?;

        let mut secret = secret::named(name.clone());
        secret.set_label(TYPE_LABEL, TYPE_CLAIM_REQUEST);
        secret.set_annotation(CLAIM_URL_ANNOTATION, endpoint.url_for(&name));
        secret.set_data(CLAIM_PASSWORD_KEY, password);
        secret.set_data(CA_CERT_KEY, ca.cert_pem());
        let local_only = endpoint.is_local_access_only();
        self.stamp(&mut secret, local_only);

        tracing::info!(
            claim = %name,
            uses = options.uses,
            expires = %record.expiration,
            "Issued claim token"
        );
        Ok((ClaimToken::try_from(secret)?, local_only))
    }

    /// Edge routers have no listeners for other sites, whatever mode the site
    /// was started with.
    async fn accepts_links(&self) -> Result<()> {
        if self.routers.get().await?.value.is_edge() {
            return Err(Error::EdgeCannotAcceptLinks);
        }
        Ok(())
    }

    fn stamp(&self, secret: &mut Secret, local_only: bool) {
        secret.set_annotation(GENERATED_BY_ANNOTATION, self.site.id.clone());
        secret.set_annotation(SITE_VERSION_ANNOTATION, self.site.version.clone());
        if local_only {
            secret.set_annotation(LOCAL_ACCESS_ONLY_ANNOTATION, "true");
        }
    }
}
