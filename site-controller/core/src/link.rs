//! Applies tokens issued by remote sites as outgoing links.

use crate::{
    claims::ClaimExchange,
    k8s::{
        names::{COST_ANNOTATION, GENERATED_BY_ANNOTATION, TYPE_LABEL, TYPE_TOKEN},
        ResourceExt, Secret,
    },
    policy::{Action, ClusterPolicyValidator},
    retry::{self, Backoff},
    router::{Connector, Role, SslProfile},
    secret::SecretExt,
    site::Site,
    store::{self, SharedRouterConfig, SharedSecrets, Versioned},
    token::{ConnectionToken, Token},
    Error, Result,
};
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkOptions {
    /// Names the link; a random name is used when unset.
    pub name: Option<String>,
    pub cost: Option<u32>,
}

/// An outgoing link as configured on the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkStatus {
    pub name: String,
    pub host: String,
    pub port: String,
    pub role: Role,
    pub cost: Option<u32>,
    /// The site that issued the link's token, when its secret is present.
    pub remote_site: Option<String>,
}

/// How the link secret was written before the router was configured.
#[derive(Debug)]
enum Stored {
    Created,
    Unchanged,
    Replaced(Secret),
}

#[derive(Clone)]
pub struct LinkApplier {
    site: Arc<Site>,
    routers: SharedRouterConfig,
    secrets: SharedSecrets,
    policy: ClusterPolicyValidator,
    claims: Option<Arc<dyn ClaimExchange>>,
    backoff: Backoff,
}

impl LinkApplier {
    pub fn new(
        site: Arc<Site>,
        routers: SharedRouterConfig,
        secrets: SharedSecrets,
        policy: ClusterPolicyValidator,
    ) -> Self {
        Self {
            site,
            routers,
            secrets,
            policy,
            claims: None,
            backoff: Backoff::default(),
        }
    }

    /// Enables applying claim tokens by redeeming them through `claims`.
    pub fn with_claims(mut self, claims: Arc<dyn ClaimExchange>) -> Self {
        self.claims = Some(claims);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Creates an outgoing link from a connection or claim token.
    ///
    /// Applying the same token under the same name again leaves the router
    /// configuration unchanged.
    pub async fn apply_token(&self, secret: Secret, options: LinkOptions) -> Result<Connector> {
        let token = Token::try_from(secret)?;
        self.check_origin(token.generated_by())?;
        self.site.check_compatible(token.site_version())?;

        let role = Role::for_mode(self.routers.get().await?.value.mode());
        let token = match token {
            Token::Connection(token) => {
                self.check_destination(&token, role).await?;
                token
            }
            Token::Claim(claim) => {
                self.policy
                    .require(Action::OutgoingLink {
                        hostname: claim.host().to_string(),
                    })
                    .await?;
                let exchange = self.claims.as_ref().ok_or_else(|| {
                    Error::InvalidToken("claim tokens cannot be redeemed by this site".to_string())
                })?;
                let token = exchange
                    .redeem(&claim, &self.site.id, &self.site.version)
                    .await
                    .map_err(|source| Error::ClaimExchange {
                        url: claim.url().to_string(),
                        source,
                    })?;
                self.check_origin(token.generated_by())?;
                self.check_destination(&token, role).await?;
                token
            }
        };

        let name = options
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(generate_name);
        let stored = self.store_token(&name, &token, options.cost).await?;

        let connector = match retry::on_conflict(self.backoff, || {
            self.add_connector(&name, &token, options.cost)
        })
        .await
        {
            Ok(connector) => connector,
            Err(error) => {
                self.restore_token(&name, stored).await;
                return Err(error);
            }
        };
        tracing::info!(
            link = %name,
            host = %connector.host,
            port = %connector.port,
            role = %connector.role,
            remote_site = ?token.generated_by(),
            "Applied link"
        );
        Ok(connector)
    }

    /// Removes a link, returning whether it existed.
    pub async fn remove_link(&self, name: &str) -> Result<bool> {
        let removed = retry::on_conflict(self.backoff, || self.remove_connector(name)).await?;
        let deleted = match self.secrets.get(name).await? {
            Some(secret) if secret.label(TYPE_LABEL) == Some(TYPE_TOKEN) => {
                match self.secrets.delete(name).await {
                    Ok(()) => true,
                    Err(error) if error.is_not_found() => false,
                    Err(error) => return Err(error.into()),
                }
            }
            _ => false,
        };
        if removed || deleted {
            tracing::info!(link = %name, "Removed link");
        }
        Ok(removed || deleted)
    }

    pub async fn list_links(&self) -> Result<Vec<LinkStatus>> {
        let config = self.routers.get().await?.value;
        let secrets = self.secrets.list(TYPE_TOKEN).await?;
        Ok(config
            .links()
            .map(|c| LinkStatus {
                name: c.name.clone(),
                host: c.host.clone(),
                port: c.port.clone(),
                role: c.role,
                cost: c.cost,
                remote_site: secrets
                    .iter()
                    .find(|s| s.name_any() == c.name)
                    .and_then(|s| s.annotation(GENERATED_BY_ANNOTATION))
                    .map(str::to_string),
            })
            .collect())
    }

    fn check_origin(&self, generated_by: Option<&str>) -> Result<()> {
        match generated_by {
            Some(id) if id == self.site.id => Err(Error::SelfConnection),
            Some(_) => Ok(()),
            None => Err(Error::InvalidToken(
                "token does not identify the site that generated it".to_string(),
            )),
        }
    }

    async fn check_destination(&self, token: &ConnectionToken, role: Role) -> Result<()> {
        let endpoint = token
            .endpoint(role)
            .ok_or_else(|| Error::InvalidToken(format!("token has no {role} endpoint")))?;
        self.policy
            .require(Action::OutgoingLink {
                hostname: endpoint.host,
            })
            .await?;
        Ok(())
    }

    /// Stores the token's credentials as the link secret, refusing to link
    /// the same remote site twice.
    async fn store_token(
        &self,
        name: &str,
        token: &ConnectionToken,
        cost: Option<u32>,
    ) -> Result<Stored> {
        let remote = token.generated_by().unwrap_or_default();
        for existing in self.secrets.list(TYPE_TOKEN).await? {
            let existing_name = existing.name_any();
            if existing_name != name && existing.annotation(GENERATED_BY_ANNOTATION) == Some(remote)
            {
                return Err(Error::AlreadyLinked {
                    site_id: remote.to_string(),
                    link: existing_name,
                });
            }
        }

        let mut secret = token.secret().clone();
        secret.metadata = Default::default();
        secret.metadata.name = Some(name.to_string());
        secret.metadata.labels = token.secret().metadata.labels.clone();
        secret.metadata.annotations = token.secret().metadata.annotations.clone();
        if let Some(cost) = cost {
            secret.set_annotation(COST_ANNOTATION, cost.to_string());
        }

        match self.secrets.create(secret.clone()).await {
            Ok(_) => Ok(Stored::Created),
            Err(store::Error::AlreadyExists { .. }) => {
                let current = self.secrets.get(name).await?.ok_or_else(|| {
                    store::Error::NotFound {
                        kind: "secret",
                        name: name.to_string(),
                    }
                })?;
                if current.label(TYPE_LABEL) != Some(TYPE_TOKEN)
                    || current.annotation(GENERATED_BY_ANNOTATION) != Some(remote)
                {
                    return Err(store::Error::AlreadyExists {
                        kind: "secret",
                        name: name.to_string(),
                    }
                    .into());
                }
                if current.data == secret.data && current.annotations() == secret.annotations() {
                    return Ok(Stored::Unchanged);
                }
                secret.metadata.resource_version = current.metadata.resource_version.clone();
                self.secrets.replace(secret).await?;
                tracing::debug!(link = %name, "Updated link credentials");
                Ok(Stored::Replaced(current))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Undoes [`Self::store_token`] after the router could not be configured,
    /// so that no link secret outlives its connector.
    async fn restore_token(&self, name: &str, stored: Stored) {
        let restored = match stored {
            Stored::Unchanged => return,
            Stored::Created => match self.secrets.delete(name).await {
                Err(error) if error.is_not_found() => Ok(()),
                res => res,
            },
            Stored::Replaced(mut previous) => match self.secrets.get(name).await {
                Ok(Some(current)) => {
                    previous.metadata.resource_version = current.metadata.resource_version;
                    self.secrets.replace(previous).await.map(|_| ())
                }
                Ok(None) => Ok(()),
                Err(error) => Err(error),
            },
        };
        match restored {
            Ok(()) => tracing::debug!(link = %name, "Restored link credentials"),
            Err(error) => tracing::warn!(link = %name, %error, "Failed to restore link credentials"),
        }
    }

    async fn add_connector(
        &self,
        name: &str,
        token: &ConnectionToken,
        cost: Option<u32>,
    ) -> Result<Connector> {
        let Versioned {
            value: mut config,
            version,
        } = self.routers.get().await?;

        let role = Role::for_mode(config.mode());
        let endpoint = token
            .endpoint(role)
            .ok_or_else(|| Error::InvalidToken(format!("token has no {role} endpoint")))?;
        let profile = SslProfile::for_link(name, token.has_client_credential());
        let connector = Connector {
            name: name.to_string(),
            role,
            host: endpoint.host,
            port: endpoint.port.to_string(),
            cost,
            ssl_profile: Some(profile.name.clone()),
            max_frame_size: self.site.tuning.max_frame_size,
            max_session_frames: self.site.tuning.max_session_frames,
        };

        let profile_changed = config.upsert_ssl_profile(profile);
        let connector_changed = config.upsert_connector(connector.clone());
        if profile_changed || connector_changed {
            self.routers.compare_and_swap(config, &version).await?;
        } else {
            tracing::debug!(link = %name, "Router already configured");
        }
        Ok(connector)
    }

    async fn remove_connector(&self, name: &str) -> Result<bool> {
        let Versioned {
            value: mut config,
            version,
        } = self.routers.get().await?;
        let removed = config.remove_connector(name).is_some();
        let profile_removed = config
            .remove_ssl_profile(&SslProfile::name_for(name))
            .is_some();
        if removed || profile_removed {
            self.routers.compare_and_swap(config, &version).await?;
        }
        Ok(removed)
    }
}

fn generate_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("link-{}", &id[..8])
}
