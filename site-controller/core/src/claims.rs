//! Redemption of claim tokens for connection tokens.
//!
//! The issuing site stores a claim record holding the password, the number
//! of remaining uses and the expiry. Each redemption consumes one use with a
//! conditional update, so concurrent redemptions never exceed the limit.

use crate::{
    issue::TokenIssuer,
    k8s::{
        names::{
            CLAIMS_MADE_ANNOTATION, CLAIMS_REMAINING_ANNOTATION, CLAIM_EXPIRATION_ANNOTATION,
            CLAIM_PASSWORD_KEY, GENERATED_BY_ANNOTATION, SITE_VERSION_ANNOTATION, TYPE_LABEL,
            TYPE_CLAIM_RECORD,
        },
        ResourceExt, Secret,
    },
    retry::{self, Backoff},
    secret::{self, SecretExt},
    site::Site,
    store::SharedSecrets,
    token::{ClaimToken, ConnectionToken},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("no such claim {0:?}")]
    NotFound(String),

    #[error("claim {0:?} has expired")]
    Expired(String),

    #[error("claim {0:?} has no remaining uses")]
    Exhausted(String),

    #[error("claim {0:?} refused: incorrect password")]
    Refused(String),

    #[error("claim {name:?} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },
}

/// The issuing site's record of an outstanding claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimRecord {
    pub name: String,
    pub password: Vec<u8>,
    pub remaining: u32,
    pub made: u32,
    pub expiration: DateTime<Utc>,
    pub site_id: String,
    pub site_version: String,
    resource_version: Option<String>,
}

/// Exchanges a claim token with the issuing site's claims endpoint.
#[async_trait]
pub trait ClaimExchange: Send + Sync {
    async fn redeem(
        &self,
        claim: &ClaimToken,
        site_name: &str,
        site_version: &str,
    ) -> anyhow::Result<ConnectionToken>;
}

/// Serves claim redemptions on the issuing site.
#[derive(Clone)]
pub struct ClaimRedeemer {
    site: Arc<Site>,
    secrets: SharedSecrets,
    issuer: TokenIssuer,
    backoff: Backoff,
}

// === impl ClaimError ===

impl ClaimError {
    /// Indicates the claim is unknown to the caller, which includes claims
    /// that have been used up or have expired.
    pub fn is_not_found(&self) -> bool {
        !matches!(self, Self::Refused(_))
    }
}

// === impl ClaimRecord ===

impl ClaimRecord {
    pub fn new(
        name: impl Into<String>,
        password: Vec<u8>,
        uses: u32,
        expiration: DateTime<Utc>,
        site: &Site,
    ) -> Self {
        Self {
            name: name.into(),
            password,
            remaining: uses,
            made: 0,
            expiration,
            site_id: site.id.clone(),
            site_version: site.version.clone(),
            resource_version: None,
        }
    }

    pub fn from_secret(secret: &Secret) -> Result<Self, ClaimError> {
        let name = secret.name_any();
        if secret.label(TYPE_LABEL) != Some(TYPE_CLAIM_RECORD) {
            return Err(ClaimError::NotFound(name));
        }
        let corrupt = |reason: String| ClaimError::Corrupt {
            name: name.clone(),
            reason,
        };

        let password = secret
            .data_bytes(CLAIM_PASSWORD_KEY)
            .ok_or_else(|| corrupt("missing password".to_string()))?
            .to_vec();
        let remaining = secret
            .annotation(CLAIMS_REMAINING_ANNOTATION)
            .unwrap_or("0")
            .parse()
            .map_err(|e| corrupt(format!("invalid remaining claims: {e}")))?;
        let made = secret
            .annotation(CLAIMS_MADE_ANNOTATION)
            .unwrap_or("0")
            .parse()
            .map_err(|e| corrupt(format!("invalid claims made: {e}")))?;
        let expiration = secret
            .annotation(CLAIM_EXPIRATION_ANNOTATION)
            .ok_or_else(|| corrupt("missing expiration".to_string()))
            .and_then(|ts| {
                DateTime::parse_from_rfc3339(ts)
                    .map_err(|e| corrupt(format!("invalid expiration: {e}")))
            })?
            .with_timezone(&Utc);

        Ok(Self {
            password,
            remaining,
            made,
            expiration,
            site_id: secret
                .annotation(GENERATED_BY_ANNOTATION)
                .unwrap_or_default()
                .to_string(),
            site_version: secret
                .annotation(SITE_VERSION_ANNOTATION)
                .unwrap_or_default()
                .to_string(),
            resource_version: secret.metadata.resource_version.clone(),
            name,
        })
    }

    pub fn to_secret(&self) -> Secret {
        let mut secret = secret::named(&self.name);
        secret.metadata.resource_version = self.resource_version.clone();
        secret.set_label(TYPE_LABEL, TYPE_CLAIM_RECORD);
        secret.set_annotation(
            CLAIM_EXPIRATION_ANNOTATION,
            self.expiration.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        secret.set_annotation(CLAIMS_REMAINING_ANNOTATION, self.remaining.to_string());
        secret.set_annotation(CLAIMS_MADE_ANNOTATION, self.made.to_string());
        secret.set_annotation(GENERATED_BY_ANNOTATION, self.site_id.clone());
        secret.set_annotation(SITE_VERSION_ANNOTATION, self.site_version.clone());
        secret.set_data(CLAIM_PASSWORD_KEY, self.password.clone());
        secret
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }

    pub fn password_matches(&self, password: &[u8]) -> bool {
        self.password.as_slice().ct_eq(password).into()
    }
}

// === impl ClaimRedeemer ===

impl ClaimRedeemer {
    pub fn new(site: Arc<Site>, secrets: SharedSecrets, issuer: TokenIssuer) -> Self {
        Self {
            site,
            secrets,
            issuer,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Consumes one use of the named claim and issues a connection token to
    /// the redeeming site.
    ///
    /// A use is only consumed once this site is known to be able to issue the
    /// token.
    pub async fn redeem(
        &self,
        name: &str,
        password: &[u8],
        site_name: Option<&str>,
        remote_version: Option<&str>,
    ) -> Result<ConnectionToken> {
        self.site.check_compatible(remote_version)?;
        let grant = self.issuer.grant_connection().await?;
        retry::on_conflict(self.backoff, || self.consume(name, password)).await?;

        let subject = site_name.filter(|s| !s.is_empty()).unwrap_or(name);
        let (token, _) = self.issuer.connection_token(subject, &grant)?;
        tracing::info!(claim = %name, %subject, "Redeemed claim");
        Ok(token)
    }

    async fn consume(&self, name: &str, password: &[u8]) -> Result<()> {
        let secret = self
            .secrets
            .get(name)
            .await?
            .ok_or_else(|| ClaimError::NotFound(name.to_string()))?;
        let mut record = ClaimRecord::from_secret(&secret)?;

        if record.is_expired(Utc::now()) {
            self.discard(name).await;
            return Err(ClaimError::Expired(name.to_string()).into());
        }
        if !record.password_matches(password) {
            return Err(ClaimError::Refused(name.to_string()).into());
        }
        if record.remaining == 0 {
            self.discard(name).await;
            return Err(ClaimError::Exhausted(name.to_string()).into());
        }

        record.remaining -= 1;
        record.made += 1;
        match self.secrets.replace(record.to_secret()).await {
            Ok(_) => {}
            // Consumed and discarded by a concurrent redemption.
            Err(error) if error.is_not_found() => {
                return Err(ClaimError::NotFound(name.to_string()).into())
            }
            Err(error) => return Err(error.into()),
        }
        tracing::debug!(claim = %name, remaining = record.remaining, "Consumed claim");

        if record.remaining == 0 {
            self.discard(name).await;
        }
        Ok(())
    }

    async fn discard(&self, name: &str) {
        match self.secrets.delete(name).await {
            Ok(()) => tracing::debug!(claim = %name, "Deleted claim record"),
            Err(error) if error.is_not_found() => {}
            Err(error) => tracing::warn!(claim = %name, %error, "Failed to delete claim record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_through_secrets() {
        let site = Site {
            id: "site-a".to_string(),
            version: "1.4.0".to_string(),
            ..Default::default()
        };
        let expiration = DateTime::parse_from_rfc3339("2030-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = ClaimRecord::new("claim1", b"pw".to_vec(), 3, expiration, &site);

        let secret = record.to_secret();
        assert_eq!(
            secret.annotation(CLAIM_EXPIRATION_ANNOTATION),
            Some("2030-01-02T03:04:05Z")
        );
        assert_eq!(secret.annotation(CLAIMS_REMAINING_ANNOTATION), Some("3"));
        assert_eq!(ClaimRecord::from_secret(&secret).unwrap(), record);
    }

    #[test]
    fn rejects_corrupt_records() {
        let record = ClaimRecord::new("claim1", b"pw".to_vec(), 1, Utc::now(), &Site::default());
        let mut secret = record.to_secret();
        secret.set_annotation(CLAIMS_REMAINING_ANNOTATION, "-1");
        assert!(matches!(
            ClaimRecord::from_secret(&secret),
            Err(ClaimError::Corrupt { .. })
        ));

        let mut other = record.to_secret();
        other.set_label(TYPE_LABEL, "connection-token");
        assert_eq!(
            ClaimRecord::from_secret(&other),
            Err(ClaimError::NotFound("claim1".to_string()))
        );
    }

    #[test]
    fn compares_passwords() {
        let record = ClaimRecord::new("c", b"secret".to_vec(), 1, Utc::now(), &Site::default());
        assert!(record.password_matches(b"secret"));
        assert!(!record.password_matches(b"secreT"));
        assert!(!record.password_matches(b"secret2"));
        assert!(!record.password_matches(b""));
    }
}
