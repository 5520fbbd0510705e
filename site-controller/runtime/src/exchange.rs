use crate::{
    core::{
        claims::ClaimExchange,
        token::{ClaimToken, ConnectionToken},
    },
    k8s::{names::SITE_NAME_HEADER, Secret},
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Redeems claims against the issuing site's claims endpoint over HTTPS,
/// trusting the certificate authority carried by the claim.
#[derive(Clone, Debug)]
pub struct HttpsClaimExchange {
    timeout: Duration,
}

impl HttpsClaimExchange {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(&self, claim: &ClaimToken) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(ca) = claim.ca_cert() {
            let ca = reqwest::Certificate::from_pem(ca).context("invalid claim CA certificate")?;
            builder = builder.add_root_certificate(ca);
        }
        Ok(builder.build()?)
    }
}

#[async_trait]
impl ClaimExchange for HttpsClaimExchange {
    async fn redeem(
        &self,
        claim: &ClaimToken,
        site_name: &str,
        site_version: &str,
    ) -> Result<ConnectionToken> {
        let url = format!("{}?site-version={site_version}", claim.url());
        tracing::debug!(%url, "Redeeming claim");
        let rsp = self
            .client(claim)?
            .post(&url)
            .header(SITE_NAME_HEADER, site_name)
            .body(claim.password().to_vec())
            .send()
            .await?;

        let status = rsp.status();
        let body = rsp.text().await?;
        if !status.is_success() {
            bail!("claim request failed with {status}: {}", body.trim());
        }
        let secret = serde_yaml::from_str::<Secret>(&body)
            .context("could not parse connection token")?;
        Ok(ConnectionToken::try_from(secret)?)
    }
}
