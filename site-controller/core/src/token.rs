//! Connection tokens and claim tokens exchanged between sites.
//!
//! Both are secrets. A connection token carries a client credential and the
//! issuing site's router endpoints; a claim token carries a one-time
//! password and the URL at which it can be exchanged for a connection token.

use crate::{
    k8s::{
        names::{
            CA_CERT_KEY, CLAIM_PASSWORD_KEY, CLAIM_URL_ANNOTATION, EDGE_ROLE,
            GENERATED_BY_ANNOTATION, INTER_ROUTER_ROLE, LOCAL_ACCESS_ONLY_ANNOTATION,
            SITE_VERSION_ANNOTATION, TLS_CERT_KEY, TLS_KEY_KEY, TYPE_CLAIM_REQUEST, TYPE_LABEL,
            TYPE_TOKEN,
        },
        ResourceExt, Secret,
    },
    resolve::HostPort,
    router::Role,
    secret::SecretExt,
    Error, Result,
};
use http::Uri;

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionToken(Secret);

#[derive(Clone, Debug, PartialEq)]
pub struct ClaimToken {
    secret: Secret,
    url: Uri,
}

/// A verified token of either kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Connection(ConnectionToken),
    Claim(ClaimToken),
}

pub(crate) fn host_annotation(role: &str) -> String {
    format!("{role}-host")
}

pub(crate) fn port_annotation(role: &str) -> String {
    format!("{role}-port")
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidToken(reason.into())
}

// === impl Token ===

impl TryFrom<Secret> for Token {
    type Error = Error;

    /// Verifies a token, deducing its kind from its contents when it is not
    /// labeled.
    fn try_from(secret: Secret) -> Result<Self> {
        match secret.label(TYPE_LABEL) {
            Some(TYPE_TOKEN) => ConnectionToken::try_from(secret).map(Self::Connection),
            Some(TYPE_CLAIM_REQUEST) => ClaimToken::try_from(secret).map(Self::Claim),
            Some(other) => Err(invalid(format!("unexpected token type {other:?}"))),
            None if secret.data_bytes(CLAIM_PASSWORD_KEY).is_some()
                && secret.annotation(CLAIM_URL_ANNOTATION).is_some() =>
            {
                ClaimToken::try_from(secret).map(Self::Claim)
            }
            None if secret.data_bytes(CA_CERT_KEY).is_some() => {
                ConnectionToken::try_from(secret).map(Self::Connection)
            }
            None => Err(invalid("cannot determine token type")),
        }
    }
}

impl Token {
    pub fn secret(&self) -> &Secret {
        match self {
            Self::Connection(t) => t.secret(),
            Self::Claim(t) => t.secret(),
        }
    }

    pub fn generated_by(&self) -> Option<&str> {
        self.secret().annotation(GENERATED_BY_ANNOTATION)
    }

    pub fn site_version(&self) -> Option<&str> {
        self.secret().annotation(SITE_VERSION_ANNOTATION)
    }
}

// === impl ConnectionToken ===

impl TryFrom<Secret> for ConnectionToken {
    type Error = Error;

    fn try_from(mut secret: Secret) -> Result<Self> {
        if secret.data_bytes(CA_CERT_KEY).is_none() {
            return Err(invalid(format!("connection token is missing {CA_CERT_KEY}")));
        }
        if secret.data_bytes(TLS_CERT_KEY).is_some() != secret.data_bytes(TLS_KEY_KEY).is_some() {
            return Err(invalid(format!(
                "connection token must carry both {TLS_CERT_KEY} and {TLS_KEY_KEY}"
            )));
        }

        let token = Self(secret.clone());
        let mut endpoints = 0;
        for role in [INTER_ROUTER_ROLE, EDGE_ROLE] {
            let has_host = secret.annotation(&host_annotation(role)).is_some();
            let port = secret.annotation(&port_annotation(role));
            if has_host && token.endpoint_for(role).is_none() {
                return Err(invalid(format!("invalid {role} port {port:?}")));
            }
            endpoints += usize::from(has_host);
        }
        if endpoints == 0 {
            return Err(invalid("connection token has no router endpoints"));
        }

        secret.set_label(TYPE_LABEL, TYPE_TOKEN);
        Ok(Self(secret))
    }
}

impl ConnectionToken {
    /// Wraps a secret built by this site.
    pub(crate) fn new_unchecked(secret: Secret) -> Self {
        Self(secret)
    }

    pub fn name(&self) -> String {
        self.0.name_any()
    }

    pub fn secret(&self) -> &Secret {
        &self.0
    }

    pub fn into_secret(self) -> Secret {
        self.0
    }

    /// The endpoint a connector in the given role should dial.
    pub fn endpoint(&self, role: Role) -> Option<HostPort> {
        self.endpoint_for(role.as_str())
    }

    fn endpoint_for(&self, role: &str) -> Option<HostPort> {
        let host = self.0.annotation(&host_annotation(role))?;
        let port = self.0.annotation(&port_annotation(role))?.parse().ok()?;
        Some(HostPort::new(host, port))
    }

    pub fn generated_by(&self) -> Option<&str> {
        self.0.annotation(GENERATED_BY_ANNOTATION)
    }

    pub fn site_version(&self) -> Option<&str> {
        self.0.annotation(SITE_VERSION_ANNOTATION)
    }

    pub fn is_local_access_only(&self) -> bool {
        self.0.annotation(LOCAL_ACCESS_ONLY_ANNOTATION) == Some("true")
    }

    /// Indicates whether the token carries a client credential.
    pub fn has_client_credential(&self) -> bool {
        self.0.data_bytes(TLS_KEY_KEY).is_some()
    }
}

// === impl ClaimToken ===

impl TryFrom<Secret> for ClaimToken {
    type Error = Error;

    fn try_from(mut secret: Secret) -> Result<Self> {
        let url = secret
            .annotation(CLAIM_URL_ANNOTATION)
            .ok_or_else(|| invalid("claim token has no URL"))?
            .parse::<Uri>()
            .map_err(|e| invalid(format!("claim token URL is invalid: {e}")))?;
        if url.host().map_or(true, str::is_empty) {
            return Err(invalid("claim token URL has no host"));
        }
        if secret
            .data_bytes(CLAIM_PASSWORD_KEY)
            .map_or(true, <[u8]>::is_empty)
        {
            return Err(invalid("claim token has no password"));
        }
        if secret.name_any().is_empty() {
            return Err(invalid("claim token has no name"));
        }

        secret.set_label(TYPE_LABEL, TYPE_CLAIM_REQUEST);
        Ok(Self { secret, url })
    }
}

impl ClaimToken {
    /// The name of the claim record this token redeems.
    pub fn name(&self) -> String {
        self.secret.name_any()
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    pub fn host(&self) -> &str {
        self.url.host().unwrap_or_default()
    }

    pub fn password(&self) -> &[u8] {
        self.secret
            .data_bytes(CLAIM_PASSWORD_KEY)
            .unwrap_or_default()
    }

    /// The certificate authority that signed the claims endpoint's
    /// certificate, when it is not publicly trusted.
    pub fn ca_cert(&self) -> Option<&[u8]> {
        self.secret.data_bytes(CA_CERT_KEY)
    }

    pub fn generated_by(&self) -> Option<&str> {
        self.secret.annotation(GENERATED_BY_ANNOTATION)
    }

    pub fn site_version(&self) -> Option<&str> {
        self.secret.annotation(SITE_VERSION_ANNOTATION)
    }
}
