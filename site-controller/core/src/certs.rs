//! Certificate authorities and the credentials they sign.
//!
//! Authorities and credentials are stored as secrets holding `tls.crt` and
//! `tls.key`; credentials also carry their issuer's certificate as `ca.crt`.

use crate::{
    k8s::{
        names::{
            CA_CERT_KEY, LOCAL_CA_SECRET, ROUTER_SERVICE, SITE_CA_SECRET, SITE_SERVER_SECRET,
            TLS_CERT_KEY, TLS_KEY_KEY,
        },
        ResourceExt, Secret,
    },
    secret::{self, SecretExt},
    store::{self, SharedSecrets},
};
use chrono::{Datelike, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use std::net::IpAddr;
use thiserror::Error;

/// Days a generated certificate remains valid.
pub const VALIDITY_DAYS: i64 = 5 * 365;

#[derive(Debug, Error)]
pub enum Error {
    #[error("site not initialized: certificate authority {0:?} not found")]
    CaNotFound(String),

    #[error("certificate authority {name:?} is invalid: {reason}")]
    InvalidCa { name: String, reason: String },

    #[error("failed to generate certificate {name:?}: {source}")]
    Generate {
        name: String,
        #[source]
        source: rcgen::Error,
    },

    #[error(transparent)]
    Store(#[from] store::Error),
}

/// A certificate authority loaded from its secret.
pub struct CertificateAuthority {
    name: String,
    params: CertificateParams,
    key: KeyPair,
    cert_pem: String,
}

/// Creates and rotates the site's certificate authorities and credentials.
#[derive(Clone)]
pub struct CertificateManager {
    secrets: SharedSecrets,
}

// === impl CertificateAuthority ===

impl CertificateAuthority {
    pub fn from_secret(secret: &Secret) -> Result<Self, Error> {
        let name = secret.name_any();
        let invalid = |reason: String| Error::InvalidCa {
            name: name.clone(),
            reason,
        };

        let cert_pem = secret
            .data_str(TLS_CERT_KEY)
            .ok_or_else(|| invalid(format!("missing {TLS_CERT_KEY}")))?;
        let key_pem = secret
            .data_str(TLS_KEY_KEY)
            .ok_or_else(|| invalid(format!("missing {TLS_KEY_KEY}")))?;
        let key = KeyPair::from_pem(key_pem).map_err(|e| invalid(e.to_string()))?;
        let params =
            CertificateParams::from_ca_cert_pem(cert_pem).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            name,
            params,
            key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The PEM-encoded certificate that relying parties trust.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Signs a new client/server credential for `subject` that is valid for
    /// each of `hosts`.
    pub fn sign(&self, name: &str, subject: &str, hosts: &[String]) -> Result<Secret, Error> {
        let generate = |source| Error::Generate {
            name: name.to_string(),
            source,
        };

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(subject);
        params.subject_alt_names = hosts
            .iter()
            .map(|host| subject_alt_name(host))
            .collect::<Result<_, _>>()
            .map_err(generate)?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        set_validity(&mut params);

        let key = KeyPair::generate().map_err(generate)?;
        let issuer = self
            .params
            .clone()
            .self_signed(&self.key)
            .map_err(generate)?;
        let cert = params
            .signed_by(&key, &issuer, &self.key)
            .map_err(generate)?;

        let mut secret = tls_secret(name, cert.pem(), key.serialize_pem());
        secret.set_data(CA_CERT_KEY, self.cert_pem.clone());
        Ok(secret)
    }
}

/// Generates a self-signed certificate authority stored as `name`.
pub fn generate_ca(name: &str) -> Result<Secret, Error> {
    let generate = |source| Error::Generate {
        name: name.to_string(),
        source,
    };

    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(generate)?;
    params.distinguished_name = distinguished_name(name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params);

    let key = KeyPair::generate().map_err(generate)?;
    let cert = params.self_signed(&key).map_err(generate)?;
    Ok(tls_secret(name, cert.pem(), key.serialize_pem()))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

fn subject_alt_name(host: &str) -> Result<SanType, rcgen::Error> {
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(SanType::IpAddress(ip)),
        Err(_) => Ok(SanType::DnsName(host.try_into()?)),
    }
}

fn set_validity(params: &mut CertificateParams) {
    let now = Utc::now();
    params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
    let expiry = now + chrono::Duration::days(VALIDITY_DAYS);
    params.not_after =
        rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

    // Positive, non-zero 128-bit serial.
    let mut serial = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut serial);
    serial[0] = (serial[0] & 0x7f) | 0x01;
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));
}

fn tls_secret(name: &str, cert_pem: String, key_pem: String) -> Secret {
    let mut secret = secret::named(name);
    secret.set_data(TLS_CERT_KEY, cert_pem);
    secret.set_data(TLS_KEY_KEY, key_pem);
    secret
}

// === impl CertificateManager ===

impl CertificateManager {
    pub fn new(secrets: SharedSecrets) -> Self {
        Self { secrets }
    }

    /// Creates the named authority unless it already exists, returning the
    /// stored authority either way.
    pub async fn create_ca(&self, name: &str) -> Result<Secret, Error> {
        if let Some(existing) = self.secrets.get(name).await? {
            tracing::debug!(%name, "Certificate authority already exists");
            return Ok(existing);
        }

        match self.secrets.create(generate_ca(name)?).await {
            Ok(created) => {
                tracing::info!(%name, "Created certificate authority");
                Ok(created)
            }
            // Lost a race with another creator; theirs is authoritative.
            Err(store::Error::AlreadyExists { .. }) => self
                .secrets
                .get(name)
                .await?
                .ok_or_else(|| Error::CaNotFound(name.to_string())),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn load_ca(&self, name: &str) -> Result<CertificateAuthority, Error> {
        let secret = self
            .secrets
            .get(name)
            .await?
            .ok_or_else(|| Error::CaNotFound(name.to_string()))?;
        CertificateAuthority::from_secret(&secret)
    }

    /// Signs a credential with the named authority without storing it.
    pub async fn issue_credential(
        &self,
        name: &str,
        subject: &str,
        hosts: &[String],
        ca: &str,
    ) -> Result<Secret, Error> {
        let ca = self.load_ca(ca).await?;
        let secret = ca.sign(name, subject, hosts)?;
        tracing::debug!(%name, %subject, ca = %ca.name(), ?hosts, "Issued credential");
        Ok(secret)
    }

    /// Replaces the named authority with a freshly generated one.
    ///
    /// Nothing signed by the previous authority verifies against the new one.
    pub async fn regenerate(&self, name: &str) -> Result<Secret, Error> {
        let secret = self.store(generate_ca(name)?).await?;
        tracing::info!(%name, "Regenerated certificate authority");
        Ok(secret)
    }

    /// Replaces the named credential with one newly signed by `ca`.
    pub async fn regenerate_credential(
        &self,
        name: &str,
        subject: &str,
        hosts: &[String],
        ca: &str,
    ) -> Result<Secret, Error> {
        let credential = self.issue_credential(name, subject, hosts, ca).await?;
        let secret = self.store(credential).await?;
        tracing::info!(%name, %ca, "Regenerated credential");
        Ok(secret)
    }

    /// Ensures the site's authorities and router server credential exist.
    pub async fn ensure_site_credentials(&self, server_hosts: &[String]) -> Result<(), Error> {
        self.create_ca(LOCAL_CA_SECRET).await?;
        self.create_ca(SITE_CA_SECRET).await?;

        if self.secrets.get(SITE_SERVER_SECRET).await?.is_some() {
            return Ok(());
        }
        let credential = self
            .issue_credential(SITE_SERVER_SECRET, ROUTER_SERVICE, server_hosts, SITE_CA_SECRET)
            .await?;
        match self.secrets.create(credential).await {
            Ok(_) => {
                tracing::info!(name = %SITE_SERVER_SECRET, "Created site server credential");
                Ok(())
            }
            Err(store::Error::AlreadyExists { .. }) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Writes `secret` over any existing secret of the same name.
    async fn store(&self, mut secret: Secret) -> Result<Secret, Error> {
        match self.secrets.get(&secret.name_any()).await? {
            Some(current) => {
                secret.metadata.resource_version = current.metadata.resource_version;
                Ok(self.secrets.replace(secret).await?)
            }
            None => Ok(self.secrets.create(secret).await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{memory::Secrets, SecretStore};
    use std::sync::Arc;
    use x509_parser::{extensions::GeneralName, pem::parse_x509_pem};

    fn verifies(cert_pem: &[u8], ca_pem: &[u8]) -> bool {
        let (_, cert) = parse_x509_pem(cert_pem).unwrap();
        let (_, ca) = parse_x509_pem(ca_pem).unwrap();
        let cert = cert.parse_x509().unwrap();
        let ca = ca.parse_x509().unwrap();
        cert.verify_signature(Some(ca.public_key())).is_ok()
    }

    #[test]
    fn signs_credentials_with_requested_hosts() {
        let ca = CertificateAuthority::from_secret(&generate_ca("test-ca").unwrap()).unwrap();
        let hosts = vec!["east.example.com".to_string(), "10.0.0.7".to_string()];
        let credential = ca.sign("link1", "link1", &hosts).unwrap();

        let cert_pem = credential.data_bytes(TLS_CERT_KEY).unwrap();
        assert!(verifies(cert_pem, ca.cert_pem().as_bytes()));
        assert_eq!(
            credential.data_str(CA_CERT_KEY),
            Some(ca.cert_pem()),
            "credentials carry their issuer"
        );

        let (_, pem) = parse_x509_pem(cert_pem).unwrap();
        let cert = pem.parse_x509().unwrap();
        let sans = cert
            .subject_alternative_name()
            .unwrap()
            .expect("credential must have SANs");
        let dns_names = sans
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::DNSName(name) => Some(*name),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(dns_names, vec!["east.example.com"]);
        assert!(sans
            .value
            .general_names
            .iter()
            .any(|n| matches!(n, GeneralName::IPAddress(ip) if *ip == [10, 0, 0, 7])));
        assert!(!cert.is_ca());
    }

    #[test]
    fn rejects_incomplete_authorities() {
        let mut ca = generate_ca("test-ca").unwrap();
        ca.data.as_mut().unwrap().remove(TLS_KEY_KEY);
        assert!(matches!(
            CertificateAuthority::from_secret(&ca),
            Err(Error::InvalidCa { .. })
        ));
    }

    #[tokio::test]
    async fn create_ca_is_idempotent() {
        let certs = CertificateManager::new(Arc::new(Secrets::default()));
        let first = certs.create_ca(SITE_CA_SECRET).await.unwrap();
        let second = certs.create_ca(SITE_CA_SECRET).await.unwrap();
        assert_eq!(first.data, second.data);
    }

    #[tokio::test]
    async fn issuing_requires_an_authority() {
        let certs = CertificateManager::new(Arc::new(Secrets::default()));
        let err = certs
            .issue_credential("link1", "link1", &[], SITE_CA_SECRET)
            .await
            .err()
            .expect("issuing must fail");
        assert!(matches!(err, Error::CaNotFound(_)), "{err}");
        assert!(err.to_string().contains("not initialized"));
    }

    #[tokio::test]
    async fn regenerated_authority_disowns_earlier_credentials() {
        let certs = CertificateManager::new(Arc::new(Secrets::default()));
        certs.create_ca(SITE_CA_SECRET).await.unwrap();
        let before = certs
            .issue_credential("link1", "link1", &[], SITE_CA_SECRET)
            .await
            .unwrap();

        let ca = certs.regenerate(SITE_CA_SECRET).await.unwrap();
        let ca_pem = ca.data_bytes(TLS_CERT_KEY).unwrap();
        assert!(!verifies(before.data_bytes(TLS_CERT_KEY).unwrap(), ca_pem));

        let after = certs
            .issue_credential("link2", "link2", &[], SITE_CA_SECRET)
            .await
            .unwrap();
        assert!(verifies(after.data_bytes(TLS_CERT_KEY).unwrap(), ca_pem));
    }

    #[tokio::test]
    async fn ensures_site_credentials_once() {
        let secrets = Arc::new(Secrets::default());
        let certs = CertificateManager::new(secrets.clone());
        let hosts = vec![ROUTER_SERVICE.to_string()];
        certs.ensure_site_credentials(&hosts).await.unwrap();
        let server = secrets.get(SITE_SERVER_SECRET).await.unwrap().unwrap();

        certs.ensure_site_credentials(&hosts).await.unwrap();
        let again = secrets.get(SITE_SERVER_SECRET).await.unwrap().unwrap();
        assert_eq!(server.data, again.data);
        assert_eq!(
            secrets.names(),
            vec![LOCAL_CA_SECRET, SITE_CA_SECRET, SITE_SERVER_SECRET]
        );
    }
}
