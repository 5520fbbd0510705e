//! The router configuration document shared by every component that alters
//! the router's topology.

use crate::site::RouterMode;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Directory under which link credentials are mounted in the router.
pub const CERTS_DIR: &str = "/etc/skupper-router-certs";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default)]
    pub router: RouterMetadata,

    #[serde(default)]
    pub listeners: BTreeMap<String, Listener>,

    #[serde(default)]
    pub connectors: BTreeMap<String, Connector>,

    #[serde(default)]
    pub ssl_profiles: BTreeMap<String, SslProfile>,

    #[serde(default)]
    pub site_metadata: SiteMetadata,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterMetadata {
    pub id: String,
    #[serde(default)]
    pub mode: RouterMode,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteMetadata {
    pub id: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    InterRouter,
    Edge,
    Normal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_profile: Option<String>,
    #[serde(default)]
    pub authenticate_peer: bool,
}

/// An outgoing router connection to a remote site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub name: String,
    pub role: Role,
    pub host: String,
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frame_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_session_frames: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<String>,
}

// === impl RouterConfig ===

impl RouterConfig {
    pub fn new(site_id: impl Into<String>, mode: RouterMode, version: impl Into<String>) -> Self {
        let id = site_id.into();
        Self {
            router: RouterMetadata {
                id: id.clone(),
                mode,
            },
            site_metadata: SiteMetadata {
                id,
                version: version.into(),
            },
            ..Default::default()
        }
    }

    pub fn mode(&self) -> RouterMode {
        self.router.mode
    }

    pub fn is_edge(&self) -> bool {
        self.router.mode == RouterMode::Edge
    }

    /// Adds or replaces a connector, returning whether the config changed.
    pub fn upsert_connector(&mut self, connector: Connector) -> bool {
        if self.connectors.get(&connector.name) == Some(&connector) {
            return false;
        }
        self.connectors.insert(connector.name.clone(), connector);
        true
    }

    pub fn remove_connector(&mut self, name: &str) -> Option<Connector> {
        self.connectors.remove(name)
    }

    /// Adds or replaces an SSL profile, returning whether the config changed.
    pub fn upsert_ssl_profile(&mut self, profile: SslProfile) -> bool {
        if self.ssl_profiles.get(&profile.name) == Some(&profile) {
            return false;
        }
        self.ssl_profiles.insert(profile.name.clone(), profile);
        true
    }

    pub fn remove_ssl_profile(&mut self, name: &str) -> Option<SslProfile> {
        self.ssl_profiles.remove(name)
    }

    /// Connectors that link this site to other sites.
    pub fn links(&self) -> impl Iterator<Item = &Connector> + '_ {
        self.connectors
            .values()
            .filter(|c| matches!(c.role, Role::InterRouter | Role::Edge))
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

// === impl Role ===

impl Role {
    /// The role a connector must take to reach a site from a router in
    /// `mode`.
    pub fn for_mode(mode: RouterMode) -> Self {
        match mode {
            RouterMode::Interior => Self::InterRouter,
            RouterMode::Edge => Self::Edge,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InterRouter => "inter-router",
            Self::Edge => "edge",
            Self::Normal => "normal",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl SslProfile ===

impl SslProfile {
    /// The profile for the link credentials stored in `secret`.
    pub fn for_link(secret: &str, client_auth: bool) -> Self {
        let file = |name: &str| format!("{CERTS_DIR}/{secret}/{name}");
        Self {
            name: Self::name_for(secret),
            ca_cert_file: Some(file("ca.crt")),
            cert_file: client_auth.then(|| file("tls.crt")),
            private_key_file: client_auth.then(|| file("tls.key")),
        }
    }

    pub fn name_for(secret: &str) -> String {
        format!("{secret}-profile")
    }
}
