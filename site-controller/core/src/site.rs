use crate::{resolve::Ingress, Error, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The oldest site version this site will link with or issue tokens to.
pub const MINIMUM_COMPATIBLE_VERSION: &str = "0.8.0";

/// The local site's identity and configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Site {
    /// Unique identifier stamped into every token this site generates.
    pub id: String,
    pub namespace: String,
    pub mode: RouterMode,
    pub version: String,
    pub ingress: Ingress,
    pub tuning: RouterTuning,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouterMode {
    #[default]
    Interior,
    Edge,
}

/// Optional link tuning applied to every connector this site creates.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterTuning {
    pub max_frame_size: Option<u32>,
    pub max_session_frames: Option<u32>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    major: u64,
    minor: u64,
    patch: u64,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid version {0:?}")]
pub struct InvalidVersion(String);

// === impl Site ===

impl Site {
    pub fn is_edge(&self) -> bool {
        self.mode == RouterMode::Edge
    }

    /// Checks that a peer running `remote` may interoperate with this site.
    ///
    /// A peer that is not older than this site is always accepted. An older
    /// peer must be at least [`MINIMUM_COMPATIBLE_VERSION`]. When the local
    /// version is not a release version every peer is accepted.
    pub fn check_compatible(&self, remote: Option<&str>) -> Result<()> {
        let Ok(local) = self.version.parse::<Version>() else {
            return Ok(());
        };

        let remote_str = remote.unwrap_or_default();
        let incompatible = |reason: String| Error::IncompatibleVersion {
            remote: remote_str.to_string(),
            reason,
        };

        let remote = remote_str
            .parse::<Version>()
            .map_err(|e| incompatible(e.to_string()))?;
        if remote >= local {
            return Ok(());
        }

        let minimum = Version::minimum_compatible();
        if remote < minimum {
            return Err(incompatible(format!("minimum compatible version is {minimum}")));
        }
        Ok(())
    }
}

// === impl RouterMode ===

impl RouterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interior => "interior",
            Self::Edge => "edge",
        }
    }
}

impl FromStr for RouterMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "interior" => Ok(Self::Interior),
            "edge" => Ok(Self::Edge),
            s => Err(Error::InvalidArgument(format!("unknown router mode {s:?}"))),
        }
    }
}

impl fmt::Display for RouterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Version ===

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn minimum_compatible() -> Self {
        Self::new(0, 8, 0)
    }
}

impl FromStr for Version {
    type Err = InvalidVersion;

    /// Parses `[v]MAJOR[.MINOR[.PATCH]]`, ignoring any pre-release or build
    /// suffix.
    fn from_str(s: &str) -> Result<Self, InvalidVersion> {
        let invalid = || InvalidVersion(s.to_string());
        let core = s
            .trim()
            .trim_start_matches('v')
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        if core.is_empty() {
            return Err(invalid());
        }

        let mut parts = [0u64; 3];
        let mut fields = core.split('.');
        for part in parts.iter_mut() {
            match fields.next() {
                Some(field) => *part = field.parse().map_err(|_| invalid())?,
                None => break,
            }
        }
        if fields.next().is_some() {
            return Err(invalid());
        }

        let [major, minor, patch] = parts;
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_versions() {
        for (input, expected) in [
            ("1.4.2", Some(Version::new(1, 4, 2))),
            ("v1.4.2", Some(Version::new(1, 4, 2))),
            ("1.4", Some(Version::new(1, 4, 0))),
            ("2", Some(Version::new(2, 0, 0))),
            ("1.5.0-rc1", Some(Version::new(1, 5, 0))),
            ("0.8.7+build.3", Some(Version::new(0, 8, 7))),
            ("", None),
            ("main", None),
            ("1.2.3.4", None),
            ("1.x", None),
        ] {
            assert_eq!(input.parse::<Version>().ok(), expected, "{input:?}");
        }
        assert_eq!(
            MINIMUM_COMPATIBLE_VERSION.parse::<Version>(),
            Ok(Version::minimum_compatible())
        );
    }

    #[test]
    fn checks_compatibility() {
        let site = Site {
            version: "1.4.0".to_string(),
            ..Default::default()
        };
        for (remote, ok, msg) in [
            (Some("1.4.0"), true, "same version"),
            (Some("1.5.1"), true, "newer peer"),
            (Some("0.9.0"), true, "older but supported"),
            (Some("0.8.0"), true, "minimum"),
            (Some("0.7.9"), false, "older than minimum"),
            (Some("garbage"), false, "unparseable"),
            (None, false, "missing"),
        ] {
            assert_eq!(site.check_compatible(remote).is_ok(), ok, "{msg}");
        }

        let dev = Site {
            version: "main".to_string(),
            ..Default::default()
        };
        assert!(dev.check_compatible(Some("0.1.0")).is_ok());
        assert!(dev.check_compatible(None).is_ok());
    }

    #[test]
    fn parses_router_modes() {
        assert_eq!("edge".parse::<RouterMode>().ok(), Some(RouterMode::Edge));
        assert_eq!(
            "interior".parse::<RouterMode>().ok(),
            Some(RouterMode::Interior)
        );
        assert!("leaf".parse::<RouterMode>().is_err());
        assert_eq!(RouterMode::Edge.to_string(), "edge");
    }
}
