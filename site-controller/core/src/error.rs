use crate::{certs, claims::ClaimError, policy::PolicyDenied, resolve, store};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("edge sites cannot accept incoming connections")]
    EdgeCannotAcceptLinks,

    #[error(transparent)]
    PolicyDenied(#[from] PolicyDenied),

    #[error(transparent)]
    Certs(#[from] certs::Error),

    #[error(transparent)]
    Resolve(#[from] resolve::Error),

    #[error("cannot link to this site with a token it generated")]
    SelfConnection,

    #[error("already linked to site {site_id:?} by {link:?}")]
    AlreadyLinked { site_id: String, link: String },

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("remote site version {remote:?} is not compatible: {reason}")]
    IncompatibleVersion { remote: String, reason: String },

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error("failed to redeem claim at {url}: {source:#}")]
    ClaimExchange {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to restart the router: {0:#}")]
    Restart(#[source] anyhow::Error),

    #[error("update abandoned after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: store::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(#[from] store::Error),
}

impl Error {
    /// Indicates whether the error reflects a request the caller is not
    /// permitted to make, as opposed to a failure of this site.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::EdgeCannotAcceptLinks
                | Self::PolicyDenied(_)
                | Self::SelfConnection
                | Self::AlreadyLinked { .. }
                | Self::InvalidToken(_)
                | Self::IncompatibleVersion { .. }
                | Self::Claim(_)
                | Self::InvalidArgument(_)
        )
    }
}
