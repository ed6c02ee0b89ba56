use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unknown kid '{0}'")]
    UnknownKid(String),

    #[error("unsupported algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("no usable jwks for {0}")]
    MissingJwks(String),

    #[error("trust anchor '{0}' is not in the configured allow-list")]
    InvalidTrustAnchor(String),

    #[error("provider is required")]
    MissingProvider,

    #[error("trust chain for {subject} disabled by administrator at {modified_at}")]
    TrustChainDisabled {
        subject: String,
        modified_at: DateTime<Utc>,
    },

    #[error("no valid trust chain for {0}")]
    InvalidTrustChain(String),

    #[error("no '{metadata_type}' metadata for {subject}")]
    MissingMetadata {
        subject: String,
        metadata_type: String,
    },

    #[error("metadata policy violation: {0}")]
    MetadataPolicy(String),

    #[error("well-known subject '{found}' does not match configured client_id '{expected}'")]
    MismatchedSubject { expected: String, found: String },

    #[error("relying party federation entity is absent or inactive")]
    MissingConfiguration,

    #[error("an auth request with state '{0}' already exists")]
    ConflictingState(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// True for the failure kinds the trust-chain walk tolerates: the walk
    /// logs them and tries the next superior instead of aborting.
    pub fn is_walk_recoverable(&self) -> bool {
        matches!(
            self,
            Error::FetchFailed(_) | Error::UnknownKid(_) | Error::MissingJwks(_)
        )
    }
}
