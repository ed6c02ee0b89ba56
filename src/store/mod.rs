//! Persistence contract and row types.
//!
//! The core owns multi-step consistency; each adapter call is atomic on its
//! own. `MemoryStore` is the in-process adapter used by default and in
//! tests; database-backed adapters implement the same trait downstream.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{EntityConfiguration, EntityStatement};
use crate::errors::Result;
use crate::jose::JwkSet;
use crate::trust::chain::{MetadataType, TrustChain};

pub use memory::MemoryStore;

/// Persistent projection of a fetched entity statement, keyed by
/// `(subject, issuer)`. `subject == issuer` for self-assertions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntityInfo {
    pub subject: String,
    pub issuer: String,
    pub iat: i64,
    pub exp: i64,
    pub payload: Value,
    pub jwt: String,
    pub modified_at: DateTime<Utc>,
}

impl CachedEntityInfo {
    pub fn from_entity_configuration(ec: &EntityConfiguration) -> Self {
        Self {
            subject: ec.sub.clone(),
            issuer: ec.iss.clone(),
            iat: ec.iat,
            exp: ec.exp,
            payload: ec.payload.clone(),
            jwt: ec.jwt.clone(),
            modified_at: Utc::now(),
        }
    }

    pub fn from_statement(statement: &EntityStatement) -> Self {
        Self {
            subject: statement.sub.clone(),
            issuer: statement.iss.clone(),
            iat: statement
                .payload
                .get("iat")
                .and_then(Value::as_i64)
                .unwrap_or_default(),
            exp: statement.exp,
            payload: statement.payload.clone(),
            jwt: statement.jwt.clone(),
            modified_at: Utc::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.exp < Utc::now().timestamp()
    }
}

/// The Relying Party's own published identity, including private key
/// material. Created by onboarding; mutated when trust marks arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationEntity {
    pub subject: String,
    pub jwks: JwkSet,
    pub metadata: Value,
    pub authority_hints: Vec<String>,
    pub trust_marks: Vec<Value>,
    pub trust_marks_issuers: Value,
    pub constraints: Value,
    pub entity_type: String,
    pub default_expire_minutes: i64,
    pub default_signature_alg: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// One outbound authorization request, stored before the user is
/// redirected. `data` holds the full parameter set including the PKCE
/// `code_verifier`; `state` is the unique lookup key for the callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequestRecord {
    pub client_id: String,
    pub state: String,
    pub endpoint: String,
    pub provider: String,
    pub provider_jwks: JwkSet,
    pub provider_configuration: Value,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait FederationStore: Send + Sync {
    async fn fetch_federation_entity(&self, subject: &str) -> Result<Option<FederationEntity>>;
    async fn store_federation_entity(&self, entity: FederationEntity) -> Result<FederationEntity>;

    async fn fetch_entity_info(&self, subject: &str, issuer: &str)
        -> Result<Option<CachedEntityInfo>>;
    /// Upsert keyed by `(subject, issuer)`.
    async fn store_entity_info(&self, info: CachedEntityInfo) -> Result<CachedEntityInfo>;
    async fn invalidate_entity_info(&self, subject: &str, issuer: &str) -> Result<()>;

    async fn fetch_trust_chain(
        &self,
        subject: &str,
        trust_anchor: &str,
        metadata_type: MetadataType,
    ) -> Result<Option<TrustChain>>;
    /// Every stored chain terminating at the given anchor.
    async fn fetch_trust_chains_by_anchor(&self, trust_anchor: &str) -> Result<Vec<TrustChain>>;
    /// Any stored `openid_provider` chain for the subject, whatever anchor.
    async fn fetch_oidc_provider(&self, subject: &str) -> Result<Option<TrustChain>>;
    /// Upsert keyed by `(subject, trust_anchor, metadata_type)`. A rebuild
    /// overwrites the row in place, preserving the administrative `active`
    /// flag and the original `created_at`.
    async fn store_trust_chain(&self, chain: TrustChain) -> Result<TrustChain>;
    /// Administrative disable. Returns whether a row was found.
    async fn deactivate_trust_chain(
        &self,
        subject: &str,
        trust_anchor: &str,
        metadata_type: MetadataType,
    ) -> Result<bool>;

    /// Write-once insert keyed by `state`.
    async fn store_auth_request(&self, record: AuthRequestRecord) -> Result<AuthRequestRecord>;
    async fn fetch_auth_request(&self, state: &str) -> Result<Option<AuthRequestRecord>>;
}
