//! Trust-chain construction.
//!
//! The builder walks from a subject upward through authority hints until it
//! reaches the caller's Trust Anchor, collecting one verified statement per
//! hop. A single superior failing is tolerated (logged, next candidate
//! tried); running out of candidates is not. Anchor trust is axiomatic: the
//! caller hands in an anchor configuration it already validated against the
//! configured allow-list.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::entity::EntityConfiguration;
use crate::errors::{Error, Result};
use crate::fetch::EntityFetcher;
use crate::jose::JoseService;
use crate::store::{CachedEntityInfo, FederationStore};
use crate::trust::policy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataType {
    #[serde(rename = "openid_provider")]
    OpenidProvider,
    #[serde(rename = "openid_relying_party")]
    OpenidRelyingParty,
    #[serde(rename = "federation_entity")]
    FederationEntity,
}

impl MetadataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataType::OpenidProvider => "openid_provider",
            MetadataType::OpenidRelyingParty => "openid_relying_party",
            MetadataType::FederationEntity => "federation_entity",
        }
    }
}

impl fmt::Display for MetadataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Valid,
    Invalid,
}

/// A resolved, ordered sequence of signed statements linking a subject to a
/// Trust Anchor for one metadata type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustChain {
    pub subject: String,
    pub trust_anchor: String,
    pub metadata_type: MetadataType,
    /// Compact JWTs in subject-to-anchor order; the subject's own
    /// configuration first, the anchor's last.
    pub chain: Vec<String>,
    /// Subject URLs mirroring `chain` order.
    pub parties_involved: Vec<String>,
    /// The subject's metadata of `metadata_type` after every policy along
    /// the chain has been applied.
    pub final_metadata: Value,
    /// Minimum `exp` over every statement in the chain.
    pub exp: i64,
    pub verified_trust_marks: Vec<Value>,
    pub status: ChainStatus,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl TrustChain {
    pub fn is_expired(&self) -> bool {
        self.exp < Utc::now().timestamp()
    }
}

pub struct TrustChainBuilder<'a> {
    pub config: &'a Config,
    pub fetcher: &'a EntityFetcher,
    pub jose: &'a JoseService,
    pub store: &'a dyn FederationStore,
}

impl<'a> TrustChainBuilder<'a> {
    /// Resolve a subject's entity configuration through the entity-info
    /// cache: a fresh cached row is reused, anything else is fetched and
    /// upserted.
    pub async fn resolve_entity_configuration(&self, subject: &str) -> Result<EntityConfiguration> {
        if let Some(info) = self.store.fetch_entity_info(subject, subject).await? {
            if !info.is_expired() {
                debug!(subject = %subject, "entity configuration served from cache");
                return EntityConfiguration::parse(&info.jwt);
            }
        }
        let jwt = self.fetcher.entity_configuration(subject).await?;
        let ec = EntityConfiguration::parse(&jwt)?;
        self.store
            .store_entity_info(CachedEntityInfo::from_entity_configuration(&ec))
            .await?;
        Ok(ec)
    }

    /// Walk from `subject` up to the anchor and produce a fully-populated
    /// chain artifact.
    pub async fn build(
        &self,
        subject: &str,
        metadata_type: MetadataType,
        anchor: &EntityConfiguration,
    ) -> Result<TrustChain> {
        if !anchor.valid {
            return Err(Error::InvalidTrustChain(format!(
                "anchor '{}' failed self-validation",
                anchor.sub
            )));
        }

        let mut subject_ec = self.resolve_entity_configuration(subject).await?;
        if !subject_ec.validate_itself(self.jose) {
            return Err(Error::InvalidTrustChain(format!(
                "'{subject}' self-signature did not verify"
            )));
        }
        if !subject_ec.validate_allowed_trust_marks(
            &self.config.allowed_trust_marks,
            anchor,
            self.jose,
        ) {
            return Err(Error::InvalidTrustChain(format!(
                "'{subject}' carries none of the required trust marks"
            )));
        }

        let subject_metadata = subject_ec
            .metadata(metadata_type.as_str())
            .cloned()
            .ok_or_else(|| Error::MissingMetadata {
                subject: subject.to_string(),
                metadata_type: metadata_type.to_string(),
            })?;

        let verified_trust_marks: Vec<Value> = subject_ec
            .trust_marks()
            .into_iter()
            .filter(|mark| {
                mark.get("trust_mark")
                    .and_then(Value::as_str)
                    .map(|jwt| self.jose.verify(jwt, &anchor.jwks).is_ok())
                    .unwrap_or(false)
            })
            .collect();

        let mut chain_jwts = vec![subject_ec.jwt.clone()];
        let mut chain_payloads = vec![subject_ec.payload.clone()];
        let mut parties = vec![subject_ec.sub.clone()];
        let mut min_exp = subject_ec.exp;
        let mut visited: HashSet<String> = HashSet::from([subject_ec.sub.clone()]);

        let mut cur = subject_ec;
        let mut hops = 0usize;
        loop {
            hops += 1;
            if hops > self.config.max_path_len {
                return Err(Error::InvalidTrustChain(format!(
                    "no path from '{subject}' to '{}' within {} hops",
                    anchor.sub, self.config.max_path_len
                )));
            }

            cur.get_superiors(
                self.config.max_authority_hints,
                &[anchor],
                self.fetcher,
                self.jose,
            )
            .await;

            // anchor in sight: close the chain
            if cur.verified_superiors.contains_key(&anchor.sub) {
                cur.validate_by_superiors(&[anchor.sub.clone()], self.fetcher, self.jose)
                    .await;
                if let Some(statement) = cur.verified_by_superiors.get(&anchor.sub) {
                    self.store
                        .store_entity_info(CachedEntityInfo::from_statement(statement))
                        .await?;
                    min_exp = min_exp.min(statement.exp).min(anchor.exp);
                    chain_jwts.push(statement.jwt.clone());
                    chain_payloads.push(statement.payload.clone());
                    chain_jwts.push(anchor.jwt.clone());
                    chain_payloads.push(anchor.payload.clone());
                    parties.push(anchor.sub.clone());
                    break;
                }
                // the anchor would not vouch for this entity; other
                // superiors may still lead somewhere
            }

            let candidates: Vec<String> = cur
                .verified_superiors
                .keys()
                .filter(|sub| !visited.contains(*sub) && **sub != anchor.sub)
                .cloned()
                .collect();

            let mut advanced = false;
            for candidate in candidates {
                cur.validate_by_superiors(&[candidate.clone()], self.fetcher, self.jose)
                    .await;
                let Some(statement) = cur.verified_by_superiors.get(&candidate) else {
                    continue;
                };
                self.store
                    .store_entity_info(CachedEntityInfo::from_statement(statement))
                    .await?;
                min_exp = min_exp.min(statement.exp);
                chain_jwts.push(statement.jwt.clone());
                chain_payloads.push(statement.payload.clone());

                let superior = cur
                    .verified_superiors
                    .remove(&candidate)
                    .expect("candidate came from this map");
                min_exp = min_exp.min(superior.exp);
                parties.push(superior.sub.clone());
                visited.insert(superior.sub.clone());
                debug!(from = %cur.sub, to = %superior.sub, "walk advanced");
                cur = superior;
                advanced = true;
                break;
            }

            if !advanced {
                warn!(subject = %subject, anchor = %anchor.sub, "no superior left to try");
                return Err(Error::InvalidTrustChain(format!(
                    "no verified path from '{subject}' to '{}'",
                    anchor.sub
                )));
            }
        }

        // policies apply anchor-first, down to the subject
        let mut final_metadata = subject_metadata;
        for payload in chain_payloads.iter().rev() {
            if let Some(block_policy) = payload
                .get("metadata_policy")
                .and_then(|p| p.get(metadata_type.as_str()))
            {
                final_metadata = policy::apply_policy(&final_metadata, block_policy)?;
            }
        }
        if final_metadata
            .as_object()
            .map(|o| o.is_empty())
            .unwrap_or(true)
        {
            return Err(Error::MissingMetadata {
                subject: subject.to_string(),
                metadata_type: metadata_type.to_string(),
            });
        }

        let now = Utc::now();
        info!(
            subject = %subject,
            anchor = %anchor.sub,
            parties = parties.len(),
            exp = min_exp,
            "trust chain resolved"
        );
        Ok(TrustChain {
            subject: subject.to_string(),
            trust_anchor: anchor.sub.clone(),
            metadata_type,
            chain: chain_jwts,
            parties_involved: parties,
            final_metadata,
            exp: min_exp,
            verified_trust_marks,
            status: ChainStatus::Valid,
            active: true,
            created_at: now,
            modified_at: now,
        })
    }
}
