//! Entity Configurations: parsed, self-signed federation statements.
//!
//! An `EntityConfiguration` wraps one fetched compact JWS and accumulates
//! the validation outcomes the trust-chain walk produces around it:
//! superiors that vouched for it, superiors that refused, and descendant
//! statements it has itself verified. Instances are owned by the walk that
//! created them; nothing here is shared across builds.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::AllowedTrustMark;
use crate::errors::{Error, Result};
use crate::fetch::EntityFetcher;
use crate::jose::{decode_parts, JoseService, JwkSet};

pub const ENTITY_TYPE_FEDERATION: &str = "federation_entity";
pub const ENTITY_TYPE_PROVIDER: &str = "openid_provider";
pub const ENTITY_TYPE_RELYING_PARTY: &str = "openid_relying_party";

/// A subordinate statement a superior issued about a descendant.
#[derive(Debug, Clone)]
pub struct EntityStatement {
    pub jwt: String,
    pub payload: Value,
    pub iss: String,
    pub sub: String,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct EntityConfiguration {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// The original compact JWS this configuration was parsed from.
    pub jwt: String,
    /// The full decoded payload; unknown members ride along untouched.
    pub payload: Value,
    pub jwks: JwkSet,
    /// Outcome of the last self-signature check.
    pub valid: bool,
    pub verified_superiors: BTreeMap<String, EntityConfiguration>,
    pub failed_superiors: BTreeMap<String, String>,
    /// Superior subject → the statement that superior issued about us.
    pub verified_by_superiors: BTreeMap<String, EntityStatement>,
    pub failed_by_superiors: BTreeMap<String, String>,
    /// Descendant subject → statement payload we verified as a superior.
    pub verified_descendant_statements: BTreeMap<String, Value>,
    pub failed_descendant_statements: BTreeMap<String, String>,
}

impl EntityConfiguration {
    /// Parse a fetched self-assertion. Enforces the self-assertion
    /// invariants: `iss == sub`, `exp > iat`, a non-empty embedded jwks.
    pub fn parse(jwt: &str) -> Result<Self> {
        let (_header, payload) = decode_parts(jwt)?;

        let sub = required_str(&payload, "sub")?;
        let iss = required_str(&payload, "iss")?;
        if sub != iss {
            return Err(Error::Parse(format!(
                "entity configuration for '{sub}' is not self-issued (iss '{iss}')"
            )));
        }
        let iat = required_i64(&payload, "iat")?;
        let exp = required_i64(&payload, "exp")?;
        if exp <= iat {
            return Err(Error::Parse(format!(
                "entity configuration for '{sub}' expires before it was issued"
            )));
        }

        let jwks = embedded_jwks(&payload)
            .ok_or_else(|| Error::MissingJwks(sub.clone()))
            .and_then(|v| JwkSet::parse(v))?;
        if jwks.is_empty() {
            return Err(Error::MissingJwks(sub));
        }

        Ok(Self {
            sub,
            iss,
            iat,
            exp,
            jwt: jwt.to_string(),
            payload,
            jwks,
            valid: false,
            verified_superiors: BTreeMap::new(),
            failed_superiors: BTreeMap::new(),
            verified_by_superiors: BTreeMap::new(),
            failed_by_superiors: BTreeMap::new(),
            verified_descendant_statements: BTreeMap::new(),
            failed_descendant_statements: BTreeMap::new(),
        })
    }

    pub fn is_expired(&self) -> bool {
        self.exp < Utc::now().timestamp()
    }

    pub fn metadata(&self, entity_type: &str) -> Option<&Value> {
        self.payload.get("metadata")?.get(entity_type)
    }

    pub fn authority_hints(&self) -> Vec<String> {
        self.payload
            .get("authority_hints")
            .and_then(Value::as_array)
            .map(|hints| {
                hints
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn federation_fetch_endpoint(&self) -> Option<&str> {
        self.metadata(ENTITY_TYPE_FEDERATION)?
            .get("federation_fetch_endpoint")?
            .as_str()
    }

    pub fn constraints(&self) -> Option<&Value> {
        self.payload.get("constraints")
    }

    pub fn trust_marks(&self) -> Vec<Value> {
        self.payload
            .get("trust_marks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    /// Verify the stored JWT under its own jwks; records and returns the
    /// outcome.
    pub fn validate_itself(&mut self, jose: &JoseService) -> bool {
        self.valid = jose.verify(&self.jwt, &self.jwks).is_ok();
        self.valid
    }

    /// Verify a statement this entity issued about a descendant. The JWS
    /// must reference one of our kids and verify under our jwks.
    pub fn validate_descendant(&mut self, jwt: &str, jose: &JoseService) -> Result<Value> {
        let (header, _payload) = decode_parts(jwt)?;
        let kid = header
            .get("kid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::UnknownKid("<none in header>".into()))?;
        if self.jwks.find(kid).is_none() {
            return Err(Error::UnknownKid(kid.to_string()));
        }
        let payload = jose.verify(jwt, &self.jwks)?;
        if let Some(sub) = payload.get("sub").and_then(Value::as_str) {
            self.verified_descendant_statements
                .insert(sub.to_string(), payload.clone());
        }
        Ok(payload)
    }

    /// "A superior vouching for us": verify the superior's self-assertion,
    /// verify the statement it issued about us, and require the statement
    /// to embed a jwks able to verify our own self-assertion. Records the
    /// outcome on both sides; never returns an error — discovery failures
    /// are expected mid-walk.
    pub fn validate_by_superior(
        &mut self,
        statement_jwt: &str,
        superior: &mut EntityConfiguration,
        jose: &JoseService,
    ) -> bool {
        let outcome = self.check_superior_statement(statement_jwt, superior, jose);
        match outcome {
            Ok(statement) => {
                debug!(sub = %self.sub, superior = %superior.sub, "statement verified");
                self.verified_by_superiors
                    .insert(superior.sub.clone(), statement);
                self.valid = true;
                true
            }
            Err(e) => {
                warn!(sub = %self.sub, superior = %superior.sub, error = %e, "superior validation failed");
                self.failed_by_superiors
                    .insert(superior.sub.clone(), e.to_string());
                superior
                    .failed_descendant_statements
                    .insert(self.sub.clone(), e.to_string());
                false
            }
        }
    }

    fn check_superior_statement(
        &self,
        statement_jwt: &str,
        superior: &mut EntityConfiguration,
        jose: &JoseService,
    ) -> Result<EntityStatement> {
        if !superior.valid && !superior.validate_itself(jose) {
            return Err(Error::InvalidTrustChain(format!(
                "superior '{}' failed self-validation",
                superior.sub
            )));
        }
        let payload = superior.validate_descendant(statement_jwt, jose)?;

        let iss = required_str(&payload, "iss")?;
        let sub = required_str(&payload, "sub")?;
        let exp = required_i64(&payload, "exp")?;
        if sub != self.sub {
            return Err(Error::Parse(format!(
                "statement subject '{sub}' is not '{}'",
                self.sub
            )));
        }

        // The statement carries our keys as the superior sees them; they
        // must be able to verify our self-assertion.
        let descendant_keys = payload
            .get("jwks")
            .ok_or_else(|| Error::MissingJwks(self.sub.clone()))
            .and_then(JwkSet::parse)?;
        jose.verify(&self.jwt, &descendant_keys)?;

        Ok(EntityStatement {
            jwt: statement_jwt.to_string(),
            payload,
            iss,
            sub,
            exp,
        })
    }

    /// Resolve this entity's authority hints into superior configurations.
    /// `already_known` entities (typically the trust anchor) are reused
    /// instead of re-fetched. A failing hint is logged and bucketed, never
    /// fatal to the walk.
    pub async fn get_superiors(
        &mut self,
        max_hints: usize,
        already_known: &[&EntityConfiguration],
        fetcher: &EntityFetcher,
        jose: &JoseService,
    ) {
        let mut hints = self.authority_hints();
        if max_hints > 0 && hints.len() > max_hints {
            // later hints are preferred
            hints = hints.split_off(hints.len() - max_hints);
        }

        for hint in hints {
            if self.verified_superiors.contains_key(&hint)
                || self.failed_superiors.contains_key(&hint)
            {
                continue;
            }

            if let Some(known) = already_known.iter().find(|ec| ec.sub == hint) {
                if known.valid {
                    self.verified_superiors.insert(hint, (*known).clone());
                } else {
                    self.failed_superiors
                        .insert(hint, "known superior failed self-validation".into());
                }
                continue;
            }

            match fetcher.entity_configuration(&hint).await {
                Ok(jwt) => match EntityConfiguration::parse(&jwt) {
                    Ok(mut superior) => {
                        if superior.validate_itself(jose) {
                            self.verified_superiors.insert(hint, superior);
                        } else {
                            self.failed_superiors
                                .insert(hint, "self-signature did not verify".into());
                        }
                    }
                    Err(e) => {
                        warn!(sub = %self.sub, hint = %hint, error = %e, "superior configuration unusable");
                        self.failed_superiors.insert(hint, e.to_string());
                    }
                },
                Err(e) => {
                    warn!(sub = %self.sub, hint = %hint, error = %e, "superior fetch failed");
                    self.failed_superiors.insert(hint, e.to_string());
                }
            }
        }
    }

    /// For each named superior without a recorded verdict, fetch the
    /// statement it issued about us and run [`validate_by_superior`].
    pub async fn validate_by_superiors(
        &mut self,
        superiors: &[String],
        fetcher: &EntityFetcher,
        jose: &JoseService,
    ) {
        for sub in superiors {
            if self.verified_by_superiors.contains_key(sub)
                || self.failed_by_superiors.contains_key(sub)
            {
                continue;
            }
            let Some(mut superior) = self.verified_superiors.remove(sub) else {
                continue;
            };

            match superior.federation_fetch_endpoint() {
                Some(endpoint) => {
                    let endpoint = endpoint.to_string();
                    match fetcher.entity_statement(&endpoint, &self.sub).await {
                        Ok(statement_jwt) => {
                            self.validate_by_superior(&statement_jwt, &mut superior, jose);
                        }
                        Err(e) => {
                            warn!(sub = %self.sub, superior = %superior.sub, error = %e, "statement fetch failed");
                            self.failed_by_superiors.insert(sub.clone(), e.to_string());
                        }
                    }
                }
                None => {
                    warn!(superior = %superior.sub, "superior publishes no federation_fetch_endpoint");
                    self.failed_by_superiors
                        .insert(sub.clone(), "no federation_fetch_endpoint".into());
                }
            }

            self.verified_superiors.insert(sub.clone(), superior);
        }
    }

    /// Enforce the configured trust-mark allow-list: with a non-empty list,
    /// this entity must carry at least one listed mark, and the mark's JWT
    /// must verify under the given anchor's keys.
    pub fn validate_allowed_trust_marks(
        &self,
        allowed: &[AllowedTrustMark],
        anchor: &EntityConfiguration,
        jose: &JoseService,
    ) -> bool {
        if allowed.is_empty() {
            return true;
        }
        for mark in self.trust_marks() {
            let Some(id) = mark.get("id").and_then(Value::as_str) else {
                continue;
            };
            let Some(mark_jwt) = mark.get("trust_mark").and_then(Value::as_str) else {
                continue;
            };
            let listed = allowed
                .iter()
                .any(|entry| entry.id == id && entry.trust_anchor == anchor.sub);
            if !listed {
                continue;
            }
            if jose.verify(mark_jwt, &anchor.jwks).is_ok() {
                return true;
            }
            warn!(sub = %self.sub, mark = %id, "trust mark did not verify under the anchor's keys");
        }
        false
    }
}

/// Payload-level `jwks` first, then any inline `jwks` inside a metadata
/// block (some entities only publish keys there).
fn embedded_jwks(payload: &Value) -> Option<&Value> {
    if let Some(jwks) = payload.get("jwks") {
        return Some(jwks);
    }
    payload
        .get("metadata")?
        .as_object()?
        .values()
        .find_map(|block| block.get("jwks"))
}

fn required_str(payload: &Value, claim: &str) -> Result<String> {
    payload
        .get(claim)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::Parse(format!("missing '{claim}' claim")))
}

fn required_i64(payload: &Value, claim: &str) -> Result<i64> {
    payload
        .get(claim)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Parse(format!("missing '{claim}' claim")))
}
