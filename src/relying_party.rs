//! Relying-party orchestration.
//!
//! Top-level API over the trust-chain machinery:
//! 1. `get_well_known_data` — publish our own federation self-assertion,
//!    walking the onboarding states until key material and trust marks are
//!    in place
//! 2. `get_authorize_url` — resolve a provider's trust chain (store first,
//!    build on miss, single-flight per key) and assemble a signed
//!    authorization Request Object
//!
//! Operations are plain futures: callers bound total time with their own
//! deadline (`tokio::time::timeout`), and cancellation is cooperative at
//! every fetch or store await.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::authz::{self, OidcProfile, CODE_CHALLENGE_METHOD};
use crate::config::Config;
use crate::entity::ENTITY_TYPE_RELYING_PARTY;
use crate::errors::{Error, Result};
use crate::fetch::{EntityFetcher, WELL_KNOWN_PATH};
use crate::jose::{JoseService, Jwk, JwkSet, ENTITY_STATEMENT_TYP};
use crate::store::{AuthRequestRecord, FederationEntity, FederationStore};
use crate::trust::{MetadataType, TrustChain, TrustChainBuilder};

/// Progressive onboarding states for the well-known document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnboardingStep {
    /// No key material configured: a fresh key pair is returned for the
    /// operator to install. Nothing is persisted.
    OnlyJwks,
    /// Keys configured but no trust marks yet: the self-assertion is
    /// returned so a federation authority can issue marks against it.
    Intermediate,
    /// Keys and trust marks present: the federation entity is persisted.
    Complete,
}

#[derive(Debug, Clone)]
pub struct WellKnownData {
    pub step: OnboardingStep,
    pub sub: String,
    pub body: String,
}

pub struct RelyingParty {
    config: Config,
    jose: JoseService,
    fetcher: EntityFetcher,
    store: Arc<dyn FederationStore>,
    build_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RelyingParty {
    pub fn new(config: Config, store: Arc<dyn FederationStore>) -> Result<Self> {
        config.validate()?;
        let jose = JoseService::new(&config)?;
        let fetcher = EntityFetcher::new(config.http_timeout_secs)?;
        Ok(Self {
            config,
            jose,
            fetcher,
            store,
            build_locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ── Authorization ────────────────────────────────────────────

    /// Resolve `(provider, anchor)` into a valid trust chain and build the
    /// provider authorization URL carrying a signed Request Object.
    pub async fn get_authorize_url(
        &self,
        provider: &str,
        trust_anchor: &str,
        redirect_uri: &str,
        scope: &str,
        profile: &str,
        prompt: &str,
    ) -> Result<String> {
        if provider.trim().is_empty() {
            return Err(Error::MissingProvider);
        }
        let provider = provider.trim();

        let anchor_sub = if trust_anchor.trim().is_empty() {
            self.config
                .anchor_for_provider(provider)
                .ok_or_else(|| Error::InvalidTrustAnchor("<none configured>".into()))?
                .to_string()
        } else {
            trust_anchor.trim().to_string()
        };
        if !self.config.trust_anchors.contains(&anchor_sub) {
            return Err(Error::InvalidTrustAnchor(anchor_sub));
        }

        let chain = self.get_or_build_trust_chain(provider, &anchor_sub).await?;

        let client_id = self.config.client_id.trim_end_matches('/').to_string();
        let entity = self
            .store
            .fetch_federation_entity(&client_id)
            .await?
            .filter(|e| e.active)
            .ok_or(Error::MissingConfiguration)?;

        let authorization_endpoint = chain
            .final_metadata
            .get("authorization_endpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MissingMetadata {
                subject: provider.to_string(),
                metadata_type: MetadataType::OpenidProvider.to_string(),
            })?
            .to_string();
        let provider_jwks = self
            .jose
            .jwks_from_metadata(provider, &chain.final_metadata)
            .await?;

        let rp_metadata = entity
            .metadata
            .get(ENTITY_TYPE_RELYING_PARTY)
            .cloned()
            .unwrap_or_else(|| json!({}));
        let redirect_uri = self.pick_redirect_uri(&rp_metadata, redirect_uri)?;
        let response_type = rp_metadata
            .get("response_types")
            .and_then(Value::as_array)
            .and_then(|types| types.first())
            .and_then(Value::as_str)
            .unwrap_or("code")
            .to_string();

        let scope = if scope.trim().is_empty() { "openid" } else { scope };
        let prompt = if prompt.trim().is_empty() {
            "consent login"
        } else {
            prompt
        };
        let profile = OidcProfile::parse(profile);
        let acr_values = match profile {
            OidcProfile::Spid => self.config.spid_acr_value.clone(),
            OidcProfile::Cie => self.config.cie_acr_value.clone(),
        };

        let nonce = authz::generate_nonce();
        let state = authz::generate_state();
        let pkce = authz::generate_pkce();

        let params = json!({
            "client_id": client_id,
            "response_type": response_type,
            "scope": scope,
            "code_challenge": pkce.code_challenge,
            "code_challenge_method": CODE_CHALLENGE_METHOD,
            "nonce": nonce,
            "prompt": prompt,
            "redirect_uri": redirect_uri,
            "acr_values": acr_values,
            "claims": authz::requested_claims(profile),
            "state": state,
            "code_verifier": pkce.code_verifier,
        });

        // persisted before the redirect; the verifier comes back out by state
        self.store
            .store_auth_request(AuthRequestRecord {
                client_id: client_id.clone(),
                state: state.clone(),
                endpoint: authorization_endpoint.clone(),
                provider: provider.to_string(),
                provider_jwks,
                provider_configuration: chain.final_metadata.clone(),
                data: params.clone(),
                created_at: Utc::now(),
            })
            .await?;

        let request_jws = self.sign_request_object(
            &params,
            &client_id,
            provider,
            &authorization_endpoint,
            &entity.jwks,
        )?;

        let mut url = url::Url::parse(&authorization_endpoint)
            .map_err(|e| Error::Parse(format!("bad authorization_endpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in params.as_object().expect("params is an object") {
                if name == "code_verifier" {
                    continue;
                }
                match value {
                    Value::String(s) => {
                        query.append_pair(name, s);
                    }
                    other => {
                        query.append_pair(name, &other.to_string());
                    }
                }
            }
            query.append_pair("request", &request_jws);
        }

        info!(provider = %provider, state = %state, "authorization request assembled");
        Ok(url.to_string())
    }

    /// The stored auth-request record for a callback `state`; carries the
    /// PKCE verifier the token exchange needs.
    pub async fn fetch_auth_request(&self, state: &str) -> Result<Option<AuthRequestRecord>> {
        self.store.fetch_auth_request(state).await
    }

    /// Administrative disable of a provider without deleting its chain.
    pub async fn deactivate_provider(&self, provider: &str, trust_anchor: &str) -> Result<bool> {
        self.store
            .deactivate_trust_chain(provider, trust_anchor, MetadataType::OpenidProvider)
            .await
    }

    fn pick_redirect_uri(&self, rp_metadata: &Value, requested: &str) -> Result<String> {
        let registered: Vec<String> = rp_metadata
            .get("redirect_uris")
            .and_then(Value::as_array)
            .map(|uris| {
                uris.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|| self.config.redirect_uris.clone());

        if !requested.is_empty() && registered.iter().any(|uri| uri == requested) {
            return Ok(requested.to_string());
        }
        if !requested.is_empty() {
            warn!(requested = %requested, "redirect_uri not registered; falling back to the first configured one");
        }
        registered
            .first()
            .cloned()
            .ok_or(Error::MissingConfiguration)
    }

    /// The Request Object: the parameter set without the PKCE verifier,
    /// plus `iss`/`sub`/`iat`/`aud`, signed with our private jwks.
    fn sign_request_object(
        &self,
        params: &Value,
        client_id: &str,
        provider: &str,
        authorization_endpoint: &str,
        jwks: &JwkSet,
    ) -> Result<String> {
        let mut payload: Map<String, Value> = params
            .as_object()
            .cloned()
            .expect("params is an object");
        payload.remove("code_verifier");
        payload.insert("iss".into(), json!(client_id));
        payload.insert("sub".into(), json!(client_id));
        payload.insert("iat".into(), json!(Utc::now().timestamp()));
        payload.insert(
            "aud".into(),
            json!([provider, authorization_endpoint]),
        );
        self.jose.sign(&Value::Object(payload), jwks, Some("JWT"))
    }

    // ── Trust-chain resolution ───────────────────────────────────

    /// Store lookup with the three read states (absent / disabled /
    /// expired), falling back to a single-flight build.
    async fn get_or_build_trust_chain(
        &self,
        provider: &str,
        anchor_sub: &str,
    ) -> Result<TrustChain> {
        let metadata_type = MetadataType::OpenidProvider;

        if let Some(chain) = self
            .store
            .fetch_trust_chain(provider, anchor_sub, metadata_type)
            .await?
        {
            if !chain.active {
                return Err(Error::TrustChainDisabled {
                    subject: provider.to_string(),
                    modified_at: chain.modified_at,
                });
            }
            if !chain.is_expired() {
                return Ok(chain);
            }
            debug!(provider = %provider, "stored trust chain expired; rebuilding");
        }

        // at most one in-flight build per (subject, anchor, type); later
        // callers wait and then re-read the winner's row
        let key = format!("{provider}|{anchor_sub}|{}", metadata_type.as_str());
        let lock = self
            .build_locks
            .entry(key)
            .or_default()
            .value()
            .clone();
        let _guard = lock.lock().await;

        if let Some(chain) = self
            .store
            .fetch_trust_chain(provider, anchor_sub, metadata_type)
            .await?
        {
            if !chain.active {
                return Err(Error::TrustChainDisabled {
                    subject: provider.to_string(),
                    modified_at: chain.modified_at,
                });
            }
            if !chain.is_expired() {
                return Ok(chain);
            }
        }

        let builder = TrustChainBuilder {
            config: &self.config,
            fetcher: &self.fetcher,
            jose: &self.jose,
            store: self.store.as_ref(),
        };

        let mut anchor_ec = builder.resolve_entity_configuration(anchor_sub).await?;
        if !anchor_ec.validate_itself(&self.jose) {
            return Err(Error::InvalidTrustChain(format!(
                "anchor '{anchor_sub}' self-signature did not verify"
            )));
        }

        let chain = builder.build(provider, metadata_type, &anchor_ec).await?;
        let chain = self.store.store_trust_chain(chain).await?;
        if !chain.active {
            // disabled by an administrator while we were building
            return Err(Error::TrustChainDisabled {
                subject: provider.to_string(),
                modified_at: chain.modified_at,
            });
        }
        Ok(chain)
    }

    // ── Well-known / onboarding ──────────────────────────────────

    /// Serve our own federation document, or the appropriate onboarding
    /// artifact when the federation entity does not exist yet.
    pub async fn get_well_known_data(
        &self,
        request_url: &str,
        json_mode: bool,
    ) -> Result<WellKnownData> {
        let sub = subject_from_request_url(request_url);
        let client_id = self.config.client_id.trim_end_matches('/').to_string();
        if sub != client_id {
            return Err(Error::MismatchedSubject {
                expected: client_id,
                found: sub,
            });
        }

        if let Some(entity) = self.store.fetch_federation_entity(&sub).await? {
            return self.render_self_assertion(&entity, json_mode, OnboardingStep::Complete);
        }

        if self.config.jwk.trim().is_empty() {
            let key = Jwk::generate_rsa()?;
            let body = serde_json::to_string_pretty(&key.to_public())
                .map_err(|e| Error::Internal(anyhow::anyhow!("jwk serialization: {e}")))?;
            info!("onboarding: fresh key pair generated; install the private JWK in the configuration and restart");
            return Ok(WellKnownData {
                step: OnboardingStep::OnlyJwks,
                sub,
                body,
            });
        }

        let jwks = JwkSet::parse_str(&self.config.jwk)?;
        let entity = self.federation_entity_from_config(&sub, jwks);

        if self.config.trust_marks.is_empty() {
            info!(sub = %sub, "onboarding: awaiting trust marks from the federation authority");
            return self.render_self_assertion(&entity, json_mode, OnboardingStep::Intermediate);
        }

        let entity = self.store.store_federation_entity(entity).await?;
        info!(sub = %sub, "onboarding complete: federation entity persisted");
        self.render_self_assertion(&entity, json_mode, OnboardingStep::Complete)
    }

    fn federation_entity_from_config(&self, sub: &str, jwks: JwkSet) -> FederationEntity {
        let cfg = &self.config;
        let metadata = json!({
            ENTITY_TYPE_RELYING_PARTY: {
                "application_type": cfg.application_type,
                "client_name": cfg.application_name,
                "client_id": sub,
                "client_registration_types": ["automatic"],
                "contacts": cfg.contacts,
                "grant_types": ["authorization_code", "refresh_token"],
                "response_types": ["code"],
                "redirect_uris": cfg.redirect_uris,
            }
        });
        let now = Utc::now();
        FederationEntity {
            subject: sub.to_string(),
            jwks,
            metadata,
            authority_hints: cfg.trust_anchors.clone(),
            trust_marks: cfg.trust_marks.clone(),
            trust_marks_issuers: json!({}),
            constraints: json!({}),
            entity_type: ENTITY_TYPE_RELYING_PARTY.to_string(),
            default_expire_minutes: cfg.default_expire_minutes,
            default_signature_alg: cfg.default_signature_alg.clone(),
            active: true,
            created_at: now,
            modified_at: now,
        }
    }

    fn render_self_assertion(
        &self,
        entity: &FederationEntity,
        json_mode: bool,
        step: OnboardingStep,
    ) -> Result<WellKnownData> {
        let iat = Utc::now().timestamp();
        let exp = iat + entity.default_expire_minutes * 60;
        let mut payload = json!({
            "iss": entity.subject,
            "sub": entity.subject,
            "iat": iat,
            "exp": exp,
            "jwks": entity.jwks.to_public(),
            "metadata": entity.metadata,
            "authority_hints": entity.authority_hints,
        });
        if !entity.trust_marks.is_empty() {
            payload["trust_marks"] = Value::Array(entity.trust_marks.clone());
        }

        let body = if json_mode {
            serde_json::to_string_pretty(&payload)
                .map_err(|e| Error::Internal(anyhow::anyhow!("self-assertion: {e}")))?
        } else {
            self.jose
                .sign(&payload, &entity.jwks, Some(ENTITY_STATEMENT_TYP))?
        };

        Ok(WellKnownData {
            step,
            sub: entity.subject.clone(),
            body,
        })
    }
}

/// The entity subject is everything before the well-known path.
fn subject_from_request_url(request_url: &str) -> String {
    request_url
        .split(WELL_KNOWN_PATH)
        .next()
        .unwrap_or(request_url)
        .trim_end_matches('/')
        .to_string()
}
