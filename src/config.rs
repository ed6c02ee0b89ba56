use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Error, Result};

/// JWS algorithms the verifier will ever accept. ES512 is deliberately
/// absent: the JOSE backend does not implement it.
pub const SUPPORTED_SIGNING_ALGS: &[&str] = &["RS256", "RS384", "RS512", "ES256", "ES384"];

pub const DEFAULT_SPID_ACR: &str = "https://www.spid.gov.it/SpidL2";
pub const DEFAULT_CIE_ACR: &str = "https://www.spid.gov.it/SpidL2";

/// A trust-mark allow-list entry: the mark id plus the anchor whose keys
/// must verify the mark JWT.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowedTrustMark {
    pub id: String,
    #[serde(rename = "trust-anchor")]
    pub trust_anchor: String,
}

/// Relying-party configuration. Set once at startup; every other piece of
/// state lives in injected collaborators.
#[derive(Debug, Clone)]
pub struct Config {
    /// The RP's entity identifier (a URL). Mandatory.
    pub client_id: String,
    pub application_name: String,
    pub application_type: String,
    pub contacts: Vec<String>,
    /// Registered redirect URIs. The first one is the fallback when a
    /// caller asks for one that is not registered.
    pub redirect_uris: Vec<String>,
    /// Trust anchors recognised out-of-band. A chain terminating anywhere
    /// else is refused.
    pub trust_anchors: Vec<String>,
    pub default_trust_anchor: String,
    /// Provider URL → default anchor URL, per profile.
    pub spid_providers: HashMap<String, String>,
    pub cie_providers: HashMap<String, String>,
    pub spid_acr_value: String,
    pub cie_acr_value: String,
    /// Trust marks issued to this RP, as raw JSON objects. Empty until the
    /// federation authority has onboarded us.
    pub trust_marks: Vec<Value>,
    /// Stringified private JWK. Empty triggers the onboarding flow.
    pub jwk: String,
    pub default_expire_minutes: i64,
    pub default_signature_alg: String,
    pub allowed_signing_algs: Vec<String>,
    /// Cap on authority hints considered per entity. Later hints win.
    pub max_authority_hints: usize,
    /// Cap on the upward walk length.
    pub max_path_len: usize,
    pub http_timeout_secs: u64,
    /// When non-empty, every validated entity must carry at least one of
    /// these marks, verified against the listed anchor's keys.
    pub allowed_trust_marks: Vec<AllowedTrustMark>,
}

impl Config {
    /// A minimal configuration with library defaults. Callers fill in
    /// redirect URIs, anchors and key material before use.
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            application_name: String::new(),
            application_type: "web".to_string(),
            contacts: Vec::new(),
            redirect_uris: Vec::new(),
            trust_anchors: Vec::new(),
            default_trust_anchor: String::new(),
            spid_providers: HashMap::new(),
            cie_providers: HashMap::new(),
            spid_acr_value: DEFAULT_SPID_ACR.to_string(),
            cie_acr_value: DEFAULT_CIE_ACR.to_string(),
            trust_marks: Vec::new(),
            jwk: String::new(),
            default_expire_minutes: 48 * 60,
            default_signature_alg: "RS256".to_string(),
            allowed_signing_algs: SUPPORTED_SIGNING_ALGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_authority_hints: 10,
            max_path_len: 10,
            http_timeout_secs: 10,
            allowed_trust_marks: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::Configuration("client_id is required".into()));
        }
        if self.redirect_uris.is_empty() {
            return Err(Error::Configuration(
                "at least one redirect_uri is required".into(),
            ));
        }
        if self.trust_anchors.is_empty() {
            return Err(Error::Configuration(
                "at least one trust anchor is required".into(),
            ));
        }
        if !self.default_trust_anchor.is_empty()
            && !self.trust_anchors.contains(&self.default_trust_anchor)
        {
            return Err(Error::Configuration(
                "default_trust_anchor must be one of trust_anchors".into(),
            ));
        }
        for alg in &self.allowed_signing_algs {
            if !SUPPORTED_SIGNING_ALGS.contains(&alg.as_str()) {
                return Err(Error::Configuration(format!(
                    "allowed_signing_algs contains unsupported algorithm '{alg}'"
                )));
            }
        }
        if !self
            .allowed_signing_algs
            .contains(&self.default_signature_alg)
        {
            return Err(Error::Configuration(
                "default_signature_alg must be in allowed_signing_algs".into(),
            ));
        }
        Ok(())
    }

    /// The default anchor for a provider: the per-profile map first, then
    /// `default_trust_anchor`.
    pub fn anchor_for_provider(&self, provider: &str) -> Option<&str> {
        self.spid_providers
            .get(provider)
            .or_else(|| self.cie_providers.get(provider))
            .map(String::as_str)
            .or_else(|| {
                (!self.default_trust_anchor.is_empty()).then_some(self.default_trust_anchor.as_str())
            })
    }
}

/// Load configuration from environment variables (SPID_CIE_* namespace).
pub fn load() -> Result<Config> {
    dotenvy::dotenv().ok();

    let client_id = std::env::var("SPID_CIE_CLIENT_ID").unwrap_or_default();
    let mut cfg = Config::new(&client_id);

    if let Ok(v) = std::env::var("SPID_CIE_APPLICATION_NAME") {
        cfg.application_name = v;
    }
    if let Ok(v) = std::env::var("SPID_CIE_APPLICATION_TYPE") {
        cfg.application_type = v;
    }
    cfg.contacts = env_list("SPID_CIE_CONTACTS");
    cfg.redirect_uris = env_list("SPID_CIE_REDIRECT_URIS");
    cfg.trust_anchors = env_list("SPID_CIE_TRUST_ANCHORS");
    if let Ok(v) = std::env::var("SPID_CIE_DEFAULT_TRUST_ANCHOR") {
        cfg.default_trust_anchor = v;
    }
    cfg.spid_providers = env_map("SPID_CIE_SPID_PROVIDERS")?;
    cfg.cie_providers = env_map("SPID_CIE_CIE_PROVIDERS")?;
    if let Ok(v) = std::env::var("SPID_CIE_SPID_ACR") {
        cfg.spid_acr_value = v;
    }
    if let Ok(v) = std::env::var("SPID_CIE_CIE_ACR") {
        cfg.cie_acr_value = v;
    }
    if let Ok(v) = std::env::var("SPID_CIE_TRUST_MARKS") {
        if !v.trim().is_empty() {
            cfg.trust_marks = serde_json::from_str(&v)
                .map_err(|e| Error::Configuration(format!("SPID_CIE_TRUST_MARKS: {e}")))?;
        }
    }
    if let Ok(v) = std::env::var("SPID_CIE_JWK") {
        cfg.jwk = v;
    }
    if let Ok(v) = std::env::var("SPID_CIE_DEFAULT_EXPIRE_MINUTES") {
        cfg.default_expire_minutes = v
            .parse()
            .map_err(|_| Error::Configuration("SPID_CIE_DEFAULT_EXPIRE_MINUTES".into()))?;
    }
    if let Ok(v) = std::env::var("SPID_CIE_DEFAULT_SIGNATURE_ALG") {
        cfg.default_signature_alg = v;
    }
    let allowed = env_list("SPID_CIE_ALLOWED_SIGNING_ALGS");
    if !allowed.is_empty() {
        cfg.allowed_signing_algs = allowed;
    }
    if let Ok(v) = std::env::var("SPID_CIE_MAX_AUTHORITY_HINTS") {
        cfg.max_authority_hints = v
            .parse()
            .map_err(|_| Error::Configuration("SPID_CIE_MAX_AUTHORITY_HINTS".into()))?;
    }
    if let Ok(v) = std::env::var("SPID_CIE_HTTP_TIMEOUT_SECS") {
        cfg.http_timeout_secs = v
            .parse()
            .map_err(|_| Error::Configuration("SPID_CIE_HTTP_TIMEOUT_SECS".into()))?;
    }
    if let Ok(v) = std::env::var("SPID_CIE_ALLOWED_TRUST_MARKS") {
        if !v.trim().is_empty() {
            cfg.allowed_trust_marks = serde_json::from_str(&v)
                .map_err(|e| Error::Configuration(format!("SPID_CIE_ALLOWED_TRUST_MARKS: {e}")))?;
        }
    }

    cfg.validate()?;
    Ok(cfg)
}

fn env_list(var: &str) -> Vec<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse a `url=anchor,url=anchor` pair list.
fn env_map(var: &str) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for entry in env_list(var) {
        let (k, v) = entry
            .split_once('=')
            .ok_or_else(|| Error::Configuration(format!("{var}: expected url=anchor pairs")))?;
        out.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(out)
}
