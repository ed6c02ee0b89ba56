//! Authorization-request building blocks: PKCE, nonce/state, and the
//! per-profile requested claims.

use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::jose::jwk::b64;

pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// A PKCE pair. The verifier is stored server-side; only the challenge
/// leaves the process before the token exchange.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub code_verifier: String,
    pub code_challenge: String,
}

/// S256-only PKCE: 32 random bytes → a 43-character URL-safe verifier,
/// challenge = BASE64URL(SHA256(verifier)) without padding.
pub fn generate_pkce() -> PkcePair {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let code_verifier = b64(&bytes);
    let code_challenge = b64(&Sha256::digest(code_verifier.as_bytes()));
    PkcePair {
        code_verifier,
        code_challenge,
    }
}

pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    b64(&bytes)
}

/// `state` doubles as the auth-request storage key; a UUID keeps
/// collisions out of the picture.
pub fn generate_state() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OidcProfile {
    Spid,
    Cie,
}

impl OidcProfile {
    /// Lenient parse; SPID is the default profile.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cie" => OidcProfile::Cie,
            _ => OidcProfile::Spid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OidcProfile::Spid => "spid",
            OidcProfile::Cie => "cie",
        }
    }
}

/// The claims parameter requested from the provider, per profile.
pub fn requested_claims(profile: OidcProfile) -> Value {
    match profile {
        OidcProfile::Spid => json!({
            "id_token": {
                "familyName": { "essential": true },
                "email": { "essential": true },
            },
            "userinfo": {
                "name": null,
                "familyName": null,
                "email": null,
                "fiscalNumber": null,
            },
        }),
        OidcProfile::Cie => json!({
            "id_token": {
                "familyName": { "essential": true },
                "givenName": { "essential": true },
            },
            "userinfo": {
                "givenName": null,
                "familyName": null,
                "email": null,
                "fiscalNumber": null,
            },
        }),
    }
}
