//! JWK / JWK-set value types.
//!
//! Keys are immutable value objects once parsed. Private RSA material is
//! carried in the same struct (`d`, `p`, `q`) and stripped by
//! [`Jwk::to_public`] before anything is published.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{Error, Result};

/// A single JSON Web Key (RFC 7517). Unknown members are dropped; the
/// members the federation needs are kept verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    // RSA members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,
    // EC members (d is shared with RSA above)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl Jwk {
    /// Generate a fresh 2048-bit RSA signing key with a random kid.
    pub fn generate_rsa() -> Result<Jwk> {
        let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
            .map_err(|e| Error::Internal(anyhow::anyhow!("rsa keygen: {e}")))?;
        // export primes largest-first; signing backends expect p > q
        let mut primes = key.primes().to_vec();
        primes.sort_by(|a, b| b.cmp(a));
        Ok(Jwk {
            kty: "RSA".to_string(),
            kid: Some(Uuid::new_v4().to_string()),
            key_use: Some("sig".to_string()),
            alg: Some("RS256".to_string()),
            n: Some(b64(&key.n().to_bytes_be())),
            e: Some(b64(&key.e().to_bytes_be())),
            d: Some(b64(&key.d().to_bytes_be())),
            p: Some(b64(&primes[0].to_bytes_be())),
            q: Some(b64(&primes[1].to_bytes_be())),
            dp: None,
            dq: None,
            qi: None,
            crv: None,
            x: None,
            y: None,
        })
    }

    /// The same key with all private members removed.
    pub fn to_public(&self) -> Jwk {
        Jwk {
            d: None,
            p: None,
            q: None,
            dp: None,
            dq: None,
            qi: None,
            ..self.clone()
        }
    }

    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }
}

/// An ordered set of JWKs. Signing uses the first key; verification looks
/// keys up by kid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    /// Parse either `{"keys":[...]}` or a bare array of keys.
    pub fn parse(value: &Value) -> Result<JwkSet> {
        let keys = match value {
            Value::Object(map) => map
                .get("keys")
                .ok_or_else(|| Error::Parse("jwks object has no 'keys' member".into()))?,
            Value::Array(_) => value,
            _ => return Err(Error::Parse("jwks must be an object or an array".into())),
        };
        let keys: Vec<Jwk> = serde_json::from_value(keys.clone())
            .map_err(|e| Error::Parse(format!("malformed jwks: {e}")))?;
        Ok(JwkSet { keys })
    }

    /// Parse from a string holding a single JWK or a full set.
    pub fn parse_str(raw: &str) -> Result<JwkSet> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| Error::Parse(format!("malformed jwk: {e}")))?;
        if value.get("keys").is_some() || value.is_array() {
            Self::parse(&value)
        } else {
            let key: Jwk = serde_json::from_value(value)
                .map_err(|e| Error::Parse(format!("malformed jwk: {e}")))?;
            Ok(JwkSet { keys: vec![key] })
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn first(&self) -> Option<&Jwk> {
        self.keys.first()
    }

    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }

    pub fn kids(&self) -> Vec<String> {
        self.keys.iter().filter_map(|k| k.kid.clone()).collect()
    }

    /// Public-only projection of every key in the set.
    pub fn to_public(&self) -> JwkSet {
        JwkSet {
            keys: self.keys.iter().map(Jwk::to_public).collect(),
        }
    }
}

pub(crate) fn b64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn b64_decode(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| Error::Parse(format!("bad base64url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;

    // Keygen is expensive; share one key across the module's tests.
    static RSA_KEY: Lazy<Jwk> = Lazy::new(|| Jwk::generate_rsa().unwrap());

    #[test]
    fn test_generated_rsa_key_shape() {
        let key = &*RSA_KEY;
        assert_eq!(key.kty, "RSA");
        assert_eq!(key.key_use.as_deref(), Some("sig"));
        assert!(key.kid.is_some());
        assert!(key.is_private());
        // 2048-bit modulus is 256 bytes, 342 chars of unpadded base64url
        assert!(b64_decode(key.n.as_ref().unwrap()).unwrap().len() >= 256);
    }

    #[test]
    fn test_to_public_strips_private_members() {
        let public = RSA_KEY.to_public();
        assert!(!public.is_private());
        assert!(public.p.is_none());
        assert!(public.q.is_none());
        assert_eq!(public.n, RSA_KEY.n);
        assert_eq!(public.kid, RSA_KEY.kid);

        let json = serde_json::to_value(&public).unwrap();
        assert!(json.get("d").is_none());
        assert!(json.get("p").is_none());
    }

    #[test]
    fn test_parse_keys_object_and_bare_array() {
        let key = serde_json::to_value(RSA_KEY.to_public()).unwrap();
        let as_object = serde_json::json!({ "keys": [key] });
        let as_array = serde_json::json!([key]);

        let a = JwkSet::parse(&as_object).unwrap();
        let b = JwkSet::parse(&as_array).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.keys.len(), 1);
    }

    #[test]
    fn test_parse_rejects_scalar() {
        assert!(JwkSet::parse(&serde_json::json!("nope")).is_err());
        assert!(JwkSet::parse(&serde_json::json!({"nokeys": []})).is_err());
    }

    #[test]
    fn test_parse_str_single_key() {
        let raw = serde_json::to_string(&*RSA_KEY).unwrap();
        let set = JwkSet::parse_str(&raw).unwrap();
        assert_eq!(set.keys.len(), 1);
        assert!(set.keys[0].is_private());
    }

    #[test]
    fn test_find_by_kid() {
        let set = JwkSet {
            keys: vec![RSA_KEY.to_public()],
        };
        let kid = RSA_KEY.kid.clone().unwrap();
        assert!(set.find(&kid).is_some());
        assert!(set.find("missing").is_none());
    }
}
