//! Compact-JWS operations: unverified decoding, signing, verification.
//!
//! Algorithm choice is policy, not data. Signing takes the algorithm from
//! configuration; verification always checks the token's `alg` against the
//! configured allow-list before touching the signature, so a statement can
//! never talk us into an algorithm we did not opt into.

use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use p256::pkcs8::EncodePrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::{BigUint, RsaPrivateKey};
use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::jose::jwk::{b64_decode, Jwk, JwkSet};

/// JOSE `typ` for federation entity statements.
pub const ENTITY_STATEMENT_TYP: &str = "entity-statement+jwt";

/// Decode the header and payload segments of a compact JWS without any
/// signature check. Used wherever the payload is needed before key
/// selection.
pub fn decode_parts(jwt: &str) -> Result<(Value, Value)> {
    let segments: Vec<&str> = jwt.split('.').collect();
    if segments.len() != 3 {
        return Err(Error::Parse(format!(
            "expected 3 JWS segments, found {}",
            segments.len()
        )));
    }
    let header = serde_json::from_slice(&b64_decode(segments[0])?)
        .map_err(|e| Error::Parse(format!("malformed JWS header: {e}")))?;
    let payload = serde_json::from_slice(&b64_decode(segments[1])?)
        .map_err(|e| Error::Parse(format!("malformed JWS payload: {e}")))?;
    Ok((header, payload))
}

/// Stateless JOSE service; holds only algorithm policy and the HTTP client
/// used for `jwks_uri` retrieval.
#[derive(Clone)]
pub struct JoseService {
    default_alg: Algorithm,
    allowed_algs: Vec<Algorithm>,
    http: reqwest::Client,
}

impl JoseService {
    pub fn new(config: &Config) -> Result<Self> {
        let default_alg = parse_alg(&config.default_signature_alg)?;
        let allowed_algs = config
            .allowed_signing_algs
            .iter()
            .map(|a| parse_alg(a))
            .collect::<Result<Vec<_>>>()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("http client: {e}")))?;
        Ok(Self {
            default_alg,
            allowed_algs,
            http,
        })
    }

    /// Sign `payload` with the first key of the set. The JWS header carries
    /// `alg`, `kid` and, when given, `typ`.
    pub fn sign(&self, payload: &Value, keys: &JwkSet, typ: Option<&str>) -> Result<String> {
        let key = keys
            .first()
            .ok_or_else(|| Error::MissingJwks("signing key set is empty".into()))?;
        let alg = signing_alg(key, self.default_alg)?;
        let mut header = Header::new(alg);
        header.kid = key.kid.clone();
        if let Some(typ) = typ {
            header.typ = Some(typ.to_string());
        }
        let encoding_key = encoding_key(key)?;
        jsonwebtoken::encode(&header, payload, &encoding_key)
            .map_err(|e| Error::Internal(anyhow::anyhow!("jws signing: {e}")))
    }

    /// Verify a compact JWS against a key set: kid lookup, allow-list check,
    /// signature. Temporal claims (`exp`, `aud`) are the entity layer's
    /// business and are not validated here. Returns the verified payload.
    pub fn verify(&self, jws: &str, keys: &JwkSet) -> Result<Value> {
        let header = jsonwebtoken::decode_header(jws)
            .map_err(|e| Error::Parse(format!("malformed JWS header: {e}")))?;
        if !self.allowed_algs.contains(&header.alg) {
            return Err(Error::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }
        let kid = header
            .kid
            .ok_or_else(|| Error::UnknownKid("<none in header>".into()))?;
        let key = keys.find(&kid).ok_or(Error::UnknownKid(kid))?;
        let decoding_key = decoding_key(key)?;

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<Value>(jws, &decoding_key, &validation)
            .map_err(|e| Error::Parse(format!("JWS rejected: {e}")))?;
        Ok(data.claims)
    }

    /// Resolve a metadata block's key set: inline `jwks` first, `jwks_uri`
    /// download second.
    pub async fn jwks_from_metadata(&self, owner: &str, metadata: &Value) -> Result<JwkSet> {
        if let Some(jwks) = metadata.get("jwks") {
            return JwkSet::parse(jwks);
        }
        if let Some(uri) = metadata.get("jwks_uri").and_then(Value::as_str) {
            let resp = self.http.get(uri).send().await.map_err(|e| {
                warn!(owner = %owner, uri = %uri, error = %e, "jwks_uri download failed");
                Error::MissingJwks(owner.to_string())
            })?;
            if !resp.status().is_success() {
                warn!(owner = %owner, uri = %uri, status = %resp.status(), "jwks_uri returned an error");
                return Err(Error::MissingJwks(owner.to_string()));
            }
            let value: Value = resp
                .json()
                .await
                .map_err(|e| Error::Parse(format!("jwks_uri body: {e}")))?;
            return JwkSet::parse(&value);
        }
        Err(Error::MissingJwks(owner.to_string()))
    }
}

fn parse_alg(alg: &str) -> Result<Algorithm> {
    alg.parse::<Algorithm>()
        .map_err(|_| Error::UnsupportedAlgorithm(alg.to_string()))
}

/// Pick the JWS algorithm for a signing key: the configured default for RSA
/// keys, the curve-determined algorithm for EC keys.
fn signing_alg(key: &Jwk, default_alg: Algorithm) -> Result<Algorithm> {
    match key.kty.as_str() {
        "RSA" => match default_alg {
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => Ok(default_alg),
            _ => Ok(Algorithm::RS256),
        },
        "EC" => match key.crv.as_deref() {
            Some("P-256") => Ok(Algorithm::ES256),
            Some("P-384") => Ok(Algorithm::ES384),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "EC curve {:?}",
                other.unwrap_or("<none>")
            ))),
        },
        other => Err(Error::UnsupportedAlgorithm(other.to_string())),
    }
}

fn encoding_key(key: &Jwk) -> Result<EncodingKey> {
    match key.kty.as_str() {
        "RSA" => {
            let n = rsa_component(key.n.as_deref(), "n")?;
            let e = rsa_component(key.e.as_deref(), "e")?;
            let d = rsa_component(key.d.as_deref(), "d")?;
            let p = rsa_component(key.p.as_deref(), "p")?;
            let q = rsa_component(key.q.as_deref(), "q")?;
            // the signing backend requires p > q
            let (p, q) = if p < q { (q, p) } else { (p, q) };
            let mut rsa_key = RsaPrivateKey::from_components(n, e, d, vec![p, q])
                .map_err(|e| Error::Parse(format!("invalid RSA private jwk: {e}")))?;
            rsa_key
                .precompute()
                .map_err(|e| Error::Parse(format!("invalid RSA private jwk: {e}")))?;
            let der = rsa_key
                .to_pkcs1_der()
                .map_err(|e| Error::Internal(anyhow::anyhow!("pkcs1 encoding: {e}")))?;
            Ok(EncodingKey::from_rsa_der(der.as_bytes()))
        }
        "EC" => {
            let d = b64_decode(
                key.d
                    .as_deref()
                    .ok_or_else(|| Error::Parse("EC jwk has no 'd'".into()))?,
            )?;
            let der = match key.crv.as_deref() {
                Some("P-256") => p256::SecretKey::from_slice(&d)
                    .map_err(|e| Error::Parse(format!("invalid P-256 key: {e}")))?
                    .to_pkcs8_der()
                    .map_err(|e| Error::Internal(anyhow::anyhow!("pkcs8 encoding: {e}")))?,
                Some("P-384") => p384::SecretKey::from_slice(&d)
                    .map_err(|e| Error::Parse(format!("invalid P-384 key: {e}")))?
                    .to_pkcs8_der()
                    .map_err(|e| Error::Internal(anyhow::anyhow!("pkcs8 encoding: {e}")))?,
                other => {
                    return Err(Error::UnsupportedAlgorithm(format!(
                        "EC curve {:?}",
                        other.unwrap_or("<none>")
                    )))
                }
            };
            Ok(EncodingKey::from_ec_der(der.as_bytes()))
        }
        other => Err(Error::UnsupportedAlgorithm(other.to_string())),
    }
}

fn decoding_key(key: &Jwk) -> Result<DecodingKey> {
    match key.kty.as_str() {
        "RSA" => {
            let n = key
                .n
                .as_deref()
                .ok_or_else(|| Error::Parse("RSA jwk has no 'n'".into()))?;
            let e = key
                .e
                .as_deref()
                .ok_or_else(|| Error::Parse("RSA jwk has no 'e'".into()))?;
            DecodingKey::from_rsa_components(n, e)
                .map_err(|e| Error::Parse(format!("invalid RSA jwk: {e}")))
        }
        "EC" => {
            let x = key
                .x
                .as_deref()
                .ok_or_else(|| Error::Parse("EC jwk has no 'x'".into()))?;
            let y = key
                .y
                .as_deref()
                .ok_or_else(|| Error::Parse("EC jwk has no 'y'".into()))?;
            DecodingKey::from_ec_components(x, y)
                .map_err(|e| Error::Parse(format!("invalid EC jwk: {e}")))
        }
        other => Err(Error::UnsupportedAlgorithm(other.to_string())),
    }
}

fn rsa_component(value: Option<&str>, member: &str) -> Result<BigUint> {
    let raw = value.ok_or_else(|| Error::Parse(format!("RSA private jwk has no '{member}'")))?;
    Ok(BigUint::from_bytes_be(&b64_decode(raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use serde_json::json;

    static RSA_KEY: Lazy<Jwk> = Lazy::new(|| Jwk::generate_rsa().unwrap());

    fn service() -> JoseService {
        let mut cfg = Config::new("https://rp.example");
        cfg.redirect_uris = vec!["https://rp.example/cb".into()];
        cfg.trust_anchors = vec!["https://ta.example".into()];
        JoseService::new(&cfg).unwrap()
    }

    fn private_set() -> JwkSet {
        JwkSet {
            keys: vec![RSA_KEY.clone()],
        }
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let jose = service();
        let payload = json!({"iss": "https://rp.example", "sub": "https://rp.example"});
        let jws = jose
            .sign(&payload, &private_set(), Some(ENTITY_STATEMENT_TYP))
            .unwrap();

        let (header, body) = decode_parts(&jws).unwrap();
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["typ"], ENTITY_STATEMENT_TYP);
        assert_eq!(header["kid"], RSA_KEY.kid.clone().unwrap().as_str());
        assert_eq!(body, payload);

        // verification only needs the public half
        let verified = jose.verify(&jws, &private_set().to_public()).unwrap();
        assert_eq!(verified, payload);
    }

    #[test]
    fn test_verify_rejects_unknown_kid() {
        let jose = service();
        let payload = json!({"sub": "x"});
        let jws = jose.sign(&payload, &private_set(), None).unwrap();

        let mut stranger = RSA_KEY.to_public();
        stranger.kid = Some("other-kid".into());
        let err = jose
            .verify(&jws, &JwkSet { keys: vec![stranger] })
            .unwrap_err();
        assert!(matches!(err, Error::UnknownKid(_)));
    }

    #[test]
    fn test_verify_rejects_disallowed_alg() {
        let mut cfg = Config::new("https://rp.example");
        cfg.redirect_uris = vec!["https://rp.example/cb".into()];
        cfg.trust_anchors = vec!["https://ta.example".into()];
        cfg.allowed_signing_algs = vec!["ES256".into()];
        cfg.default_signature_alg = "ES256".into();
        let strict = JoseService::new(&cfg).unwrap();

        // signed with RS256 by the default service
        let jws = service()
            .sign(&json!({"sub": "x"}), &private_set(), None)
            .unwrap();
        let err = strict.verify(&jws, &private_set().to_public()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let jose = service();
        let jws = jose
            .sign(&json!({"amount": 1}), &private_set(), None)
            .unwrap();

        let mut segments: Vec<String> = jws.split('.').map(String::from).collect();
        segments[1] = crate::jose::jwk::b64(br#"{"amount":1000000}"#);
        let forged = segments.join(".");

        assert!(jose.verify(&forged, &private_set().to_public()).is_err());
    }

    #[test]
    fn test_decode_parts_requires_three_segments() {
        assert!(matches!(decode_parts("a.b"), Err(Error::Parse(_))));
        assert!(matches!(decode_parts("not a jwt"), Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn test_jwks_from_metadata_prefers_inline() {
        let jose = service();
        let metadata = json!({
            "jwks": { "keys": [RSA_KEY.to_public()] },
            "jwks_uri": "https://unreachable.example/jwks.json",
        });
        let set = jose
            .jwks_from_metadata("https://op.example", &metadata)
            .await
            .unwrap();
        assert_eq!(set.keys.len(), 1);
    }

    #[tokio::test]
    async fn test_jwks_from_metadata_neither_source() {
        let jose = service();
        let err = jose
            .jwks_from_metadata("https://op.example", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingJwks(_)));
    }
}
