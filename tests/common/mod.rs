#![allow(dead_code)]
//! Shared harness: a miniature federation served by wiremock.
//!
//! One Trust Anchor and one Identity Provider, each with real RSA keys and
//! really-signed statements, so the full verification path runs against
//! live HTTP the way production does.

use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use spid_cie_oidc::config::Config;
use spid_cie_oidc::jose::{Jwk, JwkSet, JoseService, ENTITY_STATEMENT_TYP};
use spid_cie_oidc::relying_party::RelyingParty;
use spid_cie_oidc::store::MemoryStore;

pub const RP_CLIENT_ID: &str = "https://rp.example";
pub const ENTITY_STATEMENT_CONTENT_TYPE: &str = "application/entity-statement+jwt";

// Key generation dominates test start-up; share one key per role.
pub static TA_KEY: Lazy<Jwk> = Lazy::new(|| Jwk::generate_rsa().unwrap());
pub static IDP_KEY: Lazy<Jwk> = Lazy::new(|| Jwk::generate_rsa().unwrap());
pub static RP_KEY: Lazy<Jwk> = Lazy::new(|| Jwk::generate_rsa().unwrap());
pub static INTERMEDIATE_KEY: Lazy<Jwk> = Lazy::new(|| Jwk::generate_rsa().unwrap());

pub fn jose() -> JoseService {
    let mut cfg = Config::new(RP_CLIENT_ID);
    cfg.redirect_uris = vec![format!("{RP_CLIENT_ID}/cb")];
    cfg.trust_anchors = vec!["https://ta.example".into()];
    JoseService::new(&cfg).unwrap()
}

pub fn sign(key: &Jwk, payload: &Value) -> String {
    jose()
        .sign(
            payload,
            &JwkSet {
                keys: vec![key.clone()],
            },
            Some(ENTITY_STATEMENT_TYP),
        )
        .unwrap()
}

pub fn keys_of(key: &Jwk) -> Value {
    json!({ "keys": [key.to_public()] })
}

pub fn jwt_response(jwt: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", ENTITY_STATEMENT_CONTENT_TYPE)
        .set_body_string(jwt.to_string())
}

pub async fn mount_well_known(server: &MockServer, jwt: &str) {
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-federation"))
        .respond_with(jwt_response(jwt))
        .mount(server)
        .await;
}

pub async fn mount_fetch(server: &MockServer, subject: &str, jwt: &str) {
    Mock::given(method("GET"))
        .and(path("/fetch"))
        .and(query_param("sub", subject))
        .respond_with(jwt_response(jwt))
        .mount(server)
        .await;
}

pub struct TestFederation {
    pub ta: MockServer,
    pub idp: MockServer,
}

impl TestFederation {
    pub async fn start() -> Self {
        Self::start_with(json!({})).await
    }

    /// `idp_extra` is merged into the IdP's entity-configuration payload
    /// (e.g. to attach trust marks).
    pub async fn start_with(idp_extra: Value) -> Self {
        let ta = MockServer::start().await;
        let idp = MockServer::start().await;
        let now = Utc::now().timestamp();

        let ta_ec = sign(
            &TA_KEY,
            &json!({
                "iss": ta.uri(),
                "sub": ta.uri(),
                "iat": now,
                "exp": now + 7200,
                "jwks": keys_of(&TA_KEY),
                "metadata": {
                    "federation_entity": {
                        "federation_fetch_endpoint": format!("{}/fetch", ta.uri()),
                        "organization_name": "Example Trust Anchor",
                    }
                },
            }),
        );

        let mut idp_payload = json!({
            "iss": idp.uri(),
            "sub": idp.uri(),
            "iat": now,
            "exp": now + 3600,
            "jwks": keys_of(&IDP_KEY),
            "authority_hints": [ta.uri()],
            "metadata": {
                "openid_provider": {
                    "issuer": idp.uri(),
                    "authorization_endpoint": format!("{}/authorize", idp.uri()),
                    "token_endpoint": format!("{}/token", idp.uri()),
                    "jwks": keys_of(&IDP_KEY),
                    "contacts": ["ops@idp.example"],
                }
            },
        });
        if let (Some(base), Some(extra)) = (idp_payload.as_object_mut(), idp_extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        let idp_ec = sign(&IDP_KEY, &idp_payload);

        let ta_statement_about_idp = sign(
            &TA_KEY,
            &json!({
                "iss": ta.uri(),
                "sub": idp.uri(),
                "iat": now,
                "exp": now + 5400,
                "jwks": keys_of(&IDP_KEY),
                "metadata_policy": {
                    "openid_provider": {
                        "contacts": { "add": ["federation-ops@ta.example"] },
                    }
                },
            }),
        );

        mount_well_known(&ta, &ta_ec).await;
        mount_fetch(&ta, &idp.uri(), &ta_statement_about_idp).await;
        mount_well_known(&idp, &idp_ec).await;

        Self { ta, idp }
    }

    pub fn config(&self) -> Config {
        let mut cfg = Config::new(RP_CLIENT_ID);
        cfg.application_name = "Example RP".into();
        cfg.contacts = vec!["ops@rp.example".into()];
        cfg.redirect_uris = vec![
            format!("{RP_CLIENT_ID}/cb"),
            format!("{RP_CLIENT_ID}/cb2"),
        ];
        cfg.trust_anchors = vec![self.ta.uri()];
        cfg.default_trust_anchor = self.ta.uri();
        cfg.spid_providers.insert(self.idp.uri(), self.ta.uri());
        cfg.jwk = serde_json::to_string(&*RP_KEY).unwrap();
        cfg.trust_marks = vec![json!({
            "id": "https://ta.example/marks/openid_relying_party",
            "trust_mark": "a.b.c",
        })];
        cfg
    }

    /// A relying party whose federation entity has already been persisted
    /// through the onboarding flow.
    pub async fn onboarded_rp(&self) -> (Arc<MemoryStore>, RelyingParty) {
        self.onboarded_rp_with(self.config()).await
    }

    pub async fn onboarded_rp_with(&self, config: Config) -> (Arc<MemoryStore>, RelyingParty) {
        let store = Arc::new(MemoryStore::new());
        let rp = RelyingParty::new(config, store.clone()).unwrap();
        let data = rp
            .get_well_known_data(
                &format!("{RP_CLIENT_ID}/.well-known/openid-federation"),
                true,
            )
            .await
            .unwrap();
        assert_eq!(data.step, spid_cie_oidc::OnboardingStep::Complete);
        (store, rp)
    }
}

/// Decoded query parameters of an URL, for assertions.
pub fn query_params(raw_url: &str) -> std::collections::HashMap<String, String> {
    let url = url::Url::parse(raw_url).unwrap();
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
