//! In-memory store adapter.
//!
//! DashMap gives per-key serialisation of upserts while readers see a
//! consistent snapshot of each entry. Suitable for single-process
//! deployments and as the test double for the persistence contract.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::errors::{Error, Result};
use crate::store::{AuthRequestRecord, CachedEntityInfo, FederationEntity, FederationStore};
use crate::trust::chain::{MetadataType, TrustChain};

#[derive(Default)]
pub struct MemoryStore {
    federation_entities: DashMap<String, FederationEntity>,
    entity_info: DashMap<String, CachedEntityInfo>,
    trust_chains: DashMap<String, TrustChain>,
    auth_requests: DashMap<String, AuthRequestRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn info_key(subject: &str, issuer: &str) -> String {
        format!("{subject}|{issuer}")
    }

    fn chain_key(subject: &str, trust_anchor: &str, metadata_type: MetadataType) -> String {
        format!("{subject}|{trust_anchor}|{}", metadata_type.as_str())
    }
}

#[async_trait]
impl FederationStore for MemoryStore {
    async fn fetch_federation_entity(&self, subject: &str) -> Result<Option<FederationEntity>> {
        Ok(self.federation_entities.get(subject).map(|e| e.clone()))
    }

    async fn store_federation_entity(&self, entity: FederationEntity) -> Result<FederationEntity> {
        self.federation_entities
            .insert(entity.subject.clone(), entity.clone());
        Ok(entity)
    }

    async fn fetch_entity_info(
        &self,
        subject: &str,
        issuer: &str,
    ) -> Result<Option<CachedEntityInfo>> {
        Ok(self
            .entity_info
            .get(&Self::info_key(subject, issuer))
            .map(|e| e.clone()))
    }

    async fn store_entity_info(&self, info: CachedEntityInfo) -> Result<CachedEntityInfo> {
        self.entity_info
            .insert(Self::info_key(&info.subject, &info.issuer), info.clone());
        Ok(info)
    }

    async fn invalidate_entity_info(&self, subject: &str, issuer: &str) -> Result<()> {
        self.entity_info.remove(&Self::info_key(subject, issuer));
        Ok(())
    }

    async fn fetch_trust_chain(
        &self,
        subject: &str,
        trust_anchor: &str,
        metadata_type: MetadataType,
    ) -> Result<Option<TrustChain>> {
        Ok(self
            .trust_chains
            .get(&Self::chain_key(subject, trust_anchor, metadata_type))
            .map(|c| c.clone()))
    }

    async fn fetch_trust_chains_by_anchor(&self, trust_anchor: &str) -> Result<Vec<TrustChain>> {
        Ok(self
            .trust_chains
            .iter()
            .filter(|entry| entry.trust_anchor == trust_anchor)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn fetch_oidc_provider(&self, subject: &str) -> Result<Option<TrustChain>> {
        Ok(self
            .trust_chains
            .iter()
            .find(|entry| {
                entry.subject == subject && entry.metadata_type == MetadataType::OpenidProvider
            })
            .map(|entry| entry.clone()))
    }

    async fn store_trust_chain(&self, mut chain: TrustChain) -> Result<TrustChain> {
        let key = Self::chain_key(&chain.subject, &chain.trust_anchor, chain.metadata_type);
        match self.trust_chains.entry(key) {
            Entry::Occupied(mut existing) => {
                // administrative flags survive a rebuild
                chain.active = existing.get().active;
                chain.created_at = existing.get().created_at;
                chain.modified_at = Utc::now();
                existing.insert(chain.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(chain.clone());
            }
        }
        Ok(chain)
    }

    async fn deactivate_trust_chain(
        &self,
        subject: &str,
        trust_anchor: &str,
        metadata_type: MetadataType,
    ) -> Result<bool> {
        let key = Self::chain_key(subject, trust_anchor, metadata_type);
        match self.trust_chains.get_mut(&key) {
            Some(mut chain) => {
                chain.active = false;
                chain.modified_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn store_auth_request(&self, record: AuthRequestRecord) -> Result<AuthRequestRecord> {
        match self.auth_requests.entry(record.state.clone()) {
            Entry::Occupied(_) => Err(Error::ConflictingState(record.state)),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn fetch_auth_request(&self, state: &str) -> Result<Option<AuthRequestRecord>> {
        Ok(self.auth_requests.get(state).map(|r| r.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::chain::ChainStatus;
    use serde_json::json;

    fn chain(subject: &str, exp: i64, active: bool) -> TrustChain {
        let now = Utc::now();
        TrustChain {
            subject: subject.to_string(),
            trust_anchor: "https://ta.example".to_string(),
            metadata_type: MetadataType::OpenidProvider,
            chain: vec!["a.b.c".into(), "d.e.f".into()],
            parties_involved: vec![subject.to_string(), "https://ta.example".into()],
            final_metadata: json!({"authorization_endpoint": "https://idp.example/authorize"}),
            exp,
            verified_trust_marks: Vec::new(),
            status: ChainStatus::Valid,
            active,
            created_at: now,
            modified_at: now,
        }
    }

    #[tokio::test]
    async fn test_trust_chain_upsert_preserves_active_flag() {
        let store = MemoryStore::new();
        let now = Utc::now().timestamp();

        store
            .store_trust_chain(chain("https://idp.example", now - 10, true))
            .await
            .unwrap();
        store
            .deactivate_trust_chain(
                "https://idp.example",
                "https://ta.example",
                MetadataType::OpenidProvider,
            )
            .await
            .unwrap();

        // a rebuild must not silently re-enable the chain
        let rebuilt = store
            .store_trust_chain(chain("https://idp.example", now + 3600, true))
            .await
            .unwrap();
        assert!(!rebuilt.active);
        assert_eq!(rebuilt.exp, now + 3600);
    }

    #[tokio::test]
    async fn test_auth_request_state_is_write_once() {
        let store = MemoryStore::new();
        let record = AuthRequestRecord {
            client_id: "https://rp.example".into(),
            state: "abc".into(),
            endpoint: "https://idp.example/authorize".into(),
            provider: "https://idp.example".into(),
            provider_jwks: Default::default(),
            provider_configuration: json!({}),
            data: json!({"code_verifier": "v"}),
            created_at: Utc::now(),
        };

        store.store_auth_request(record.clone()).await.unwrap();
        let err = store.store_auth_request(record).await.unwrap_err();
        assert!(matches!(err, Error::ConflictingState(s) if s == "abc"));
    }

    #[tokio::test]
    async fn test_entity_info_upsert_and_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now().timestamp();
        let mut info = CachedEntityInfo {
            subject: "https://idp.example".into(),
            issuer: "https://idp.example".into(),
            iat: now - 120,
            exp: now - 60,
            payload: json!({}),
            jwt: "a.b.c".into(),
            modified_at: Utc::now(),
        };

        store.store_entity_info(info.clone()).await.unwrap();
        let cached = store
            .fetch_entity_info("https://idp.example", "https://idp.example")
            .await
            .unwrap()
            .unwrap();
        assert!(cached.is_expired());

        info.exp = now + 3600;
        info.jwt = "d.e.f".into();
        store.store_entity_info(info).await.unwrap();
        let refreshed = store
            .fetch_entity_info("https://idp.example", "https://idp.example")
            .await
            .unwrap()
            .unwrap();
        assert!(!refreshed.is_expired());
        assert_eq!(refreshed.jwt, "d.e.f");
    }

    #[tokio::test]
    async fn test_fetch_oidc_provider_matches_subject() {
        let store = MemoryStore::new();
        let now = Utc::now().timestamp();
        store
            .store_trust_chain(chain("https://idp.example", now + 3600, true))
            .await
            .unwrap();

        assert!(store
            .fetch_oidc_provider("https://idp.example")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .fetch_oidc_provider("https://other.example")
            .await
            .unwrap()
            .is_none());
    }
}
