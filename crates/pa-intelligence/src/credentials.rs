use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pa_core::clock::{system_clock, SharedClock};
use pa_core::config::ProvidersConfig;
use pa_harness::provider::ApiKey;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential backend unavailable: {0}")]
    Unavailable(String),
}

/// Resolves the API key an organization uses for a provider.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when no usable key exists.
    async fn get_api_key(
        &self,
        organization_id: Option<&str>,
        provider: &str,
    ) -> Result<Option<ApiKey>, CredentialError>;
}

// ---------------------------------------------------------------------------
// InMemoryCredentialStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub key: ApiKey,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredCredential {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: ApiKey::new(key),
            active: true,
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    fn usable_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// Per-organization keys held in memory. Keys stored without an organization
/// apply to every caller that has no key of its own.
#[derive(Debug)]
pub struct InMemoryCredentialStore {
    keys: RwLock<HashMap<(Option<String>, String), StoredCredential>>,
    clock: SharedClock,
}

impl Default for InMemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn insert(
        &self,
        organization_id: Option<&str>,
        provider: &str,
        credential: StoredCredential,
    ) {
        self.keys.write().await.insert(
            (organization_id.map(String::from), provider.to_string()),
            credential,
        );
    }

    pub async fn revoke(&self, organization_id: Option<&str>, provider: &str) -> bool {
        self.keys
            .write()
            .await
            .remove(&(organization_id.map(String::from), provider.to_string()))
            .is_some()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_api_key(
        &self,
        organization_id: Option<&str>,
        provider: &str,
    ) -> Result<Option<ApiKey>, CredentialError> {
        let now = self.clock.now();
        let keys = self.keys.read().await;
        let own = organization_id
            .and_then(|org| keys.get(&(Some(org.to_string()), provider.to_string())));
        let shared = keys.get(&(None, provider.to_string()));
        Ok(own
            .filter(|c| c.usable_at(now))
            .or_else(|| shared.filter(|c| c.usable_at(now)))
            .map(|c| c.key.clone()))
    }
}

// ---------------------------------------------------------------------------
// EnvCredentialStore
// ---------------------------------------------------------------------------

/// Reads keys from the environment variables named in `[providers]`.
/// Organization-agnostic.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialStore {
    providers: ProvidersConfig,
}

impl EnvCredentialStore {
    pub fn new(providers: ProvidersConfig) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn get_api_key(
        &self,
        _organization_id: Option<&str>,
        provider: &str,
    ) -> Result<Option<ApiKey>, CredentialError> {
        Ok(self
            .providers
            .key_env_for(provider)
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.trim().is_empty())
            .map(ApiKey::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pa_core::clock::{Clock, ManualClock};
    use std::sync::Arc;

    #[tokio::test]
    async fn org_key_beats_shared_key() {
        let store = InMemoryCredentialStore::new();
        store
            .insert(None, "openai", StoredCredential::new("shared"))
            .await;
        store
            .insert(Some("acme"), "openai", StoredCredential::new("acme-key"))
            .await;

        let key = store.get_api_key(Some("acme"), "openai").await.unwrap();
        assert_eq!(key.as_ref().map(ApiKey::expose), Some("acme-key"));
        let key = store.get_api_key(Some("other"), "openai").await.unwrap();
        assert_eq!(key.as_ref().map(ApiKey::expose), Some("shared"));
        assert!(store.get_api_key(None, "anthropic").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inactive_and_expired_keys_are_ignored() {
        let clock = Arc::new(ManualClock::at_millis(1_000_000));
        let store = InMemoryCredentialStore::new().with_clock(clock.clone());
        store
            .insert(Some("a"), "openai", StoredCredential::new("k").inactive())
            .await;
        assert!(store.get_api_key(Some("a"), "openai").await.unwrap().is_none());

        let expiry = clock.now() + chrono::Duration::seconds(10);
        store
            .insert(
                Some("b"),
                "openai",
                StoredCredential::new("k").expiring_at(expiry),
            )
            .await;
        assert!(store.get_api_key(Some("b"), "openai").await.unwrap().is_some());
        clock.advance_ms(10_000);
        assert!(store.get_api_key(Some("b"), "openai").await.unwrap().is_none());

        assert!(store.revoke(Some("b"), "openai").await);
    }

    #[tokio::test]
    async fn env_store_reads_configured_variable() {
        let providers = ProvidersConfig {
            openai_key_env: "PA_TEST_OPENAI_KEY_ENV_STORE".into(),
            ..ProvidersConfig::default()
        };
        std::env::set_var("PA_TEST_OPENAI_KEY_ENV_STORE", "sk-env");
        let store = EnvCredentialStore::new(providers);
        let key = store.get_api_key(Some("any"), "openai").await.unwrap();
        assert_eq!(key.as_ref().map(ApiKey::expose), Some("sk-env"));
        assert!(store.get_api_key(None, "ollama").await.unwrap().is_none());
        std::env::remove_var("PA_TEST_OPENAI_KEY_ENV_STORE");
    }
}
