//! Feature flag evaluation with targeting and percentage rollout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pa_core::clock::{system_clock, SharedClock};
use pa_core::config::FeatureFlagsConfig;
use pa_core::hashing::string_hash;
use pa_core::store::{FlagStore, StoreError};
use pa_core::types::FeatureFlag;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct FlagCache {
    flags: HashMap<String, FeatureFlag>,
    refreshed_at: DateTime<Utc>,
}

/// Read-through cache over a [`FlagStore`]. The whole flag set is refreshed
/// at once; the TTL runs from the last refresh, not per flag.
pub struct FeatureFlagService {
    store: Arc<dyn FlagStore>,
    cache: RwLock<Option<FlagCache>>,
    ttl: Duration,
    clock: SharedClock,
}

impl FeatureFlagService {
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
            ttl: DEFAULT_CACHE_TTL,
            clock: system_clock(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_config(self, config: &FeatureFlagsConfig) -> Self {
        self.with_ttl(Duration::from_secs(config.cache_ttl_secs))
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Evaluate `name` for the caller. Missing flags and store failures
    /// evaluate to `false`.
    pub async fn is_feature_enabled(
        &self,
        name: &str,
        user_id: Option<&str>,
        organization_id: Option<&str>,
    ) -> bool {
        let flag = match self.get_flag(name).await {
            Ok(Some(flag)) => flag,
            Ok(None) => return false,
            Err(e) => {
                warn!(flag = name, error = %e, "feature flag lookup failed, treating as disabled");
                return false;
            }
        };
        evaluate(&flag, user_id, organization_id)
    }

    pub async fn get_flag(&self, name: &str) -> Result<Option<FeatureFlag>, StoreError> {
        {
            let cache = self.cache.read().await;
            if let Some(cache) = cache.as_ref().filter(|c| self.is_fresh(c)) {
                return Ok(cache.flags.get(name).cloned());
            }
        }
        Ok(self.refresh().await?.remove(name))
    }

    /// Every flag, sorted by name.
    pub async fn get_all_flags(&self) -> Result<Vec<FeatureFlag>, StoreError> {
        let cached = {
            let cache = self.cache.read().await;
            cache
                .as_ref()
                .filter(|c| self.is_fresh(c))
                .map(|c| c.flags.clone())
        };
        let flags = match cached {
            Some(flags) => flags,
            None => self.refresh().await?,
        };
        let mut flags: Vec<FeatureFlag> = flags.into_values().collect();
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flags)
    }

    /// Create or replace a flag. The cache is dropped so the next read sees it.
    pub async fn set_feature_flag(&self, mut flag: FeatureFlag) -> Result<(), StoreError> {
        flag.updated_at = self.clock.now();
        if let Some(pct) = flag.rollout_percentage {
            flag.rollout_percentage = Some(pct.min(100));
        }
        self.store.upsert_flag(&flag).await?;
        info!(flag = %flag.name, enabled = flag.enabled, "feature flag updated");
        self.invalidate_cache().await;
        Ok(())
    }

    pub async fn delete_feature_flag(&self, name: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete_flag(name).await?;
        if removed {
            info!(flag = name, "feature flag deleted");
        }
        self.invalidate_cache().await;
        Ok(removed)
    }

    pub async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }

    fn is_fresh(&self, cache: &FlagCache) -> bool {
        let age = self.clock.now() - cache.refreshed_at;
        age.to_std().map_or(true, |age| age < self.ttl)
    }

    async fn refresh(&self) -> Result<HashMap<String, FeatureFlag>, StoreError> {
        let mut cache = self.cache.write().await;
        if let Some(current) = cache.as_ref().filter(|c| self.is_fresh(c)) {
            return Ok(current.flags.clone());
        }
        let flags: HashMap<String, FeatureFlag> = self
            .store
            .list_flags()
            .await?
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();
        debug!(count = flags.len(), "feature flag cache refreshed");
        *cache = Some(FlagCache {
            flags: flags.clone(),
            refreshed_at: self.clock.now(),
        });
        Ok(flags)
    }
}

/// Hard gates in order: enabled, user targeting, organization targeting,
/// rollout.
fn evaluate(flag: &FeatureFlag, user_id: Option<&str>, organization_id: Option<&str>) -> bool {
    if !flag.enabled {
        return false;
    }
    if !flag.target_users.is_empty()
        && !user_id.is_some_and(|u| flag.target_users.iter().any(|t| t == u))
    {
        return false;
    }
    if !flag.target_organizations.is_empty()
        && !organization_id.is_some_and(|o| flag.target_organizations.iter().any(|t| t == o))
    {
        return false;
    }
    match flag.rollout_percentage {
        Some(pct) if pct < 100 => match user_id {
            Some(user) => rollout_bucket(user, &flag.name) <= u32::from(pct),
            // Anonymous callers get a fresh draw per evaluation.
            None => rand::thread_rng().gen_range(0.0..100.0) <= f64::from(pct),
        },
        _ => true,
    }
}

/// 1..=100, stable per (user, flag).
pub fn rollout_bucket(user_id: &str, flag_name: &str) -> u32 {
    string_hash(&format!("{user_id}{flag_name}")) % 100 + 1
}
