use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use pa_core::clock::{system_clock, SharedClock};
use pa_core::config::RateLimitSection;
use pa_core::types::RateLimitStrategy;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownSignal;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors returned by [`RateLimiter`].
///
/// # Examples
///
/// ```rust
/// use pa_harness::rate_limiter::{RateLimiter, RateLimitConfig, RateLimitError};
///
/// let limiter = RateLimiter::new();
/// let config = RateLimitConfig::fixed(1, 60_000);
///
/// assert!(limiter.enforce("org-1:openai", &config).is_ok());
/// match limiter.enforce("org-1:openai", &config) {
///     Err(RateLimitError::Exceeded { key, retry_after, .. }) => {
///         println!("'{key}' throttled, retry after {retry_after:?}");
///     }
///     other => panic!("expected throttling, got {other:?}"),
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// `max_requests` or `window_ms` is zero.
    #[error("invalid rate limit config: {0}")]
    InvalidConfig(String),

    /// The key has used up its allowance for the current window.
    #[error("rate limit exceeded for key `{key}`, retry after {retry_after:?}")]
    Exceeded {
        key: String,
        reset_at: DateTime<Utc>,
        retry_after: Duration,
    },
}

// ---------------------------------------------------------------------------
// Config & decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window_ms: u64,
    #[serde(default)]
    pub strategy: RateLimitStrategy,
}

impl RateLimitConfig {
    pub fn new(max_requests: u64, window_ms: u64, strategy: RateLimitStrategy) -> Self {
        Self {
            max_requests,
            window_ms,
            strategy,
        }
    }

    pub fn fixed(max_requests: u64, window_ms: u64) -> Self {
        Self::new(max_requests, window_ms, RateLimitStrategy::Fixed)
    }

    pub fn sliding(max_requests: u64, window_ms: u64) -> Self {
        Self::new(max_requests, window_ms, RateLimitStrategy::Sliding)
    }

    pub fn token_bucket(max_requests: u64, window_ms: u64) -> Self {
        Self::new(max_requests, window_ms, RateLimitStrategy::TokenBucket)
    }

    /// `count` requests per minute, fixed window.
    pub fn per_minute(count: u64) -> Self {
        Self::fixed(count, 60_000)
    }

    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.max_requests == 0 {
            return Err(RateLimitError::InvalidConfig(
                "max_requests must be > 0".into(),
            ));
        }
        if self.window_ms == 0 || self.window_ms > i64::MAX as u64 {
            return Err(RateLimitError::InvalidConfig(
                "window_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl From<&RateLimitSection> for RateLimitConfig {
    fn from(section: &RateLimitSection) -> Self {
        Self::new(section.max_requests, section.window_ms, section.strategy)
    }
}

/// Result of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Per-key state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct WindowCounter {
    count: u64,
    touched_ms: i64,
}

/// Request timestamps inside the trailing window, oldest first.
#[derive(Debug)]
struct SlidingLog {
    hits: VecDeque<i64>,
    touched_ms: i64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill_ms: i64,
}

fn to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Per-key admission control over three strategies.
///
/// Each check-then-update runs while holding the key's map shard lock, so two
/// threads checking the same key never both take the last slot.
#[derive(Debug)]
pub struct RateLimiter {
    clock: SharedClock,
    windows: DashMap<(String, i64), WindowCounter>,
    logs: DashMap<String, SlidingLog>,
    buckets: DashMap<String, TokenBucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            windows: DashMap::new(),
            logs: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    /// Check and, when allowed, consume one unit of `key`'s allowance.
    pub fn check_rate_limit(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision, RateLimitError> {
        config.validate()?;
        let now = self.clock.now_ms();
        let decision = match config.strategy {
            RateLimitStrategy::Fixed => self.check_fixed(key, config, now),
            RateLimitStrategy::Sliding => self.check_sliding(key, config, now),
            RateLimitStrategy::TokenBucket => self.check_bucket(key, config, now),
        };
        debug!(
            key,
            strategy = %config.strategy,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "rate limit check"
        );
        Ok(decision)
    }

    /// Like [`check_rate_limit`](Self::check_rate_limit) but turns a denial
    /// into [`RateLimitError::Exceeded`].
    pub fn enforce(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let decision = self.check_rate_limit(key, config)?;
        if decision.allowed {
            return Ok(decision);
        }
        let wait_ms = (decision.reset_at.timestamp_millis() - self.clock.now_ms()).max(0);
        let retry_after = Duration::from_millis(wait_ms as u64);
        warn!(key, ?retry_after, "rate limit exceeded");
        Err(RateLimitError::Exceeded {
            key: key.to_string(),
            reset_at: decision.reset_at,
            retry_after,
        })
    }

    fn check_fixed(&self, key: &str, config: &RateLimitConfig, now: i64) -> RateLimitDecision {
        let window_ms = config.window_ms as i64;
        let index = now.div_euclid(window_ms);
        let mut counter = self
            .windows
            .entry((key.to_string(), index))
            .or_insert(WindowCounter {
                count: 0,
                touched_ms: now,
            });
        counter.touched_ms = now;

        let allowed = counter.count < config.max_requests;
        if allowed {
            counter.count += 1;
        }
        RateLimitDecision {
            allowed,
            remaining: config.max_requests.saturating_sub(counter.count),
            reset_at: to_datetime(index.saturating_mul(window_ms).saturating_add(window_ms)),
        }
    }

    fn check_sliding(&self, key: &str, config: &RateLimitConfig, now: i64) -> RateLimitDecision {
        let window_ms = config.window_ms as i64;
        let mut log = self
            .logs
            .entry(key.to_string())
            .or_insert_with(|| SlidingLog {
                hits: VecDeque::new(),
                touched_ms: now,
            });
        log.touched_ms = now;

        let horizon = now.saturating_sub(window_ms);
        while log.hits.front().is_some_and(|&t| t <= horizon) {
            log.hits.pop_front();
        }

        let used = log.hits.len() as u64;
        let allowed = used < config.max_requests;
        if allowed {
            log.hits.push_back(now);
        }
        let oldest = log.hits.front().copied().unwrap_or(now);
        RateLimitDecision {
            allowed,
            remaining: config.max_requests.saturating_sub(log.hits.len() as u64),
            reset_at: to_datetime(oldest.saturating_add(window_ms)),
        }
    }

    fn check_bucket(&self, key: &str, config: &RateLimitConfig, now: i64) -> RateLimitDecision {
        let max = config.max_requests as f64;
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert(TokenBucket {
                tokens: max,
                last_refill_ms: now,
            });

        let elapsed = (now - bucket.last_refill_ms).max(0) as f64;
        let refill = (elapsed / config.window_ms as f64 * max).floor();
        bucket.tokens = (bucket.tokens + refill).min(max);
        bucket.last_refill_ms = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        RateLimitDecision {
            allowed,
            remaining: bucket.tokens.floor() as u64,
            reset_at: to_datetime(now.saturating_add(config.window_ms as i64)),
        }
    }

    /// Drop every entry untouched for longer than `max_age`. Returns how many
    /// were removed.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX));
        let before = self.len();
        self.windows.retain(|_, c| c.touched_ms >= cutoff);
        self.logs.retain(|_, l| l.touched_ms >= cutoff);
        self.buckets.retain(|_, b| b.last_refill_ms >= cutoff);
        let removed = before.saturating_sub(self.len());
        if removed > 0 {
            debug!(removed, "swept stale rate limit state");
        }
        removed
    }

    /// Forget all state for `key` under every strategy.
    pub fn reset(&self, key: &str) {
        self.windows.retain(|(k, _), _| k != key);
        self.logs.remove(key);
        self.buckets.remove(key);
    }

    /// Number of tracked state entries.
    pub fn len(&self) -> usize {
        self.windows.len() + self.logs.len() + self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run [`RateLimiter::sweep_stale`] every `interval` until `shutdown` fires.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    max_age: Duration,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        info!(?interval, ?max_age, "rate limit sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    limiter.sweep_stale(max_age);
                }
            }
        }
        info!("rate limit sweeper stopped");
    })
}

// ---------------------------------------------------------------------------
// RateLimitRegistry
// ---------------------------------------------------------------------------

/// Provider name → [`RateLimitConfig`], with a `"default"` entry for
/// providers that have none of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRegistry {
    configs: BTreeMap<String, RateLimitConfig>,
}

impl Default for RateLimitRegistry {
    fn default() -> Self {
        let mut configs = BTreeMap::new();
        configs.insert("openai".into(), RateLimitConfig::fixed(60, 60_000));
        configs.insert("anthropic".into(), RateLimitConfig::fixed(50, 60_000));
        configs.insert("ollama".into(), RateLimitConfig::token_bucket(1000, 60_000));
        configs.insert("default".into(), RateLimitConfig::fixed(100, 60_000));
        Self { configs }
    }
}

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in defaults overlaid with `[rate_limits.<provider>]` sections.
    pub fn from_sections(sections: &BTreeMap<String, RateLimitSection>) -> Self {
        let mut registry = Self::default();
        for (provider, section) in sections {
            registry
                .configs
                .insert(provider.clone(), RateLimitConfig::from(section));
        }
        registry
    }

    pub fn set(&mut self, provider: impl Into<String>, config: RateLimitConfig) {
        self.configs.insert(provider.into(), config);
    }

    /// Config for `provider`, falling back to `"default"`.
    pub fn config_for(&self, provider: &str) -> RateLimitConfig {
        self.configs
            .get(provider)
            .or_else(|| self.configs.get("default"))
            .copied()
            .unwrap_or_else(|| RateLimitConfig::per_minute(100))
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
