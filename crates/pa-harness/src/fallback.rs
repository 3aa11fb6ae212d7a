//! Ordered provider fallback with per-attempt timeouts.
//!
//! A [`FallbackStrategy`] names a primary provider and an ordered list of
//! alternates. [`FallbackOrchestrator::execute_with_fallback`] runs an
//! operation against the primary and walks the alternates while failures are
//! classified as retryable by [`is_retryable`].
//!
//! Each attempt is raced against `tokio::time::timeout`. When the timer wins,
//! the attempt's future is dropped, so the in-flight provider call is
//! cancelled rather than left running in the background.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pa_core::config::FallbackSection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::provider::{AiProvider, ProviderError, ProviderRegistry};

/// Substrings that mark an error as transient.
pub const DEFAULT_RETRYABLE_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ENOTFOUND",
    "timeout",
    "rate_limit",
    "server_error",
    "temporary",
];

/// Substrings that abort the whole chain.
pub const NON_RETRYABLE_CODES: &[&str] = &["unauthorized", "forbidden", "invalid_api_key"];

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FallbackError {
    /// The strategy cannot run at all (e.g. primary not registered).
    #[error("fallback configuration error: {0}")]
    Configuration(String),

    /// A provider failed in a way that retrying elsewhere will not fix.
    #[error("provider `{provider}` failed with a non-retryable error: {source}")]
    NonRetryable {
        provider: String,
        #[source]
        source: ProviderError,
    },

    /// Every attempted provider failed. `last_provider` produced `last_error`.
    #[error("all providers failed after {attempts} attempt(s); last error from `{last_provider}`: {last_error}")]
    AllProvidersExhausted {
        attempts: u32,
        last_provider: String,
        last_error: ProviderError,
    },
}

impl FallbackError {
    /// The provider error that ended the chain, if any.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Configuration(_) => None,
            Self::NonRetryable { source, .. } => Some(source),
            Self::AllProvidersExhausted { last_error, .. } => Some(last_error),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConditions {
    /// Extra retryable substrings on top of [`DEFAULT_RETRYABLE_CODES`].
    #[serde(default)]
    pub error_codes: Vec<String>,
    /// Upper bound on fallback attempts after the primary.
    pub max_retries: u32,
    pub timeout_ms: u64,
}

impl Default for RetryConditions {
    fn default() -> Self {
        Self {
            error_codes: Vec::new(),
            max_retries: 2,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackStrategy {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default)]
    pub conditions: RetryConditions,
}

impl FallbackStrategy {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            fallbacks: Vec::new(),
            conditions: RetryConditions::default(),
        }
    }

    pub fn with_fallbacks<I, S>(mut self, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallbacks = fallbacks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.conditions.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.conditions.max_retries = max_retries;
        self
    }

    pub fn with_error_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.error_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.conditions.timeout_ms)
    }
}

impl From<&FallbackSection> for FallbackStrategy {
    fn from(section: &FallbackSection) -> Self {
        Self {
            primary: section.primary.clone(),
            fallbacks: section.fallbacks.clone(),
            conditions: RetryConditions {
                error_codes: section.error_codes.clone(),
                max_retries: section.max_retries,
                timeout_ms: section.timeout_ms,
            },
        }
    }
}

/// Successful result plus which provider produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackOutcome<T> {
    pub result: T,
    pub provider_used: String,
    pub fallback_used: bool,
    /// Providers actually invoked, including the successful one.
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn is_fatal(err: &ProviderError) -> bool {
    NON_RETRYABLE_CODES
        .iter()
        .any(|code| contains_ci(&err.message, code))
}

/// Whether `err` is worth retrying on another provider.
///
/// Fatal markers in the message always win. A strategy's `extra_codes` match
/// next, then an explicit `retryable` flag, then [`DEFAULT_RETRYABLE_CODES`].
pub fn is_retryable(err: &ProviderError, extra_codes: &[String]) -> bool {
    if is_fatal(err) {
        return false;
    }
    if extra_codes.iter().any(|code| contains_ci(&err.message, code)) {
        return true;
    }
    if let Some(flag) = err.retryable {
        return flag;
    }
    DEFAULT_RETRYABLE_CODES
        .iter()
        .any(|code| contains_ci(&err.message, code))
}

// ---------------------------------------------------------------------------
// FallbackOrchestrator
// ---------------------------------------------------------------------------

/// Feature name → [`FallbackStrategy`], resolved with a `"default"` fallback.
#[derive(Debug)]
pub struct FallbackOrchestrator {
    strategies: DashMap<String, FallbackStrategy>,
}

impl Default for FallbackOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackOrchestrator {
    pub const DEFAULT_STRATEGY: &'static str = "default";

    /// Orchestrator preloaded with the `"default"` and `"production"`
    /// strategies.
    pub fn new() -> Self {
        let strategies = DashMap::new();
        strategies.insert(
            Self::DEFAULT_STRATEGY.to_string(),
            FallbackStrategy::new("ollama")
                .with_fallbacks(["mock"])
                .with_timeout(Duration::from_secs(30))
                .with_max_retries(2),
        );
        strategies.insert(
            "production".to_string(),
            FallbackStrategy::new("openai")
                .with_fallbacks(["anthropic", "ollama"])
                .with_timeout(Duration::from_secs(60))
                .with_max_retries(3),
        );
        Self { strategies }
    }

    /// Built-in strategies overlaid with `[fallback.<feature>]` sections.
    pub fn from_sections<'a>(
        sections: impl IntoIterator<Item = (&'a String, &'a FallbackSection)>,
    ) -> Self {
        let orchestrator = Self::new();
        for (feature, section) in sections {
            orchestrator.set_fallback_strategy(feature.clone(), FallbackStrategy::from(section));
        }
        orchestrator
    }

    pub fn set_fallback_strategy(&self, feature: impl Into<String>, strategy: FallbackStrategy) {
        self.strategies.insert(feature.into(), strategy);
    }

    /// Strategy for `feature`, or the `"default"` strategy.
    pub fn get_fallback_strategy(&self, feature: &str) -> FallbackStrategy {
        self.strategies
            .get(feature)
            .or_else(|| self.strategies.get(Self::DEFAULT_STRATEGY))
            .map(|s| s.value().clone())
            .unwrap_or_else(|| FallbackStrategy::new("ollama").with_fallbacks(["mock"]))
    }

    /// Remove a feature-specific strategy. The `"default"` strategy is kept.
    pub fn remove_fallback_strategy(&self, feature: &str) -> bool {
        if feature == Self::DEFAULT_STRATEGY {
            return false;
        }
        self.strategies.remove(feature).is_some()
    }

    /// Feature names with a registered strategy, sorted.
    pub fn features(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Run `op` against the strategy's primary, then its fallbacks.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        strategy: &FallbackStrategy,
        registry: &ProviderRegistry,
        op: F,
    ) -> Result<FallbackOutcome<T>, FallbackError>
    where
        F: Fn(Arc<dyn AiProvider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let primary = registry.get(&strategy.primary).ok_or_else(|| {
            FallbackError::Configuration(format!(
                "primary provider `{}` is not registered",
                strategy.primary
            ))
        })?;

        let timeout = strategy.timeout();
        let codes = &strategy.conditions.error_codes;

        let mut attempts = 1;
        let mut last_error = match attempt(&op, primary, timeout).await {
            Ok(result) => {
                info!(provider = %strategy.primary, "request served by primary provider");
                return Ok(FallbackOutcome {
                    result,
                    provider_used: strategy.primary.clone(),
                    fallback_used: false,
                    attempts,
                });
            }
            Err(err) => err,
        };
        warn!(provider = %strategy.primary, error = %last_error, "primary provider failed");

        let mut failed_provider = strategy.primary.clone();
        let mut fallback_attempts = 0;
        for name in &strategy.fallbacks {
            if !is_retryable(&last_error, codes) {
                warn!(
                    provider = %failed_provider,
                    error = %last_error,
                    "non-retryable error, not falling back"
                );
                return Err(FallbackError::NonRetryable {
                    provider: failed_provider,
                    source: last_error,
                });
            }
            if fallback_attempts >= strategy.conditions.max_retries {
                warn!(max_retries = strategy.conditions.max_retries, "fallback retry budget spent");
                break;
            }
            let Some(provider) = registry.get(name) else {
                warn!(provider = %name, "fallback provider not registered, skipping");
                continue;
            };

            fallback_attempts += 1;
            attempts += 1;
            match attempt(&op, provider, timeout).await {
                Ok(result) => {
                    info!(provider = %name, attempts, "request served by fallback provider");
                    return Ok(FallbackOutcome {
                        result,
                        provider_used: name.clone(),
                        fallback_used: true,
                        attempts,
                    });
                }
                Err(err) => {
                    warn!(provider = %name, error = %err, "fallback provider failed");
                    failed_provider = name.clone();
                    last_error = err;
                }
            }
        }

        if !is_retryable(&last_error, codes) {
            warn!(
                provider = %failed_provider,
                error = %last_error,
                "non-retryable error, not falling back"
            );
            return Err(FallbackError::NonRetryable {
                provider: failed_provider,
                source: last_error,
            });
        }
        Err(FallbackError::AllProvidersExhausted {
            attempts,
            last_provider: failed_provider,
            last_error,
        })
    }

    /// Resolve the strategy for `feature` and execute it.
    pub async fn execute_for_feature<T, F, Fut>(
        &self,
        feature: &str,
        registry: &ProviderRegistry,
        op: F,
    ) -> Result<FallbackOutcome<T>, FallbackError>
    where
        F: Fn(Arc<dyn AiProvider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let strategy = self.get_fallback_strategy(feature);
        self.execute_with_fallback(&strategy, registry, op).await
    }
}

async fn attempt<T, F, Fut>(
    op: &F,
    provider: Arc<dyn AiProvider>,
    timeout: Duration,
) -> Result<T, ProviderError>
where
    F: Fn(Arc<dyn AiProvider>) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, op(provider)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::timeout(format!(
            "operation timeout after {}ms",
            timeout.as_millis()
        ))),
    }
}
