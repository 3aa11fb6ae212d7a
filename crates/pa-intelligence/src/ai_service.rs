//! One request pipeline over the AI infrastructure pieces.
//!
//! Every call walks `feature check → rate limit → provider & credential
//! resolution → generate → cost tracking`. The steps before generation abort
//! without touching a provider. Tracking failures never fail the call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pa_core::config::{Config, SweeperConfig};
use pa_harness::fallback::{FallbackError, FallbackOrchestrator, FallbackStrategy};
use pa_harness::provider::{AiRequest, AiResponse, ApiKey, ProviderError, ProviderRegistry};
use pa_harness::rate_limiter::{spawn_sweeper, RateLimitError, RateLimitRegistry, RateLimiter};
use pa_harness::shutdown::BackgroundTasks;
use pa_telemetry::metrics::{MetricsCollector, AI_REQUESTS_TOTAL, AI_REQUEST_DURATION_SECONDS};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cost_tracker::{CostInput, CostTracker, UsageInput};
use crate::credentials::{CredentialError, CredentialStore, EnvCredentialStore};
use crate::feature_flags::FeatureFlagService;

/// Providers that run without an API key.
const KEYLESS_PROVIDERS: &[&str] = &["ollama", "mock"];

#[derive(Debug, thiserror::Error)]
pub enum AiServiceError {
    #[error("feature `{feature}` is disabled")]
    FeatureDisabled { feature: String },

    #[error("rate limit exceeded for `{key}`, resets at {reset_at}")]
    RateLimited {
        key: String,
        reset_at: DateTime<Utc>,
        retry_after: Duration,
    },

    #[error("provider `{provider}` is not available")]
    NoProviderAvailable { provider: String },

    #[error("no API key configured for provider `{provider}`")]
    MissingCredential { provider: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("provider `{provider}` failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("all providers failed after {attempts} attempt(s); last error from `{last_provider}`: {last_error}")]
    AllProvidersExhausted {
        attempts: u32,
        last_provider: String,
        last_error: ProviderError,
    },
}

impl From<RateLimitError> for AiServiceError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exceeded {
                key,
                reset_at,
                retry_after,
            } => Self::RateLimited {
                key,
                reset_at,
                retry_after,
            },
            RateLimitError::InvalidConfig(msg) => Self::Configuration(msg),
        }
    }
}

impl From<FallbackError> for AiServiceError {
    fn from(err: FallbackError) -> Self {
        match err {
            FallbackError::Configuration(msg) => Self::Configuration(msg),
            FallbackError::NonRetryable { provider, source } => Self::Provider { provider, source },
            FallbackError::AllProvidersExhausted {
                attempts,
                last_provider,
                last_error,
            } => Self::AllProvidersExhausted {
                attempts,
                last_provider,
                last_error,
            },
        }
    }
}

/// Per-call switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Feature name. Selects the flag, fallback strategy and cost bucket.
    pub feature: String,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    /// Overrides the strategy's primary provider.
    pub provider: Option<String>,
    pub use_fallback: bool,
    pub track_cost: bool,
    pub check_feature_flag: bool,
    /// Defaults to `"{org|user|anonymous}:{provider}"`.
    pub rate_limit_key: Option<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            feature: FallbackOrchestrator::DEFAULT_STRATEGY.to_string(),
            user_id: None,
            organization_id: None,
            provider: None,
            use_fallback: true,
            track_cost: true,
            check_feature_flag: false,
            rate_limit_key: None,
        }
    }
}

impl GenerateOptions {
    pub fn for_feature(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.use_fallback = false;
        self
    }

    pub fn without_cost_tracking(mut self) -> Self {
        self.track_cost = false;
        self
    }

    pub fn checking_feature_flag(mut self) -> Self {
        self.check_feature_flag = true;
        self
    }

    fn rate_limit_key_for(&self, provider: &str) -> String {
        if let Some(key) = &self.rate_limit_key {
            return key.clone();
        }
        let subject = self
            .organization_id
            .as_deref()
            .or(self.user_id.as_deref())
            .unwrap_or("anonymous");
        format!("{subject}:{provider}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AiServiceResponse {
    pub response: AiResponse,
    pub provider_used: String,
    pub fallback_used: bool,
    /// Estimated USD cost, when tracked.
    pub cost: Option<f64>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct AiServiceBuilder {
    registry: Arc<ProviderRegistry>,
    orchestrator: Arc<FallbackOrchestrator>,
    limiter: Arc<RateLimiter>,
    rate_limits: RateLimitRegistry,
    flags: Option<Arc<FeatureFlagService>>,
    cost_tracker: Option<Arc<CostTracker>>,
    credentials: Arc<dyn CredentialStore>,
    metrics: Arc<MetricsCollector>,
}

impl AiServiceBuilder {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            orchestrator: Arc::new(FallbackOrchestrator::new()),
            limiter: Arc::new(RateLimiter::new()),
            rate_limits: RateLimitRegistry::new(),
            flags: None,
            cost_tracker: None,
            credentials: Arc::new(EnvCredentialStore::default()),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    /// Fallback strategies, rate limits and env-based credentials from
    /// `config`.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.orchestrator = Arc::new(FallbackOrchestrator::from_sections(&config.fallback));
        self.rate_limits = RateLimitRegistry::from_sections(&config.rate_limits);
        self.credentials = Arc::new(EnvCredentialStore::new(config.providers.clone()));
        self
    }

    pub fn orchestrator(mut self, orchestrator: Arc<FallbackOrchestrator>) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn rate_limits(mut self, rate_limits: RateLimitRegistry) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn feature_flags(mut self, flags: Arc<FeatureFlagService>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn cost_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.cost_tracker = Some(tracker);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> AiService {
        AiService {
            registry: self.registry,
            orchestrator: self.orchestrator,
            limiter: self.limiter,
            rate_limits: self.rate_limits,
            flags: self.flags,
            cost_tracker: self.cost_tracker,
            credentials: self.credentials,
            metrics: self.metrics,
        }
    }
}

// ---------------------------------------------------------------------------
// AiService
// ---------------------------------------------------------------------------

pub struct AiService {
    registry: Arc<ProviderRegistry>,
    orchestrator: Arc<FallbackOrchestrator>,
    limiter: Arc<RateLimiter>,
    rate_limits: RateLimitRegistry,
    flags: Option<Arc<FeatureFlagService>>,
    cost_tracker: Option<Arc<CostTracker>>,
    credentials: Arc<dyn CredentialStore>,
    metrics: Arc<MetricsCollector>,
}

impl AiService {
    pub fn builder(registry: Arc<ProviderRegistry>) -> AiServiceBuilder {
        AiServiceBuilder::new(registry)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &FallbackOrchestrator {
        &self.orchestrator
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Names of registered providers that currently report themselves
    /// available.
    pub async fn available_providers(&self) -> Vec<String> {
        self.registry.available().await
    }

    /// Start the rate-limit state sweeper under `tasks`' shutdown signal.
    pub async fn start_sweeper(&self, tasks: &BackgroundTasks, config: &SweeperConfig) {
        let handle = spawn_sweeper(
            self.limiter.clone(),
            Duration::from_secs(config.interval_secs.max(1)),
            Duration::from_secs(config.stale_after_secs),
            tasks.signal(),
        );
        tasks.track("rate-limit-sweeper", handle).await;
    }

    pub async fn generate(
        &self,
        request: AiRequest,
        options: GenerateOptions,
    ) -> Result<AiServiceResponse, AiServiceError> {
        let feature = options.feature.as_str();

        // Feature check
        if options.check_feature_flag {
            let flags = self.flags.as_ref().ok_or_else(|| {
                AiServiceError::Configuration("feature flag service not configured".into())
            })?;
            let enabled = flags
                .is_feature_enabled(
                    feature,
                    options.user_id.as_deref(),
                    options.organization_id.as_deref(),
                )
                .await;
            if !enabled {
                debug!(feature, "request rejected by feature flag");
                self.count(feature, "-", "feature_disabled");
                return Err(AiServiceError::FeatureDisabled {
                    feature: feature.to_string(),
                });
            }
        }

        let mut strategy = self.orchestrator.get_fallback_strategy(feature);
        if let Some(provider) = &options.provider {
            override_primary(&mut strategy, provider);
        }
        let primary = strategy.primary.clone();

        // Rate limit
        let key = options.rate_limit_key_for(&primary);
        let config = self.rate_limits.config_for(&primary);
        if let Err(err) = self.limiter.enforce(&key, &config) {
            self.count(feature, &primary, "rate_limited");
            return Err(err.into());
        }

        // Provider and credential resolution
        if !self.registry.contains(&primary) {
            self.count(feature, &primary, "no_provider");
            return Err(AiServiceError::NoProviderAvailable { provider: primary });
        }
        let mut keys: HashMap<String, ApiKey> = HashMap::new();
        match self.resolve_key(options.organization_id.as_deref(), &primary).await? {
            Some(k) => {
                keys.insert(primary.clone(), k);
            }
            None if requires_key(&primary) => {
                self.count(feature, &primary, "missing_credential");
                return Err(AiServiceError::MissingCredential { provider: primary });
            }
            None => {}
        }
        if options.use_fallback {
            for name in &strategy.fallbacks {
                if let Some(k) = self.resolve_key(options.organization_id.as_deref(), name).await? {
                    keys.insert(name.clone(), k);
                }
            }
        }

        // Generate
        let started = Instant::now();
        let outcome = if options.use_fallback {
            self.orchestrator
                .execute_with_fallback(&strategy, &self.registry, |provider| {
                    let mut request = request.clone();
                    if let Some(k) = keys.get(provider.name()) {
                        request.api_key = Some(k.clone());
                    }
                    async move { provider.generate(&request).await }
                })
                .await
                .map(|o| (o.result, o.provider_used, o.fallback_used))
                .map_err(AiServiceError::from)
        } else {
            self.generate_direct(&primary, request.clone(), keys.remove(&primary))
                .await
                .map(|response| (response, primary.clone(), false))
        };
        let elapsed = started.elapsed();
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        let (response, provider_used, fallback_used) = match outcome {
            Ok(ok) => ok,
            Err(err) => {
                warn!(feature, provider = %primary, error = %err, "ai request failed");
                self.count(feature, &primary, "error");
                self.observe(feature, &primary, elapsed);
                self.record_failure(&request, &options, &primary, elapsed_ms, &err)
                    .await;
                return Err(err);
            }
        };

        self.count(feature, &provider_used, "success");
        self.observe(feature, &provider_used, elapsed);

        // Cost tracking
        let mut cost = None;
        if let (true, Some(usage), Some(tracker)) =
            (options.track_cost, response.usage, self.cost_tracker.as_ref())
        {
            let record = tracker
                .track_cost(CostInput {
                    provider: provider_used.clone(),
                    model: response.model.clone(),
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    feature: feature.to_string(),
                    user_id: options.user_id.clone(),
                    organization_id: options.organization_id.clone(),
                    response_time_ms: Some(elapsed_ms),
                })
                .await;
            cost = Some(record.estimated_cost);
        }

        info!(
            feature,
            provider = %provider_used,
            fallback_used,
            elapsed_ms,
            "ai request completed"
        );
        Ok(AiServiceResponse {
            response,
            provider_used,
            fallback_used,
            cost,
        })
    }

    async fn generate_direct(
        &self,
        provider_name: &str,
        mut request: AiRequest,
        key: Option<ApiKey>,
    ) -> Result<AiResponse, AiServiceError> {
        let provider = self
            .registry
            .get(provider_name)
            .ok_or_else(|| AiServiceError::NoProviderAvailable {
                provider: provider_name.to_string(),
            })?;
        if key.is_some() {
            request.api_key = key;
        }
        provider
            .generate(&request)
            .await
            .map_err(|source| AiServiceError::Provider {
                provider: provider_name.to_string(),
                source,
            })
    }

    async fn resolve_key(
        &self,
        organization_id: Option<&str>,
        provider: &str,
    ) -> Result<Option<ApiKey>, AiServiceError> {
        if !requires_key(provider) {
            return Ok(None);
        }
        Ok(self.credentials.get_api_key(organization_id, provider).await?)
    }

    async fn record_failure(
        &self,
        request: &AiRequest,
        options: &GenerateOptions,
        primary: &str,
        elapsed_ms: u64,
        err: &AiServiceError,
    ) {
        let Some(tracker) = self.cost_tracker.as_ref() else {
            return;
        };
        let (provider, error_code) = match err {
            AiServiceError::Provider { provider, source } => {
                (provider.as_str(), source.kind.code().to_string())
            }
            AiServiceError::AllProvidersExhausted {
                last_provider,
                last_error,
                ..
            } => (last_provider.as_str(), last_error.kind.code().to_string()),
            _ => (primary, "configuration".to_string()),
        };
        tracker
            .track_usage(UsageInput {
                feature: options.feature.clone(),
                provider: provider.to_string(),
                model: request.model.clone().unwrap_or_else(|| "unknown".into()),
                success: false,
                response_time_ms: Some(elapsed_ms),
                tokens_used: 0,
                cost: 0.0,
                error_code: Some(error_code),
                user_id: options.user_id.clone(),
                organization_id: options.organization_id.clone(),
            })
            .await;
    }

    fn count(&self, feature: &str, provider: &str, outcome: &str) {
        self.metrics.increment_counter(
            AI_REQUESTS_TOTAL,
            &[("feature", feature), ("provider", provider), ("outcome", outcome)],
        );
    }

    fn observe(&self, feature: &str, provider: &str, elapsed: Duration) {
        self.metrics.observe(
            AI_REQUEST_DURATION_SECONDS,
            &[("feature", feature), ("provider", provider)],
            elapsed.as_secs_f64(),
        );
    }
}

fn requires_key(provider: &str) -> bool {
    !KEYLESS_PROVIDERS.contains(&provider)
}

/// Make `provider` the primary, dropping it from the fallback list.
fn override_primary(strategy: &mut FallbackStrategy, provider: &str) {
    if strategy.primary == provider {
        return;
    }
    strategy.fallbacks.retain(|f| f != provider);
    strategy.primary = provider.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rate_limit_key_prefers_organization() {
        let opts = GenerateOptions::default();
        assert_eq!(opts.rate_limit_key_for("openai"), "anonymous:openai");

        let opts = GenerateOptions::default().with_user("u1");
        assert_eq!(opts.rate_limit_key_for("openai"), "u1:openai");

        let opts = opts.with_organization("acme");
        assert_eq!(opts.rate_limit_key_for("ollama"), "acme:ollama");

        let opts = opts.with_rate_limit_key("custom");
        assert_eq!(opts.rate_limit_key_for("ollama"), "custom");
    }

    #[test]
    fn overriding_primary_removes_it_from_fallbacks() {
        let mut strategy = FallbackStrategy::new("openai").with_fallbacks(["anthropic", "ollama"]);
        override_primary(&mut strategy, "ollama");
        assert_eq!(strategy.primary, "ollama");
        assert_eq!(strategy.fallbacks, vec!["anthropic".to_string()]);
    }

    #[test]
    fn local_providers_need_no_key() {
        assert!(!requires_key("ollama"));
        assert!(!requires_key("mock"));
        assert!(requires_key("openai"));
    }
}
