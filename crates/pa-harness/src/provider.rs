//! LLM provider abstraction for pa-harness.
//!
//! Defines the [`AiProvider`] trait every backend implements, the request and
//! response shapes passed through it, and the [`ProviderRegistry`] that maps
//! provider names to live instances.
//!
//! # Errors
//!
//! Provider failures are reported as a [`ProviderError`] carrying a
//! [`ProviderErrorKind`] and, when the adapter knows it, an explicit
//! `retryable` flag. The fallback orchestrator trusts that flag first and only
//! falls back to message heuristics when an adapter leaves it unset.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pa_harness::provider::{AiProvider, AiRequest, ProviderRegistry};
//!
//! async fn example(registry: &ProviderRegistry) {
//!     if let Some(provider) = registry.get("ollama") {
//!         let response = provider.generate(&AiRequest::new("Estimate cap rate")).await;
//!         println!("{:?}", response.map(|r| r.content));
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Broad category of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Bad or missing credentials (HTTP 401/403).
    Unauthorized,
    /// Provider-side throttling (HTTP 429).
    RateLimited,
    /// The call did not finish in time.
    Timeout,
    /// Connection refused/reset, DNS failure and similar transport errors.
    Network,
    /// Provider returned a 5xx.
    Server,
    /// The request itself was rejected (other 4xx, unknown model, ...).
    InvalidRequest,
    /// Anything the adapter could not classify.
    Other,
}

impl ProviderErrorKind {
    /// Retryability implied by the kind alone. `None` for [`Self::Other`].
    pub fn default_retryable(self) -> Option<bool> {
        match self {
            Self::Unauthorized | Self::InvalidRequest => Some(false),
            Self::RateLimited | Self::Timeout | Self::Network | Self::Server => Some(true),
            Self::Other => None,
        }
    }

    /// Short machine-readable code, used as the `error_code` in usage analytics.
    pub fn code(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limit",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Server => "server_error",
            Self::InvalidRequest => "invalid_request",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A failure reported by an [`AiProvider`].
///
/// # Examples
///
/// ```rust
/// use pa_harness::provider::{ProviderError, ProviderErrorKind};
///
/// let err = ProviderError::new(ProviderErrorKind::Server, "502 bad gateway");
/// assert_eq!(err.retryable, Some(true));
///
/// // Unclassified errors leave retryability to the orchestrator's heuristics.
/// let err = ProviderError::other("ECONNRESET");
/// assert_eq!(err.retryable, None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Explicit retry hint from the adapter. `None` means "unknown".
    pub retryable: Option<bool>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
        }
    }

    /// An unclassified error identified only by its message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Other, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unauthorized, message)
    }

    /// Override the retry hint.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Provider API key resolved for one call. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// A single generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Provider-specific model id. `None` lets the provider pick its default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Per-call credential. Overrides the key a provider was built with.
    #[serde(skip)]
    pub api_key: Option<ApiKey>,
}

impl AiRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
            max_tokens: None,
            temperature: None,
            api_key: None,
        }
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_api_key(mut self, key: ApiKey) -> Self {
        self.api_key = Some(key);
        self
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    /// Absent when the backend does not report token counts.
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// AiProvider trait
// ---------------------------------------------------------------------------

/// A pluggable LLM backend.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Registry name, e.g. `"openai"`.
    fn name(&self) -> &str;

    async fn generate(&self, request: &AiRequest) -> Result<AiResponse, ProviderError>;

    /// Cheap readiness probe (credentials present, local server reachable...).
    async fn is_available(&self) -> bool;

    fn available_models(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

/// Name → provider mapping shared by the orchestrator and the service wrapper.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn AiProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under its own name, replacing any previous entry.
    pub fn register(&self, provider: Arc<dyn AiProvider>) {
        let name = provider.name().to_string();
        self.providers.insert(name, provider);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.providers.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AiProvider>> {
        self.providers.get(name).map(|p| Arc::clone(p.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Names of providers whose readiness probe currently succeeds, sorted.
    pub async fn available(&self) -> Vec<String> {
        // Snapshot first so no map guard is held across an await.
        let snapshot: Vec<Arc<dyn AiProvider>> =
            self.providers.iter().map(|e| Arc::clone(e.value())).collect();
        let mut names = Vec::new();
        for provider in snapshot {
            if provider.is_available().await {
                names.push(provider.name().to_string());
            }
        }
        names.sort();
        names
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        up: bool,
    }

    #[async_trait]
    impl AiProvider for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate(&self, request: &AiRequest) -> Result<AiResponse, ProviderError> {
            Ok(AiResponse {
                content: request.prompt.clone(),
                model: "echo".into(),
                provider: self.name.into(),
                usage: Some(TokenUsage::new(1, 1)),
                finish_reason: None,
            })
        }

        async fn is_available(&self) -> bool {
            self.up
        }

        fn available_models(&self) -> Vec<String> {
            vec!["echo".into()]
        }
    }

    #[test]
    fn kind_defaults() {
        assert_eq!(ProviderError::unauthorized("x").retryable, Some(false));
        assert_eq!(ProviderError::timeout("x").retryable, Some(true));
        assert_eq!(ProviderError::other("x").retryable, None);
        assert_eq!(
            ProviderError::other("x").with_retryable(true).retryable,
            Some(true)
        );
    }

    #[test]
    fn error_displays_message() {
        let err = ProviderError::new(ProviderErrorKind::Server, "upstream 503");
        assert_eq!(err.to_string(), "upstream 503");
        assert_eq!(err.kind.code(), "server_error");
    }

    #[test]
    fn usage_totals() {
        let usage = TokenUsage::new(120, 30);
        assert_eq!(usage.total_tokens, 150);
    }

    #[tokio::test]
    async fn registry_register_and_lookup() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(Fixed { name: "b", up: true }));
        registry.register(Arc::new(Fixed { name: "a", up: false }));

        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.contains("a"));
        assert!(registry.get("missing").is_none());

        let provider = registry.get("b").unwrap();
        let resp = provider.generate(&AiRequest::new("hi")).await.unwrap();
        assert_eq!(resp.content, "hi");

        assert_eq!(registry.available().await, vec!["b"]);
        assert!(registry.unregister("a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn request_builder() {
        let req = AiRequest::new("p")
            .with_system_prompt("s")
            .with_model("m")
            .with_max_tokens(10)
            .with_temperature(0.2);
        assert_eq!(req.system_prompt.as_deref(), Some("s"));
        assert_eq!(req.model.as_deref(), Some("m"));
        assert_eq!(req.max_tokens, Some(10));
        let json = serde_json::to_value(&AiRequest::new("only")).unwrap();
        assert!(json.get("model").is_none());

        let keyed = AiRequest::new("p").with_api_key(ApiKey::new("sk-secret"));
        assert!(!format!("{keyed:?}").contains("sk-secret"));
        let json = serde_json::to_value(&keyed).unwrap();
        assert!(json.get("api_key").is_none());
    }
}
