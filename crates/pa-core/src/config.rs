use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::types::RateLimitStrategy;

/// Top-level configuration loaded from `~/.propai/config.toml`.
///
/// **Security**: API keys are never stored here. Provider sections hold the
/// *names* of environment variables; credentials are resolved at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Per-provider rate-limit overrides, keyed by provider name.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitSection>,
    #[serde(default)]
    pub pricing: Vec<PriceOverride>,
    /// Fallback strategies keyed by feature name.
    #[serde(default)]
    pub fallback: BTreeMap<String, FallbackSection>,
    #[serde(default)]
    pub feature_flags: FeatureFlagsConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

impl Config {
    /// Load config from `~/.propai/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (provider, limit) in &self.rate_limits {
            limit.validate(provider)?;
        }
        for (feature, strategy) in &self.fallback {
            strategy.validate(feature)?;
        }
        for price in &self.pricing {
            price.validate()?;
        }
        if self.feature_flags.cache_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "feature_flags.cache_ttl_secs must be > 0".into(),
            ));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "sweeper.interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".propai")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON logs instead of human-readable ones.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_service_name() -> String {
    "propai".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl StorageConfig {
    /// `path` with a leading `~` replaced by the home directory.
    pub fn resolved_path(&self) -> PathBuf {
        let home = || dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        if self.path == "~" {
            home()
        } else if let Some(rest) = self.path.strip_prefix("~/") {
            home().join(rest)
        } else {
            PathBuf::from(&self.path)
        }
    }
}

fn default_db_path() -> String {
    "~/.propai/ai.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_openai_key_env")]
    pub openai_key_env: String,
    #[serde(default = "default_anthropic_key_env")]
    pub anthropic_key_env: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_anthropic_base_url")]
    pub anthropic_base_url: String,
    /// Local Ollama server.
    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,
    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai_key_env: default_openai_key_env(),
            anthropic_key_env: default_anthropic_key_env(),
            openai_base_url: default_openai_base_url(),
            anthropic_base_url: default_anthropic_base_url(),
            ollama_base_url: default_ollama_base_url(),
            openai_model: default_openai_model(),
            anthropic_model: default_anthropic_model(),
            ollama_model: default_ollama_model(),
        }
    }
}

impl ProvidersConfig {
    /// Env-var name holding the API key for `provider`, if it needs one.
    pub fn key_env_for(&self, provider: &str) -> Option<&str> {
        match provider {
            "openai" => Some(&self.openai_key_env),
            "anthropic" => Some(&self.anthropic_key_env),
            _ => None,
        }
    }
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".into()
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_ollama_base_url() -> String {
    "http://127.0.0.1:11434".into()
}
fn default_openai_model() -> String {
    "gpt-4o-mini".into()
}
fn default_anthropic_model() -> String {
    "claude-3-5-sonnet".into()
}
fn default_ollama_model() -> String {
    "llama3".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSection {
    pub max_requests: u64,
    pub window_ms: u64,
    #[serde(default)]
    pub strategy: RateLimitStrategy,
}

impl RateLimitSection {
    fn validate(&self, provider: &str) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::Validation(format!(
                "rate_limits.{provider}.max_requests must be > 0"
            )));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::Validation(format!(
                "rate_limits.{provider}.window_ms must be > 0"
            )));
        }
        Ok(())
    }
}

/// Extra or overriding price-table entry (USD per 1M tokens).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceOverride {
    pub provider: String,
    /// Model id, or `"default"` for the provider-wide fallback price.
    pub model: String,
    pub input: f64,
    pub output: f64,
}

impl PriceOverride {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.input >= 0.0 && self.output >= 0.0) {
            return Err(ConfigError::Validation(format!(
                "pricing for {}/{} must be non-negative",
                self.provider, self.model
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackSection {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    /// Extra error substrings treated as retryable.
    #[serde(default)]
    pub error_codes: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl FallbackSection {
    fn validate(&self, feature: &str) -> Result<(), ConfigError> {
        if self.primary.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "fallback.{feature}.primary must not be empty"
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(format!(
                "fallback.{feature}.timeout_ms must be > 0"
            )));
        }
        Ok(())
    }
}

fn default_max_retries() -> u32 {
    2
}
fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlagsConfig {
    #[serde(default = "default_flag_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for FeatureFlagsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_flag_ttl(),
        }
    }
}

fn default_flag_ttl() -> u64 {
    300
}

/// Background sweep of idle rate-limit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}
fn default_stale_after() -> u64 {
    3600
}
