use std::path::PathBuf;

use pa_core::config::{Config, FallbackSection, RateLimitSection, StorageConfig};
use pa_core::types::RateLimitStrategy;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.service_name, "propai");
    assert_eq!(cfg.general.log_level, "info");
    assert!(!cfg.general.json_logs);
    assert_eq!(cfg.feature_flags.cache_ttl_secs, 300);
    assert_eq!(cfg.sweeper.stale_after_secs, 3600);
    assert_eq!(cfg.providers.ollama_base_url, "http://127.0.0.1:11434");
    assert!(cfg.rate_limits.is_empty());
    assert!(cfg.fallback.is_empty());
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let mut cfg = Config::default();
    cfg.rate_limits.insert(
        "openai".into(),
        RateLimitSection {
            max_requests: 10,
            window_ms: 1_000,
            strategy: RateLimitStrategy::TokenBucket,
        },
    );
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("propai"));
    assert!(toml_str.contains("token-bucket"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.general.service_name, cfg.general.service_name);
    assert_eq!(parsed.rate_limits["openai"], cfg.rate_limits["openai"]);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[general]
log_level = "debug"

[rate_limits.anthropic]
max_requests = 5
window_ms = 60000
strategy = "sliding"

[fallback.valuation]
primary = "openai"
fallbacks = ["anthropic", "ollama"]
timeout_ms = 45000

[[pricing]]
provider = "openai"
model = "gpt-4.1"
input = 2.0
output = 8.0
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.general.log_level, "debug");
    assert_eq!(cfg.general.service_name, "propai");
    assert_eq!(cfg.rate_limits["anthropic"].strategy, RateLimitStrategy::Sliding);
    let fb = &cfg.fallback["valuation"];
    assert_eq!(fb.fallbacks, vec!["anthropic", "ollama"]);
    assert_eq!(fb.max_retries, 2);
    assert_eq!(fb.timeout_ms, 45_000);
    assert_eq!(cfg.pricing.len(), 1);
    cfg.validate().expect("config validates");
}

#[test]
fn zero_window_fails_validation() {
    let mut cfg = Config::default();
    cfg.rate_limits.insert(
        "openai".into(),
        RateLimitSection {
            max_requests: 10,
            window_ms: 0,
            strategy: RateLimitStrategy::Fixed,
        },
    );
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("window_ms"));
}

#[test]
fn zero_max_requests_fails_validation() {
    let mut cfg = Config::default();
    cfg.rate_limits.insert(
        "openai".into(),
        RateLimitSection {
            max_requests: 0,
            window_ms: 1000,
            strategy: RateLimitStrategy::Fixed,
        },
    );
    assert!(cfg.validate().is_err());
}

#[test]
fn empty_fallback_primary_fails_validation() {
    let mut cfg = Config::default();
    cfg.fallback.insert(
        "chat".into(),
        FallbackSection {
            primary: " ".into(),
            fallbacks: vec![],
            error_codes: vec![],
            max_retries: 1,
            timeout_ms: 1000,
        },
    );
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("primary"));
}

#[test]
fn zero_flag_ttl_fails_validation() {
    let mut cfg = Config::default();
    cfg.feature_flags.cache_ttl_secs = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[feature_flags]\ncache_ttl_secs = 60\n").unwrap();
    let cfg = Config::load_from(&path).expect("load");
    assert_eq!(cfg.feature_flags.cache_ttl_secs, 60);
}

#[test]
fn load_from_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load_from(dir.path().join("nope.toml")).unwrap_err();
    assert!(err.to_string().starts_with("io:"));
}

#[test]
fn key_env_lookup() {
    let cfg = Config::default();
    assert_eq!(cfg.providers.key_env_for("openai"), Some("OPENAI_API_KEY"));
    assert_eq!(cfg.providers.key_env_for("anthropic"), Some("ANTHROPIC_API_KEY"));
    assert_eq!(cfg.providers.key_env_for("ollama"), None);
}

#[test]
fn storage_path_expands_home() {
    let mut storage = StorageConfig::default();
    let resolved = storage.resolved_path();
    assert!(resolved.ends_with(".propai/ai.db"));
    assert!(!resolved.starts_with("~"));

    storage.path = "/var/lib/propai/ai.db".into();
    assert_eq!(storage.resolved_path(), PathBuf::from("/var/lib/propai/ai.db"));
}
