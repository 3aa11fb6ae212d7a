use std::sync::Arc;
use std::time::Duration;

use pa_core::clock::ManualClock;
use pa_core::config::SweeperConfig;
use pa_core::store::{MemoryStore, RecordFilter, UsageStore};
use pa_core::types::FeatureFlag;
use pa_harness::fallback::{FallbackOrchestrator, FallbackStrategy};
use pa_harness::provider::{AiRequest, ProviderError, ProviderErrorKind, ProviderRegistry};
use pa_harness::rate_limiter::{RateLimitConfig, RateLimitRegistry, RateLimiter};
use pa_harness::shutdown::BackgroundTasks;
use pa_intelligence::cost_tracker::{CostTracker, PricingTable};
use pa_intelligence::credentials::{InMemoryCredentialStore, StoredCredential};
use pa_intelligence::feature_flags::FeatureFlagService;
use pa_intelligence::llm::MockProvider;
use pa_intelligence::{AiService, AiServiceBuilder, AiServiceError, GenerateOptions};
use pa_telemetry::metrics::{MetricsCollector, AI_REQUESTS_TOTAL, AI_REQUEST_DURATION_SECONDS};

struct Harness {
    store: Arc<MemoryStore>,
    registry: Arc<ProviderRegistry>,
    credentials: Arc<InMemoryCredentialStore>,
    flags: Arc<FeatureFlagService>,
    metrics: Arc<MetricsCollector>,
    orchestrator: Arc<FallbackOrchestrator>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            flags: Arc::new(
                FeatureFlagService::new(store.clone()).with_clock(Arc::new(ManualClock::default())),
            ),
            store,
            registry: Arc::new(ProviderRegistry::new()),
            credentials: Arc::new(InMemoryCredentialStore::new()),
            metrics: Arc::new(MetricsCollector::new()),
            orchestrator: Arc::new(FallbackOrchestrator::new()),
        }
    }

    fn builder(&self) -> AiServiceBuilder {
        AiService::builder(self.registry.clone())
            .orchestrator(self.orchestrator.clone())
            .feature_flags(self.flags.clone())
            .cost_tracker(Arc::new(CostTracker::new(
                self.store.clone(),
                PricingTable::default(),
            )))
            .credentials(self.credentials.clone())
            .metrics(self.metrics.clone())
    }

    fn service(&self) -> AiService {
        self.builder().build()
    }
}

#[tokio::test]
async fn direct_call_uses_resolved_credential_and_tracks_cost() {
    let h = Harness::new();
    let openai = MockProvider::named("openai").with_text("valued at 1.2M", 1_000, 500);
    h.registry.register(Arc::new(openai.clone()));
    h.credentials
        .insert(None, "openai", StoredCredential::new("sk-shared"))
        .await;

    let response = h
        .service()
        .generate(
            AiRequest::new("value this property").with_model("gpt-4"),
            GenerateOptions::for_feature("valuation")
                .with_organization("acme")
                .with_provider("openai")
                .without_fallback(),
        )
        .await
        .unwrap();

    assert_eq!(response.provider_used, "openai");
    assert!(!response.fallback_used);
    assert_eq!(response.response.content, "valued at 1.2M");
    // mock-model is unknown, so the openai default price applies.
    let expected = 1_000.0 / 1e6 * 10.0 + 500.0 / 1e6 * 30.0;
    assert!((response.cost.unwrap() - expected).abs() < 1e-12);

    let sent = openai.captured_requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].api_key.as_ref().map(|k| k.expose()), Some("sk-shared"));

    let summary = CostTracker::new(h.store.clone(), PricingTable::default())
        .get_cost_summary("acme", None, None)
        .await
        .unwrap();
    assert_eq!(summary.request_count, 1);
    assert_eq!(summary.by_feature["valuation"].tokens, 1_500);
}

#[tokio::test]
async fn disabled_feature_never_reaches_a_provider() {
    let h = Harness::new();
    let mock = MockProvider::new();
    h.registry.register(Arc::new(mock.clone()));
    h.flags
        .set_feature_flag(FeatureFlag::new("chat", false))
        .await
        .unwrap();

    let err = h
        .service()
        .generate(
            AiRequest::new("hi"),
            GenerateOptions::for_feature("chat").checking_feature_flag(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AiServiceError::FeatureDisabled { ref feature } if feature == "chat"));
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn rate_limit_rejects_before_generation() {
    let h = Harness::new();
    let mock = MockProvider::new();
    h.registry.register(Arc::new(mock.clone()));
    let mut limits = RateLimitRegistry::new();
    limits.set("mock", RateLimitConfig::fixed(1, 60_000));
    let service = h
        .builder()
        .rate_limiter(Arc::new(RateLimiter::with_clock(Arc::new(
            ManualClock::at_millis(0),
        ))))
        .rate_limits(limits)
        .build();

    let opts = GenerateOptions::default().with_user("u1").with_provider("mock");
    service
        .generate(AiRequest::new("one"), opts.clone())
        .await
        .unwrap();
    match service.generate(AiRequest::new("two"), opts.clone()).await {
        Err(AiServiceError::RateLimited { key, reset_at, .. }) => {
            assert_eq!(key, "u1:mock");
            assert_eq!(reset_at.timestamp_millis(), 60_000);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(mock.call_count(), 1);

    // Another user has its own allowance.
    service
        .generate(AiRequest::new("three"), opts.with_user("u2"))
        .await
        .unwrap();
}

#[tokio::test]
async fn missing_credential_aborts_for_paid_providers() {
    let h = Harness::new();
    let openai = MockProvider::named("openai");
    h.registry.register(Arc::new(openai.clone()));

    let err = h
        .service()
        .generate(
            AiRequest::new("hi"),
            GenerateOptions::default().with_provider("openai"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AiServiceError::MissingCredential { ref provider } if provider == "openai"));
    assert_eq!(openai.call_count(), 0);
}

#[tokio::test]
async fn unregistered_primary_is_reported() {
    let h = Harness::new();
    let err = h
        .service()
        .generate(AiRequest::new("hi"), GenerateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AiServiceError::NoProviderAvailable { ref provider } if provider == "ollama"));
}

#[tokio::test]
async fn retryable_primary_failure_uses_fallback() {
    let h = Harness::new();
    h.registry.register(Arc::new(
        MockProvider::named("ollama").with_error(ProviderError::other("connect ETIMEDOUT")),
    ));
    h.registry
        .register(Arc::new(MockProvider::new().with_text("fallback answer", 20, 10)));

    let response = h
        .service()
        .generate(AiRequest::new("hi"), GenerateOptions::for_feature("search"))
        .await
        .unwrap();
    assert_eq!(response.provider_used, "mock");
    assert!(response.fallback_used);
    assert_eq!(response.response.content, "fallback answer");
    assert_eq!(response.cost, Some(0.0));
    assert_eq!(
        h.metrics.counter(
            AI_REQUESTS_TOTAL,
            &[("feature", "search"), ("provider", "mock"), ("outcome", "success")]
        ),
        1
    );
    assert_eq!(
        h.metrics.histogram_count(
            AI_REQUEST_DURATION_SECONDS,
            &[("feature", "search"), ("provider", "mock")]
        ),
        1
    );
}

#[tokio::test]
async fn non_retryable_failure_is_recorded_as_usage() {
    let h = Harness::new();
    h.orchestrator.set_fallback_strategy(
        "reports",
        FallbackStrategy::new("openai").with_fallbacks(["mock"]),
    );
    h.registry.register(Arc::new(
        MockProvider::named("openai").with_error(ProviderError::unauthorized("invalid_api_key")),
    ));
    let fallback = MockProvider::new();
    h.registry.register(Arc::new(fallback.clone()));
    h.credentials
        .insert(Some("acme"), "openai", StoredCredential::new("sk-bad"))
        .await;

    let err = h
        .service()
        .generate(
            AiRequest::new("hi"),
            GenerateOptions::for_feature("reports").with_organization("acme"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AiServiceError::Provider { ref provider, .. } if provider == "openai"));
    assert_eq!(fallback.call_count(), 0);

    let usage = h.store.query_usage(&RecordFilter::default()).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert!(!usage[0].success);
    assert_eq!(usage[0].error_code.as_deref(), Some("unauthorized"));
    assert_eq!(usage[0].organization_id.as_deref(), Some("acme"));
}

#[tokio::test]
async fn exhausted_chain_blames_the_last_provider_tried() {
    let h = Harness::new();
    h.registry.register(Arc::new(
        MockProvider::named("ollama").with_error(ProviderError::other("connect ETIMEDOUT")),
    ));
    h.registry.register(Arc::new(MockProvider::new().with_error(ProviderError::new(
        ProviderErrorKind::Server,
        "server_error: mock returned 502",
    ))));

    let err = h
        .service()
        .generate(AiRequest::new("hi"), GenerateOptions::for_feature("search"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AiServiceError::AllProvidersExhausted { attempts: 2, ref last_provider, .. }
            if last_provider == "mock"
    ));

    let usage = h.store.query_usage(&RecordFilter::default()).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].provider, "mock");
    assert_eq!(usage[0].error_code.as_deref(), Some("server_error"));
}

#[tokio::test]
async fn direct_call_surfaces_provider_error_unmodified() {
    let h = Harness::new();
    let original = ProviderError::other("connect ETIMEDOUT");
    h.registry
        .register(Arc::new(MockProvider::named("ollama").with_error(original.clone())));
    h.registry.register(Arc::new(MockProvider::new()));

    let err = h
        .service()
        .generate(AiRequest::new("hi"), GenerateOptions::default().without_fallback())
        .await
        .unwrap_err();
    match err {
        AiServiceError::Provider { provider, source } => {
            assert_eq!(provider, "ollama");
            assert_eq!(source, original);
        }
        other => panic!("expected provider error, got {other:?}"),
    }
}

#[tokio::test]
async fn cost_tracking_can_be_skipped() {
    let h = Harness::new();
    h.registry.register(Arc::new(MockProvider::new()));
    let response = h
        .service()
        .generate(
            AiRequest::new("hi"),
            GenerateOptions::default()
                .with_provider("mock")
                .without_cost_tracking(),
        )
        .await
        .unwrap();
    assert_eq!(response.cost, None);
    assert!(h
        .store
        .query_usage(&RecordFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn available_providers_skips_unavailable_ones() {
    let h = Harness::new();
    h.registry.register(Arc::new(MockProvider::new()));
    h.registry
        .register(Arc::new(MockProvider::named("ollama").with_availability(false)));
    assert_eq!(h.service().available_providers().await, vec!["mock".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn sweeper_stops_on_shutdown() {
    let h = Harness::new();
    let service = h.service();
    let tasks = BackgroundTasks::new();
    service
        .start_sweeper(&tasks, &SweeperConfig::default())
        .await;
    assert_eq!(tasks.len().await, 1);

    tokio::time::sleep(Duration::from_secs(180)).await;
    let report = tasks.shutdown(Duration::from_secs(1)).await;
    assert!(report.is_clean());
    assert_eq!(report.finished, vec!["rate-limit-sweeper".to_string()]);
}
