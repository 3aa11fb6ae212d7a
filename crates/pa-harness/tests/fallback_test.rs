use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pa_harness::fallback::{FallbackError, FallbackOrchestrator, FallbackStrategy};
use pa_harness::provider::{
    AiProvider, AiRequest, AiResponse, ProviderError, ProviderErrorKind, ProviderRegistry,
    TokenUsage,
};

/// Provider that fails with a fixed error, succeeds, or hangs.
enum Behaviour {
    Succeed,
    Fail(ProviderError),
    Hang,
}

struct Scripted {
    name: String,
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(name: &str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AiProvider for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &AiRequest) -> Result<AiResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Succeed => Ok(AiResponse {
                content: format!("{} says: {}", self.name, request.prompt),
                model: "m".into(),
                provider: self.name.clone(),
                usage: Some(TokenUsage::new(10, 5)),
                finish_reason: Some("stop".into()),
            }),
            Behaviour::Fail(err) => Err(err.clone()),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::other("unreachable"))
            }
        }
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn available_models(&self) -> Vec<String> {
        vec!["m".into()]
    }
}

fn registry(providers: &[Arc<Scripted>]) -> ProviderRegistry {
    let registry = ProviderRegistry::new();
    for p in providers {
        registry.register(p.clone());
    }
    registry
}

async fn run(
    orch: &FallbackOrchestrator,
    strategy: &FallbackStrategy,
    registry: &ProviderRegistry,
) -> Result<pa_harness::fallback::FallbackOutcome<AiResponse>, FallbackError> {
    let request = AiRequest::new("hello");
    orch.execute_with_fallback(strategy, registry, |provider| {
        let request = request.clone();
        async move { provider.generate(&request).await }
    })
    .await
}

#[tokio::test]
async fn primary_success_skips_fallbacks() {
    let a = Scripted::new("a", Behaviour::Succeed);
    let b = Scripted::new("b", Behaviour::Succeed);
    let reg = registry(&[a.clone(), b.clone()]);
    let strategy = FallbackStrategy::new("a").with_fallbacks(["b"]);

    let outcome = run(&FallbackOrchestrator::new(), &strategy, &reg).await.unwrap();
    assert_eq!(outcome.provider_used, "a");
    assert!(!outcome.fallback_used);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(b.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn etimedout_falls_back_to_next_provider() {
    let a = Scripted::new("a", Behaviour::Fail(ProviderError::other("connect ETIMEDOUT")));
    let b = Scripted::new("b", Behaviour::Succeed);
    let reg = registry(&[a, b]);
    let strategy = FallbackStrategy::new("a").with_fallbacks(["b"]);

    let outcome = run(&FallbackOrchestrator::new(), &strategy, &reg).await.unwrap();
    assert_eq!(outcome.provider_used, "b");
    assert!(outcome.fallback_used);
    assert_eq!(outcome.result.content, "b says: hello");
}

#[tokio::test]
async fn invalid_api_key_never_reaches_fallback() {
    let a = Scripted::new("a", Behaviour::Fail(ProviderError::other("invalid_api_key")));
    let b = Scripted::new("b", Behaviour::Succeed);
    let reg = registry(&[a, b.clone()]);
    let strategy = FallbackStrategy::new("a").with_fallbacks(["b"]);

    let err = run(&FallbackOrchestrator::new(), &strategy, &reg)
        .await
        .unwrap_err();
    match err {
        FallbackError::NonRetryable { provider, source } => {
            assert_eq!(provider, "a");
            assert!(source.message.contains("invalid_api_key"));
        }
        other => panic!("expected NonRetryable, got {other:?}"),
    }
    assert_eq!(b.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_primary_is_configuration_error_and_op_not_called() {
    let reg = ProviderRegistry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let strategy = FallbackStrategy::new("ghost").with_fallbacks(["also-ghost"]);

    let result = FallbackOrchestrator::new()
        .execute_with_fallback(&strategy, &reg, move |_p| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProviderError>(())
            }
        })
        .await;
    assert!(matches!(result, Err(FallbackError::Configuration(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unregistered_fallbacks_are_skipped() {
    let a = Scripted::new("a", Behaviour::Fail(ProviderError::other("server_error")));
    let c = Scripted::new("c", Behaviour::Succeed);
    let reg = registry(&[a, c]);
    let strategy = FallbackStrategy::new("a").with_fallbacks(["missing", "c"]);

    let outcome = run(&FallbackOrchestrator::new(), &strategy, &reg).await.unwrap();
    assert_eq!(outcome.provider_used, "c");
    assert_eq!(outcome.attempts, 2);
}

#[tokio::test]
async fn exhaustion_carries_last_error() {
    let a = Scripted::new("a", Behaviour::Fail(ProviderError::other("ECONNRESET")));
    let b = Scripted::new("b", Behaviour::Fail(ProviderError::other("temporary outage")));
    let reg = registry(&[a, b]);
    let strategy = FallbackStrategy::new("a").with_fallbacks(["b"]);

    match run(&FallbackOrchestrator::new(), &strategy, &reg).await {
        Err(FallbackError::AllProvidersExhausted {
            attempts,
            last_provider,
            last_error,
        }) => {
            assert_eq!(attempts, 2);
            assert_eq!(last_provider, "b");
            assert_eq!(last_error.message, "temporary outage");
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_errors_are_not_retried_unless_listed() {
    let a = Scripted::new("a", Behaviour::Fail(ProviderError::other("model overloaded")));
    let b = Scripted::new("b", Behaviour::Succeed);
    let reg = registry(&[a, b.clone()]);

    let plain = FallbackStrategy::new("a").with_fallbacks(["b"]);
    let err = run(&FallbackOrchestrator::new(), &plain, &reg)
        .await
        .unwrap_err();
    assert!(matches!(err, FallbackError::NonRetryable { .. }));
    assert_eq!(b.calls.load(Ordering::SeqCst), 0);

    let custom = plain.with_error_codes(["overloaded"]);
    let outcome = run(&FallbackOrchestrator::new(), &custom, &reg).await.unwrap();
    assert_eq!(outcome.provider_used, "b");
}

#[tokio::test]
async fn configured_code_falls_back_on_classified_client_error() {
    let not_found = ProviderError::new(
        ProviderErrorKind::InvalidRequest,
        "invalid_request: openai returned 404: model_not_found",
    );
    let a = Scripted::new("a", Behaviour::Fail(not_found));
    let b = Scripted::new("b", Behaviour::Succeed);
    let reg = registry(&[a, b.clone()]);

    let plain = FallbackStrategy::new("a").with_fallbacks(["b"]);
    let err = run(&FallbackOrchestrator::new(), &plain, &reg)
        .await
        .unwrap_err();
    assert!(matches!(err, FallbackError::NonRetryable { .. }));

    let custom = plain.with_error_codes(["model_not_found"]);
    let outcome = run(&FallbackOrchestrator::new(), &custom, &reg).await.unwrap();
    assert_eq!(outcome.provider_used, "b");
    assert!(outcome.fallback_used);
}

#[tokio::test]
async fn max_retries_bounds_fallback_attempts() {
    let err = || Behaviour::Fail(ProviderError::other("rate_limit"));
    let a = Scripted::new("a", err());
    let b = Scripted::new("b", err());
    let c = Scripted::new("c", err());
    let d = Scripted::new("d", Behaviour::Succeed);
    let reg = registry(&[a, b, c, d.clone()]);
    let strategy = FallbackStrategy::new("a")
        .with_fallbacks(["b", "c", "d"])
        .with_max_retries(2);

    let err = run(&FallbackOrchestrator::new(), &strategy, &reg)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FallbackError::AllProvidersExhausted { attempts: 3, .. }
    ));
    assert_eq!(d.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn hung_provider_times_out_and_is_cancelled() {
    let a = Scripted::new("a", Behaviour::Hang);
    let b = Scripted::new("b", Behaviour::Succeed);
    let reg = registry(&[a, b]);
    let strategy = FallbackStrategy::new("a")
        .with_fallbacks(["b"])
        .with_timeout(Duration::from_millis(250));

    // Records whether the hung attempt ever ran to completion.
    let finished: Arc<Mutex<HashMap<String, bool>>> = Arc::default();
    let seen = finished.clone();
    let outcome = FallbackOrchestrator::new()
        .execute_with_fallback(&strategy, &reg, move |provider| {
            let seen = seen.clone();
            async move {
                let name = provider.name().to_string();
                let result = provider.generate(&AiRequest::new("x")).await;
                seen.lock().unwrap().insert(name, true);
                result
            }
        })
        .await
        .unwrap();
    assert_eq!(outcome.provider_used, "b");
    assert!(outcome.fallback_used);

    tokio::time::sleep(Duration::from_secs(7200)).await;
    let finished = finished.lock().unwrap();
    assert!(!finished.contains_key("a"));
    assert_eq!(finished.get("b"), Some(&true));
}

#[tokio::test]
async fn execute_for_feature_resolves_strategy() {
    let primary = Scripted::new("ollama", Behaviour::Fail(ProviderError::timeout("timeout")));
    let mock = Scripted::new("mock", Behaviour::Succeed);
    let reg = registry(&[primary, mock]);
    let orch = FallbackOrchestrator::new();

    let request = AiRequest::new("ping");
    let outcome = orch
        .execute_for_feature("unconfigured-feature", &reg, |p| {
            let request = request.clone();
            async move { p.generate(&request).await }
        })
        .await
        .unwrap();
    assert_eq!(outcome.provider_used, "mock");
}
