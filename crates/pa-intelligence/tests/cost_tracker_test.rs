use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use pa_core::clock::ManualClock;
use pa_core::db::SqliteStore;
use pa_core::store::MemoryStore;
use pa_intelligence::cost_tracker::{CostInput, CostTracker, PricingTable, UsageInput};

fn input(provider: &str, model: &str, feature: &str, org: &str) -> CostInput {
    CostInput {
        provider: provider.into(),
        model: model.into(),
        prompt_tokens: 1_000_000,
        completion_tokens: 0,
        feature: feature.into(),
        user_id: Some("u1".into()),
        organization_id: Some(org.into()),
        response_time_ms: Some(100),
    }
}

#[test]
fn reference_prices() {
    let table = PricingTable::default();
    assert_eq!(table.calculate_cost("openai", "gpt-4", 1_000_000, 0), 30.0);
    assert_eq!(table.calculate_cost("openai", "gpt-4", 0, 1_000_000), 60.0);
    assert_eq!(table.calculate_cost("nobody", "gpt-4", 1_000_000, 1_000_000), 0.0);
}

#[tokio::test]
async fn summary_groups_by_provider_and_feature() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::new());
    let tracker = CostTracker::new(store, PricingTable::default()).with_clock(clock.clone());

    tracker.track_cost(input("openai", "gpt-4", "valuation", "acme")).await;
    tracker.track_cost(input("openai", "gpt-4", "chat", "acme")).await;
    tracker
        .track_cost(input("anthropic", "claude-3-opus", "chat", "acme"))
        .await;
    tracker.track_cost(input("openai", "gpt-4", "chat", "globex")).await;

    let summary = tracker.get_cost_summary("acme", None, None).await.unwrap();
    assert_eq!(summary.request_count, 3);
    assert_eq!(summary.total_tokens, 3_000_000);
    assert!((summary.total_cost - 75.0).abs() < 1e-9);
    assert_eq!(summary.by_provider["openai"].requests, 2);
    assert!((summary.by_provider["anthropic"].cost - 15.0).abs() < 1e-9);
    assert_eq!(summary.by_feature["chat"].requests, 2);
    assert_eq!(summary.by_feature["valuation"].requests, 1);
}

#[tokio::test]
async fn summary_date_filter_is_inclusive() {
    let start = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let store = Arc::new(MemoryStore::new());
    let tracker = CostTracker::new(store, PricingTable::default()).with_clock(clock.clone());

    tracker.track_cost(input("openai", "gpt-4", "f", "acme")).await;
    clock.advance(Duration::days(1));
    tracker.track_cost(input("openai", "gpt-4", "f", "acme")).await;
    clock.advance(Duration::days(1));
    tracker.track_cost(input("openai", "gpt-4", "f", "acme")).await;

    let end = start + Duration::days(1);
    let summary = tracker
        .get_cost_summary("acme", Some(start), Some(end))
        .await
        .unwrap();
    assert_eq!(summary.request_count, 2);
}

#[tokio::test]
async fn usage_analytics_counts_failures_and_averages_times() {
    let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));
    let store = Arc::new(MemoryStore::new());
    let tracker = CostTracker::new(store, PricingTable::default()).with_clock(clock.clone());

    let mut first = input("openai", "gpt-4o", "chat", "acme");
    first.response_time_ms = Some(100);
    tracker.track_cost(first).await;
    clock.advance_ms(60_000);
    let mut second = input("openai", "gpt-4o", "chat", "acme");
    second.response_time_ms = Some(300);
    tracker.track_cost(second).await;
    clock.advance_ms(60_000);
    tracker
        .track_usage(UsageInput {
            feature: "chat".into(),
            provider: "openai".into(),
            model: "gpt-4o".into(),
            success: false,
            error_code: Some("timeout".into()),
            organization_id: Some("acme".into()),
            ..UsageInput::default()
        })
        .await;
    tracker
        .track_usage(UsageInput {
            feature: "search".into(),
            provider: "ollama".into(),
            model: "llama3".into(),
            success: true,
            organization_id: Some("acme".into()),
            ..UsageInput::default()
        })
        .await;

    let groups = tracker
        .get_usage_analytics(Some("acme"), None, None)
        .await
        .unwrap();
    assert_eq!(groups.len(), 2);
    let chat = &groups[0];
    assert_eq!(chat.feature, "chat");
    assert_eq!(chat.request_count, 3);
    assert_eq!(chat.success_count, 2);
    assert_eq!(chat.failure_count, 1);
    assert_eq!(chat.avg_response_time_ms, Some(200.0));
    assert_eq!(chat.total_tokens, 2_000_000);
    assert_eq!(
        (chat.period_end - chat.period_start).num_milliseconds(),
        120_000
    );
    assert_eq!(groups[1].avg_response_time_ms, None);
}

#[tokio::test]
async fn tracker_persists_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("costs.db")).await.unwrap());
    let tracker = CostTracker::new(store, PricingTable::default());

    let record = tracker
        .track_cost(input("anthropic", "claude-3-haiku", "summaries", "acme"))
        .await;
    assert!((record.estimated_cost - 0.25).abs() < 1e-9);

    let summary = tracker.get_cost_summary("acme", None, None).await.unwrap();
    assert_eq!(summary.request_count, 1);
    let usage = tracker.get_usage_analytics(None, None, None).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].success_count, 1);
}
