//! Per-call cost estimation, audit records and spend reporting.
//!
//! Prices are USD per one million tokens, looked up as provider → model with a
//! per-provider `"default"` entry for models missing from the table. Tracking
//! writes never fail the caller: persistence errors are logged and dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use pa_core::clock::{system_clock, SharedClock};
use pa_core::config::PriceOverride;
use pa_core::store::{CostStore, RecordFilter, StoreError, UsageStore};
use pa_core::types::{CostTrackingRecord, UsageAnalyticsRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

/// Longest window `get_daily_costs` will build, about ten years.
pub const MAX_DAILY_COST_DAYS: u32 = 3_660;

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// USD per 1M tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

impl ModelPrice {
    pub const FREE: ModelPrice = ModelPrice {
        input: 0.0,
        output: 0.0,
    };

    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let cost = (prompt_tokens as f64 / 1_000_000.0) * self.input
            + (completion_tokens as f64 / 1_000_000.0) * self.output;
        cost.max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    providers: HashMap<String, HashMap<String, ModelPrice>>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for (model, input, output) in [
            ("gpt-4", 30.0, 60.0),
            ("gpt-4-turbo", 10.0, 30.0),
            ("gpt-4o", 2.5, 10.0),
            ("gpt-4o-mini", 0.15, 0.6),
            ("gpt-3.5-turbo", 0.5, 1.5),
            ("default", 10.0, 30.0),
        ] {
            table.set("openai", model, ModelPrice::new(input, output));
        }
        for (model, input, output) in [
            ("claude-3-opus", 15.0, 75.0),
            ("claude-3-sonnet", 3.0, 15.0),
            ("claude-3-haiku", 0.25, 1.25),
            ("claude-3-5-sonnet", 3.0, 15.0),
            ("default", 3.0, 15.0),
        ] {
            table.set("anthropic", model, ModelPrice::new(input, output));
        }
        table.set("ollama", "default", ModelPrice::FREE);
        table.set("mock", "default", ModelPrice::FREE);
        table
    }
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Built-in prices with `[[pricing]]` entries applied on top.
    pub fn with_overrides(overrides: &[PriceOverride]) -> Self {
        let mut table = Self::default();
        for o in overrides {
            table.set(&o.provider, &o.model, ModelPrice::new(o.input, o.output));
        }
        table
    }

    pub fn set(&mut self, provider: &str, model: &str, price: ModelPrice) {
        self.providers
            .entry(provider.to_string())
            .or_default()
            .insert(model.to_string(), price);
    }

    /// Exact model price, else the provider's `"default"`. `None` for unknown
    /// providers.
    pub fn price(&self, provider: &str, model: &str) -> Option<ModelPrice> {
        let models = self.providers.get(provider)?;
        models
            .get(model)
            .or_else(|| models.get("default"))
            .copied()
    }

    pub fn calculate_cost(
        &self,
        provider: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> f64 {
        self.price(provider, model)
            .unwrap_or(ModelPrice::FREE)
            .cost(prompt_tokens, completion_tokens)
    }
}

// ---------------------------------------------------------------------------
// Inputs & reports
// ---------------------------------------------------------------------------

/// A completed call to record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CostInput {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub feature: String,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub response_time_ms: Option<u64>,
}

/// One call attempt, successful or not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageInput {
    pub feature: String,
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub response_time_ms: Option<u64>,
    pub tokens_used: u64,
    pub cost: f64,
    pub error_code: Option<String>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub cost: f64,
    pub tokens: u64,
    pub requests: u64,
}

impl CostBreakdown {
    fn add(&mut self, record: &CostTrackingRecord) {
        self.cost += record.estimated_cost;
        self.tokens += record.total_tokens;
        self.requests += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSummary {
    pub organization_id: String,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub request_count: u64,
    pub by_provider: BTreeMap<String, CostBreakdown>,
    pub by_feature: BTreeMap<String, CostBreakdown>,
}

/// Aggregate for one (feature, provider, model) group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageAnalytics {
    pub feature: String,
    pub provider: String,
    pub model: String,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Mean over records that carry a response time.
    pub avg_response_time_ms: Option<f64>,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DailyCost {
    pub date: NaiveDate,
    pub cost: f64,
    pub tokens: u64,
    pub requests: u64,
}

// ---------------------------------------------------------------------------
// CostTracker
// ---------------------------------------------------------------------------

pub struct CostTracker {
    costs: Arc<dyn CostStore>,
    usage: Arc<dyn UsageStore>,
    pricing: PricingTable,
    clock: SharedClock,
}

impl CostTracker {
    pub fn new<S>(store: Arc<S>, pricing: PricingTable) -> Self
    where
        S: CostStore + UsageStore + 'static,
    {
        Self {
            costs: store.clone(),
            usage: store,
            pricing,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn calculate_cost(
        &self,
        provider: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> f64 {
        self.pricing
            .calculate_cost(provider, model, prompt_tokens, completion_tokens)
    }

    /// Persist a cost record and a matching successful usage record.
    /// Returns the record even if persisting it failed.
    pub async fn track_cost(&self, input: CostInput) -> CostTrackingRecord {
        let estimated_cost = self.calculate_cost(
            &input.provider,
            &input.model,
            input.prompt_tokens,
            input.completion_tokens,
        );
        let record = CostTrackingRecord {
            id: Uuid::new_v4(),
            provider: input.provider,
            model: input.model,
            prompt_tokens: input.prompt_tokens,
            completion_tokens: input.completion_tokens,
            total_tokens: input.prompt_tokens + input.completion_tokens,
            estimated_cost,
            feature: input.feature,
            user_id: input.user_id,
            organization_id: input.organization_id,
            timestamp: self.clock.now(),
        };

        if let Err(e) = self.costs.insert_cost(&record).await {
            error!(error = %e, provider = %record.provider, "failed to persist cost record");
        } else {
            debug!(
                provider = %record.provider,
                model = %record.model,
                cost = record.estimated_cost,
                "cost tracked"
            );
        }

        self.track_usage(UsageInput {
            feature: record.feature.clone(),
            provider: record.provider.clone(),
            model: record.model.clone(),
            success: true,
            response_time_ms: input.response_time_ms,
            tokens_used: record.total_tokens,
            cost: record.estimated_cost,
            error_code: None,
            user_id: record.user_id.clone(),
            organization_id: record.organization_id.clone(),
        })
        .await;

        record
    }

    pub async fn track_usage(&self, input: UsageInput) {
        let record = UsageAnalyticsRecord {
            id: Uuid::new_v4(),
            feature: input.feature,
            provider: input.provider,
            model: input.model,
            success: input.success,
            response_time_ms: input.response_time_ms,
            tokens_used: input.tokens_used,
            cost: input.cost.max(0.0),
            error_code: input.error_code,
            user_id: input.user_id,
            organization_id: input.organization_id,
            timestamp: self.clock.now(),
        };
        if let Err(e) = self.usage.insert_usage(&record).await {
            error!(error = %e, feature = %record.feature, "failed to persist usage record");
        }
    }

    /// Totals for `organization_id`, optionally bounded (inclusive).
    pub async fn get_cost_summary(
        &self,
        organization_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<CostSummary, StoreError> {
        let filter = RecordFilter::for_organization(organization_id).between(start, end);
        let records = self.costs.query_costs(&filter).await?;

        let mut summary = CostSummary {
            organization_id: organization_id.to_string(),
            total_cost: 0.0,
            total_tokens: 0,
            request_count: 0,
            by_provider: BTreeMap::new(),
            by_feature: BTreeMap::new(),
        };
        for r in &records {
            summary.total_cost += r.estimated_cost;
            summary.total_tokens += r.total_tokens;
            summary.request_count += 1;
            summary
                .by_provider
                .entry(r.provider.clone())
                .or_default()
                .add(r);
            summary
                .by_feature
                .entry(r.feature.clone())
                .or_default()
                .add(r);
        }
        Ok(summary)
    }

    /// Usage grouped by (feature, provider, model), sorted by that key.
    pub async fn get_usage_analytics(
        &self,
        organization_id: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<UsageAnalytics>, StoreError> {
        let filter = RecordFilter {
            organization_id: organization_id.map(String::from),
            start,
            end,
        };
        let records = self.usage.query_usage(&filter).await?;

        struct Acc {
            out: UsageAnalytics,
            timed: u64,
            time_sum: u64,
        }

        let mut groups: BTreeMap<(String, String, String), Acc> = BTreeMap::new();
        for r in &records {
            let key = (r.feature.clone(), r.provider.clone(), r.model.clone());
            let acc = groups.entry(key).or_insert_with(|| Acc {
                out: UsageAnalytics {
                    feature: r.feature.clone(),
                    provider: r.provider.clone(),
                    model: r.model.clone(),
                    request_count: 0,
                    success_count: 0,
                    failure_count: 0,
                    avg_response_time_ms: None,
                    total_cost: 0.0,
                    total_tokens: 0,
                    period_start: r.timestamp,
                    period_end: r.timestamp,
                },
                timed: 0,
                time_sum: 0,
            });
            acc.out.request_count += 1;
            if r.success {
                acc.out.success_count += 1;
            } else {
                acc.out.failure_count += 1;
            }
            if let Some(ms) = r.response_time_ms {
                acc.timed += 1;
                acc.time_sum += ms;
            }
            acc.out.total_cost += r.cost;
            acc.out.total_tokens += r.tokens_used;
            acc.out.period_start = acc.out.period_start.min(r.timestamp);
            acc.out.period_end = acc.out.period_end.max(r.timestamp);
        }

        Ok(groups
            .into_values()
            .map(|mut acc| {
                if acc.timed > 0 {
                    acc.out.avg_response_time_ms = Some(acc.time_sum as f64 / acc.timed as f64);
                }
                acc.out
            })
            .collect())
    }

    /// One entry per calendar day (UTC) for the last `days` days, oldest
    /// first, including days with no spend. `days` is capped at
    /// [`MAX_DAILY_COST_DAYS`].
    pub async fn get_daily_costs(
        &self,
        organization_id: &str,
        days: u32,
    ) -> Result<Vec<DailyCost>, StoreError> {
        let days = days.min(MAX_DAILY_COST_DAYS);
        if days == 0 {
            return Ok(Vec::new());
        }
        let today = self.clock.now().date_naive();
        let Some(first) = today.checked_sub_days(Days::new(u64::from(days - 1))) else {
            return Ok(Vec::new());
        };
        let start = first.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        let filter = RecordFilter::for_organization(organization_id).between(start, None);
        let records = self.costs.query_costs(&filter).await?;

        let mut by_day: BTreeMap<NaiveDate, CostBreakdown> = first
            .iter_days()
            .take(days as usize)
            .map(|day| (day, CostBreakdown::default()))
            .collect();
        for r in &records {
            if let Some(day) = by_day.get_mut(&r.timestamp.date_naive()) {
                day.add(r);
            }
        }
        Ok(by_day
            .into_iter()
            .map(|(date, b)| DailyCost {
                date,
                cost: b.cost,
                tokens: b.tokens,
                requests: b.requests,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
