//! Sticky A/B variant assignment.
//!
//! A user's first successful lookup for a running test binds them to a
//! variant by hashing their id into one of 100 buckets and walking the
//! cumulative traffic split. The binding is stored and returned unchanged on
//! every later lookup, even after the split is edited or the test is stopped.

use std::collections::BTreeMap;
use std::sync::Arc;

use pa_core::clock::{system_clock, SharedClock};
use pa_core::hashing::bucket_of;
use pa_core::store::{AbTestStore, StoreError};
use pa_core::types::{AbTest, AbTestAssignment};
use pa_telemetry::metrics::{MetricsCollector, AB_TEST_METRIC};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum AbTestError {
    #[error("test `{0}` has no variants")]
    NoVariants(String),
    #[error("invalid traffic split for test `{test_id}`: {reason}")]
    InvalidTrafficSplit { test_id: String, reason: String },
    #[error("test `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn validate(test: &AbTest) -> Result<(), AbTestError> {
    if test.variants.is_empty() {
        return Err(AbTestError::NoVariants(test.id.clone()));
    }
    let invalid = |reason: String| AbTestError::InvalidTrafficSplit {
        test_id: test.id.clone(),
        reason,
    };
    if test.traffic_split.len() != test.variants.len() {
        return Err(invalid(format!(
            "{} split entries for {} variants",
            test.traffic_split.len(),
            test.variants.len()
        )));
    }
    let total: u32 = test.traffic_split.iter().map(|&p| u32::from(p)).sum();
    if total != 100 {
        return Err(invalid(format!("split sums to {total}, expected 100")));
    }
    Ok(())
}

/// Variant index for `bucket` (0..100). First variant if the walk runs off
/// the end.
fn pick_variant(split: &[u8], bucket: u32) -> usize {
    let mut cumulative = 0u32;
    for (i, &share) in split.iter().enumerate() {
        cumulative += u32::from(share);
        if cumulative > bucket {
            return i;
        }
    }
    0
}

pub struct AbTestService {
    store: Arc<dyn AbTestStore>,
    metrics: Arc<MetricsCollector>,
    clock: SharedClock,
}

impl AbTestService {
    pub fn new(store: Arc<dyn AbTestStore>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            store,
            metrics,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn create_test(&self, test: AbTest) -> Result<(), AbTestError> {
        validate(&test)?;
        self.store.upsert_test(&test).await?;
        info!(test_id = %test.id, variants = test.variants.len(), "ab test created");
        Ok(())
    }

    pub async fn get_test(&self, test_id: &str) -> Result<Option<AbTest>, AbTestError> {
        Ok(self.store.get_test(test_id).await?)
    }

    /// Change the split for future assignments. Existing ones are kept.
    pub async fn update_traffic_split(
        &self,
        test_id: &str,
        split: Vec<u8>,
    ) -> Result<(), AbTestError> {
        let mut test = self
            .store
            .get_test(test_id)
            .await?
            .ok_or_else(|| AbTestError::NotFound(test_id.to_string()))?;
        test.traffic_split = split;
        validate(&test)?;
        self.store.upsert_test(&test).await?;
        info!(test_id, split = ?test.traffic_split, "ab test traffic split updated");
        Ok(())
    }

    pub async fn deactivate_test(&self, test_id: &str) -> Result<(), AbTestError> {
        let mut test = self
            .store
            .get_test(test_id)
            .await?
            .ok_or_else(|| AbTestError::NotFound(test_id.to_string()))?;
        test.active = false;
        self.store.upsert_test(&test).await?;
        info!(test_id, "ab test deactivated");
        Ok(())
    }

    /// The user's variant id, or `None` if the user has no assignment and the
    /// test is missing, inactive or outside its date window.
    pub async fn get_variant(
        &self,
        test_id: &str,
        user_id: &str,
        organization_id: Option<&str>,
    ) -> Result<Option<String>, AbTestError> {
        if let Some(existing) = self.store.get_assignment(user_id, test_id).await? {
            return Ok(Some(existing.variant_id));
        }

        let now = self.clock.now();
        let Some(test) = self.store.get_test(test_id).await? else {
            debug!(test_id, "ab test not found");
            return Ok(None);
        };
        if !test.is_running_at(now) || test.variants.is_empty() {
            return Ok(None);
        }

        let bucket = bucket_of(user_id);
        let index = pick_variant(&test.traffic_split, bucket).min(test.variants.len() - 1);
        let assignment = AbTestAssignment {
            user_id: user_id.to_string(),
            test_id: test_id.to_string(),
            variant_id: test.variants[index].id.clone(),
            organization_id: organization_id.map(String::from),
            assigned_at: now,
        };

        match self.store.insert_assignment(&assignment).await {
            Ok(()) => {
                info!(
                    test_id,
                    user_id,
                    variant = %assignment.variant_id,
                    bucket,
                    "ab test assignment created"
                );
                Ok(Some(assignment.variant_id))
            }
            // Lost a race with a concurrent lookup for the same user.
            Err(StoreError::Conflict(_)) => Ok(self
                .store
                .get_assignment(user_id, test_id)
                .await?
                .map(|a| a.variant_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Record an outcome for the user's variant. Nothing is persisted.
    pub async fn track_metric(
        &self,
        test_id: &str,
        user_id: &str,
        metric: &str,
        value: f64,
    ) -> Result<(), AbTestError> {
        let variant = self
            .store
            .get_assignment(user_id, test_id)
            .await?
            .map(|a| a.variant_id)
            .unwrap_or_else(|| "unassigned".to_string());
        info!(test_id, user_id, variant = %variant, metric, value, "ab test metric");
        self.metrics.increment_counter(
            AB_TEST_METRIC,
            &[("test", test_id), ("variant", variant.as_str()), ("metric", metric)],
        );
        Ok(())
    }

    /// Variant id → number of users assigned to it.
    pub async fn get_assignment_counts(
        &self,
        test_id: &str,
    ) -> Result<BTreeMap<String, u64>, AbTestError> {
        let mut counts = BTreeMap::new();
        for a in self.store.list_assignments(test_id).await? {
            *counts.entry(a.variant_id).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
