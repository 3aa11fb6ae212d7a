//! Persistence seams for AI-infrastructure records.
//!
//! Components only depend on the query shapes below: appends, filtered
//! scans by organization/date range, and unique-key lookups. [`MemoryStore`]
//! backs tests and single-process deployments; [`crate::db::SqliteStore`]
//! is the durable implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::types::{
    AbTest, AbTestAssignment, CostTrackingRecord, FeatureFlag, UsageAnalyticsRecord,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(String),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        StoreError::Sqlite(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Organization and inclusive date-range filter for record scans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub organization_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn for_organization(org: impl Into<String>) -> Self {
        Self {
            organization_id: Some(org.into()),
            ..Self::default()
        }
    }

    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn matches(&self, organization_id: Option<&str>, timestamp: DateTime<Utc>) -> bool {
        if let Some(ref org) = self.organization_id {
            if organization_id != Some(org.as_str()) {
                return false;
            }
        }
        if let Some(start) = self.start {
            if timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if timestamp > end {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CostStore: Send + Sync {
    async fn insert_cost(&self, record: &CostTrackingRecord) -> Result<(), StoreError>;
    async fn query_costs(&self, filter: &RecordFilter)
        -> Result<Vec<CostTrackingRecord>, StoreError>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn insert_usage(&self, record: &UsageAnalyticsRecord) -> Result<(), StoreError>;
    async fn query_usage(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<UsageAnalyticsRecord>, StoreError>;
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn list_flags(&self) -> Result<Vec<FeatureFlag>, StoreError>;
    async fn upsert_flag(&self, flag: &FeatureFlag) -> Result<(), StoreError>;
    /// Returns `true` if a flag was removed.
    async fn delete_flag(&self, name: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait AbTestStore: Send + Sync {
    async fn get_test(&self, id: &str) -> Result<Option<AbTest>, StoreError>;
    async fn upsert_test(&self, test: &AbTest) -> Result<(), StoreError>;
    async fn get_assignment(
        &self,
        user_id: &str,
        test_id: &str,
    ) -> Result<Option<AbTestAssignment>, StoreError>;
    /// Insert a new assignment. Fails with [`StoreError::Conflict`] if one
    /// already exists for `(user_id, test_id)`.
    async fn insert_assignment(&self, assignment: &AbTestAssignment) -> Result<(), StoreError>;
    async fn list_assignments(&self, test_id: &str) -> Result<Vec<AbTestAssignment>, StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process store implementing every persistence trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    costs: RwLock<Vec<CostTrackingRecord>>,
    usage: RwLock<Vec<UsageAnalyticsRecord>>,
    flags: RwLock<HashMap<String, FeatureFlag>>,
    tests: RwLock<HashMap<String, AbTest>>,
    assignments: RwLock<HashMap<(String, String), AbTestAssignment>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("writes disabled".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CostStore for MemoryStore {
    async fn insert_cost(&self, record: &CostTrackingRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.costs.write().await.push(record.clone());
        Ok(())
    }

    async fn query_costs(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<CostTrackingRecord>, StoreError> {
        Ok(self
            .costs
            .read()
            .await
            .iter()
            .filter(|r| filter.matches(r.organization_id.as_deref(), r.timestamp))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn insert_usage(&self, record: &UsageAnalyticsRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.usage.write().await.push(record.clone());
        Ok(())
    }

    async fn query_usage(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<UsageAnalyticsRecord>, StoreError> {
        Ok(self
            .usage
            .read()
            .await
            .iter()
            .filter(|r| filter.matches(r.organization_id.as_deref(), r.timestamp))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FlagStore for MemoryStore {
    async fn list_flags(&self) -> Result<Vec<FeatureFlag>, StoreError> {
        let mut flags: Vec<FeatureFlag> = self.flags.read().await.values().cloned().collect();
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flags)
    }

    async fn upsert_flag(&self, flag: &FeatureFlag) -> Result<(), StoreError> {
        self.check_writable()?;
        self.flags
            .write()
            .await
            .insert(flag.name.clone(), flag.clone());
        Ok(())
    }

    async fn delete_flag(&self, name: &str) -> Result<bool, StoreError> {
        self.check_writable()?;
        Ok(self.flags.write().await.remove(name).is_some())
    }
}

#[async_trait]
impl AbTestStore for MemoryStore {
    async fn get_test(&self, id: &str) -> Result<Option<AbTest>, StoreError> {
        Ok(self.tests.read().await.get(id).cloned())
    }

    async fn upsert_test(&self, test: &AbTest) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tests.write().await.insert(test.id.clone(), test.clone());
        Ok(())
    }

    async fn get_assignment(
        &self,
        user_id: &str,
        test_id: &str,
    ) -> Result<Option<AbTestAssignment>, StoreError> {
        let key = (user_id.to_string(), test_id.to_string());
        Ok(self.assignments.read().await.get(&key).cloned())
    }

    async fn insert_assignment(&self, assignment: &AbTestAssignment) -> Result<(), StoreError> {
        self.check_writable()?;
        let key = (assignment.user_id.clone(), assignment.test_id.clone());
        let mut map = self.assignments.write().await;
        if map.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "assignment for user `{}` in test `{}` already exists",
                assignment.user_id, assignment.test_id
            )));
        }
        map.insert(key, assignment.clone());
        Ok(())
    }

    async fn list_assignments(&self, test_id: &str) -> Result<Vec<AbTestAssignment>, StoreError> {
        Ok(self
            .assignments
            .read()
            .await
            .values()
            .filter(|a| a.test_id == test_id)
            .cloned()
            .collect())
    }
}
