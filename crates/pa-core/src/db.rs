use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::store::{AbTestStore, CostStore, FlagStore, RecordFilter, StoreError, UsageStore};
use crate::types::{
    AbTest, AbTestAssignment, CostTrackingRecord, FeatureFlag, UsageAnalyticsRecord,
};

/// Async SQLite-backed store for cost, usage, flag, and experiment records.
pub struct SqliteStore {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers – values <-> SQLite
// ---------------------------------------------------------------------------

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Sqlite(format!("bad timestamp `{raw}`: {e}")))
}

fn uuid_from_sql(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Sqlite(format!("bad uuid `{raw}`: {e}")))
}

/// Filter parameters in the order expected by [`FILTER_CLAUSE`].
fn filter_params(filter: &RecordFilter) -> (Option<String>, Option<String>, Option<String>) {
    (
        filter.organization_id.clone(),
        filter.start.as_ref().map(ts_to_sql),
        filter.end.as_ref().map(ts_to_sql),
    )
}

const FILTER_CLAUSE: &str = "WHERE (?1 IS NULL OR organization_id = ?1)
       AND (?2 IS NULL OR timestamp >= ?2)
       AND (?3 IS NULL OR timestamp <= ?3)
     ORDER BY timestamp";

impl SqliteStore {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Open the database named by `[storage] path`, creating its parent
    /// directory if needed.
    pub async fn open_from_config(storage: &StorageConfig) -> Result<Self, StoreError> {
        let path = storage.resolved_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }
        debug!(path = %path.display(), "opening sqlite store");
        Self::open(&path).await
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS cost_records (
                        id                TEXT PRIMARY KEY,
                        provider          TEXT NOT NULL,
                        model             TEXT NOT NULL,
                        prompt_tokens     INTEGER NOT NULL,
                        completion_tokens INTEGER NOT NULL,
                        total_tokens      INTEGER NOT NULL,
                        estimated_cost    REAL NOT NULL,
                        feature           TEXT NOT NULL,
                        user_id           TEXT,
                        organization_id   TEXT,
                        timestamp         TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_cost_org_ts
                        ON cost_records(organization_id, timestamp);

                    CREATE TABLE IF NOT EXISTS usage_records (
                        id               TEXT PRIMARY KEY,
                        feature          TEXT NOT NULL,
                        provider         TEXT NOT NULL,
                        model            TEXT NOT NULL,
                        success          INTEGER NOT NULL,
                        response_time_ms INTEGER,
                        tokens_used      INTEGER NOT NULL,
                        cost             REAL NOT NULL,
                        error_code       TEXT,
                        user_id          TEXT,
                        organization_id  TEXT,
                        timestamp        TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_usage_org_ts
                        ON usage_records(organization_id, timestamp);

                    CREATE TABLE IF NOT EXISTS feature_flags (
                        name                 TEXT PRIMARY KEY,
                        enabled              INTEGER NOT NULL,
                        target_users         TEXT NOT NULL,
                        target_organizations TEXT NOT NULL,
                        rollout_percentage   INTEGER,
                        description          TEXT,
                        updated_at           TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS ab_tests (
                        id            TEXT PRIMARY KEY,
                        name          TEXT NOT NULL,
                        variants      TEXT NOT NULL,
                        traffic_split TEXT NOT NULL,
                        start_date    TEXT NOT NULL,
                        end_date      TEXT,
                        active        INTEGER NOT NULL,
                        metrics       TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS ab_assignments (
                        user_id         TEXT NOT NULL,
                        test_id         TEXT NOT NULL,
                        variant_id      TEXT NOT NULL,
                        organization_id TEXT,
                        assigned_at     TEXT NOT NULL,
                        PRIMARY KEY (user_id, test_id)
                    );

                    CREATE INDEX IF NOT EXISTS idx_assignments_test
                        ON ab_assignments(test_id);
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cost records
// ---------------------------------------------------------------------------

type RawCost = (
    String,
    String,
    String,
    i64,
    i64,
    i64,
    f64,
    String,
    Option<String>,
    Option<String>,
    String,
);

fn cost_from_raw(raw: RawCost) -> Result<CostTrackingRecord, StoreError> {
    let (id, provider, model, prompt, completion, total, cost, feature, user, org, ts) = raw;
    Ok(CostTrackingRecord {
        id: uuid_from_sql(&id)?,
        provider,
        model,
        prompt_tokens: prompt.max(0) as u64,
        completion_tokens: completion.max(0) as u64,
        total_tokens: total.max(0) as u64,
        estimated_cost: cost,
        feature,
        user_id: user,
        organization_id: org,
        timestamp: ts_from_sql(&ts)?,
    })
}

#[async_trait]
impl CostStore for SqliteStore {
    async fn insert_cost(&self, record: &CostTrackingRecord) -> Result<(), StoreError> {
        let r = record.clone();
        let ts = ts_to_sql(&r.timestamp);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cost_records (id, provider, model, prompt_tokens,
                        completion_tokens, total_tokens, estimated_cost, feature, user_id,
                        organization_id, timestamp)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    rusqlite::params![
                        r.id.to_string(),
                        r.provider,
                        r.model,
                        r.prompt_tokens as i64,
                        r.completion_tokens as i64,
                        r.total_tokens as i64,
                        r.estimated_cost,
                        r.feature,
                        r.user_id,
                        r.organization_id,
                        ts,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn query_costs(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<CostTrackingRecord>, StoreError> {
        let (org, start, end) = filter_params(filter);
        let rows: Vec<RawCost> = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT id, provider, model, prompt_tokens, completion_tokens, total_tokens,
                            estimated_cost, feature, user_id, organization_id, timestamp
                     FROM cost_records {FILTER_CLAUSE}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![org, start, end], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                            row.get(10)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(cost_from_raw).collect()
    }
}

// ---------------------------------------------------------------------------
// Usage records
// ---------------------------------------------------------------------------

type RawUsage = (
    String,
    String,
    String,
    String,
    bool,
    Option<i64>,
    i64,
    f64,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

fn usage_from_raw(raw: RawUsage) -> Result<UsageAnalyticsRecord, StoreError> {
    let (id, feature, provider, model, success, rt, tokens, cost, code, user, org, ts) = raw;
    Ok(UsageAnalyticsRecord {
        id: uuid_from_sql(&id)?,
        feature,
        provider,
        model,
        success,
        response_time_ms: rt.map(|v| v.max(0) as u64),
        tokens_used: tokens.max(0) as u64,
        cost,
        error_code: code,
        user_id: user,
        organization_id: org,
        timestamp: ts_from_sql(&ts)?,
    })
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn insert_usage(&self, record: &UsageAnalyticsRecord) -> Result<(), StoreError> {
        let r = record.clone();
        let ts = ts_to_sql(&r.timestamp);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO usage_records (id, feature, provider, model, success,
                        response_time_ms, tokens_used, cost, error_code, user_id,
                        organization_id, timestamp)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                    rusqlite::params![
                        r.id.to_string(),
                        r.feature,
                        r.provider,
                        r.model,
                        r.success,
                        r.response_time_ms.map(|v| v as i64),
                        r.tokens_used as i64,
                        r.cost,
                        r.error_code,
                        r.user_id,
                        r.organization_id,
                        ts,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn query_usage(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<UsageAnalyticsRecord>, StoreError> {
        let (org, start, end) = filter_params(filter);
        let rows: Vec<RawUsage> = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT id, feature, provider, model, success, response_time_ms, tokens_used,
                            cost, error_code, user_id, organization_id, timestamp
                     FROM usage_records {FILTER_CLAUSE}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![org, start, end], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                            row.get(10)?,
                            row.get(11)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(usage_from_raw).collect()
    }
}

// ---------------------------------------------------------------------------
// Feature flags
// ---------------------------------------------------------------------------

type RawFlag = (String, bool, String, String, Option<i64>, Option<String>, String);

fn flag_from_raw(raw: RawFlag) -> Result<FeatureFlag, StoreError> {
    let (name, enabled, users, orgs, rollout, description, updated_at) = raw;
    Ok(FeatureFlag {
        name,
        enabled,
        target_users: serde_json::from_str(&users)?,
        target_organizations: serde_json::from_str(&orgs)?,
        rollout_percentage: rollout.map(|v| v.clamp(0, 100) as u8),
        description,
        updated_at: ts_from_sql(&updated_at)?,
    })
}

#[async_trait]
impl FlagStore for SqliteStore {
    async fn list_flags(&self) -> Result<Vec<FeatureFlag>, StoreError> {
        let rows: Vec<RawFlag> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, enabled, target_users, target_organizations,
                            rollout_percentage, description, updated_at
                     FROM feature_flags ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(flag_from_raw).collect()
    }

    async fn upsert_flag(&self, flag: &FeatureFlag) -> Result<(), StoreError> {
        let name = flag.name.clone();
        let enabled = flag.enabled;
        let users = serde_json::to_string(&flag.target_users)?;
        let orgs = serde_json::to_string(&flag.target_organizations)?;
        let rollout = flag.rollout_percentage.map(i64::from);
        let description = flag.description.clone();
        let updated_at = ts_to_sql(&flag.updated_at);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO feature_flags (name, enabled, target_users,
                        target_organizations, rollout_percentage, description, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)
                     ON CONFLICT(name) DO UPDATE SET
                        enabled=excluded.enabled, target_users=excluded.target_users,
                        target_organizations=excluded.target_organizations,
                        rollout_percentage=excluded.rollout_percentage,
                        description=excluded.description, updated_at=excluded.updated_at",
                    rusqlite::params![name, enabled, users, orgs, rollout, description, updated_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn delete_flag(&self, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM feature_flags WHERE name = ?1", [name])?;
                Ok(n)
            })
            .await?;
        Ok(removed > 0)
    }
}

// ---------------------------------------------------------------------------
// A/B tests & assignments
// ---------------------------------------------------------------------------

type RawTest = (String, String, String, String, String, Option<String>, bool, String);

fn test_from_raw(raw: RawTest) -> Result<AbTest, StoreError> {
    let (id, name, variants, split, start, end, active, metrics) = raw;
    Ok(AbTest {
        id,
        name,
        variants: serde_json::from_str(&variants)?,
        traffic_split: serde_json::from_str(&split)?,
        start_date: ts_from_sql(&start)?,
        end_date: end.as_deref().map(ts_from_sql).transpose()?,
        active,
        metrics: serde_json::from_str(&metrics)?,
    })
}

type RawAssignment = (String, String, String, Option<String>, String);

fn assignment_from_raw(raw: RawAssignment) -> Result<AbTestAssignment, StoreError> {
    let (user_id, test_id, variant_id, organization_id, assigned_at) = raw;
    Ok(AbTestAssignment {
        user_id,
        test_id,
        variant_id,
        organization_id,
        assigned_at: ts_from_sql(&assigned_at)?,
    })
}

#[async_trait]
impl AbTestStore for SqliteStore {
    async fn get_test(&self, id: &str) -> Result<Option<AbTest>, StoreError> {
        let id = id.to_string();
        let row: Option<RawTest> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, variants, traffic_split, start_date, end_date, active,
                            metrics
                     FROM ab_tests WHERE id = ?1",
                )?;
                let mut rows = stmt.query_map([id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                })?;
                let first = rows.next().transpose()?;
                Ok(first)
            })
            .await?;
        row.map(test_from_raw).transpose()
    }

    async fn upsert_test(&self, test: &AbTest) -> Result<(), StoreError> {
        let id = test.id.clone();
        let name = test.name.clone();
        let variants = serde_json::to_string(&test.variants)?;
        let split = serde_json::to_string(&test.traffic_split)?;
        let start = ts_to_sql(&test.start_date);
        let end = test.end_date.as_ref().map(ts_to_sql);
        let active = test.active;
        let metrics = serde_json::to_string(&test.metrics)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO ab_tests (id, name, variants, traffic_split, start_date,
                        end_date, active, metrics)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, variants=excluded.variants,
                        traffic_split=excluded.traffic_split, start_date=excluded.start_date,
                        end_date=excluded.end_date, active=excluded.active,
                        metrics=excluded.metrics",
                    rusqlite::params![id, name, variants, split, start, end, active, metrics],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get_assignment(
        &self,
        user_id: &str,
        test_id: &str,
    ) -> Result<Option<AbTestAssignment>, StoreError> {
        let user_id = user_id.to_string();
        let test_id = test_id.to_string();
        let row: Option<RawAssignment> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, test_id, variant_id, organization_id, assigned_at
                     FROM ab_assignments WHERE user_id = ?1 AND test_id = ?2",
                )?;
                let mut rows = stmt.query_map([user_id, test_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?;
                let first = rows.next().transpose()?;
                Ok(first)
            })
            .await?;
        row.map(assignment_from_raw).transpose()
    }

    async fn insert_assignment(&self, assignment: &AbTestAssignment) -> Result<(), StoreError> {
        let a = assignment.clone();
        let assigned_at = ts_to_sql(&a.assigned_at);
        let (user_id, test_id) = (a.user_id.clone(), a.test_id.clone());
        let inserted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO ab_assignments
                        (user_id, test_id, variant_id, organization_id, assigned_at)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![
                        a.user_id,
                        a.test_id,
                        a.variant_id,
                        a.organization_id,
                        assigned_at
                    ],
                )?;
                Ok(n)
            })
            .await?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "assignment for user `{user_id}` in test `{test_id}` already exists"
            )));
        }
        Ok(())
    }

    async fn list_assignments(&self, test_id: &str) -> Result<Vec<AbTestAssignment>, StoreError> {
        let test_id = test_id.to_string();
        let rows: Vec<RawAssignment> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, test_id, variant_id, organization_id, assigned_at
                     FROM ab_assignments WHERE test_id = ?1 ORDER BY assigned_at",
                )?;
                let rows = stmt
                    .query_map([test_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(assignment_from_raw).collect()
    }
}
