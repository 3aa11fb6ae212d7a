use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Admission-control algorithm used for a rate-limit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitStrategy {
    #[default]
    #[serde(alias = "fixed-window")]
    Fixed,
    #[serde(alias = "sliding-window")]
    Sliding,
    TokenBucket,
}

impl std::fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitStrategy::Fixed => write!(f, "fixed"),
            RateLimitStrategy::Sliding => write!(f, "sliding"),
            RateLimitStrategy::TokenBucket => write!(f, "token-bucket"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cost & usage records
// ---------------------------------------------------------------------------

/// One row per completed AI call. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostTrackingRecord {
    pub id: Uuid,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// USD, always >= 0.
    pub estimated_cost: f64,
    pub feature: String,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregable record of one call attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAnalyticsRecord {
    pub id: Uuid,
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
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Feature flags
// ---------------------------------------------------------------------------

/// A named boolean gate with optional targeting and percentage rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub target_users: Vec<String>,
    #[serde(default)]
    pub target_organizations: Vec<String>,
    /// 0..=100. `None` or 100 means everyone who passes targeting.
    #[serde(default)]
    pub rollout_percentage: Option<u8>,
    #[serde(default)]
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlag {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
            target_users: Vec::new(),
            target_organizations: Vec::new(),
            rollout_percentage: None,
            description: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_rollout(mut self, percentage: u8) -> Self {
        self.rollout_percentage = Some(percentage.min(100));
        self
    }

    pub fn with_target_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_users = users.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target_organizations<I, S>(mut self, orgs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_organizations = orgs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

// ---------------------------------------------------------------------------
// A/B tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbVariant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AbVariant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            config: serde_json::Value::Null,
        }
    }
}

/// An experiment. `traffic_split[i]` is the percentage of users routed to
/// `variants[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbTest {
    pub id: String,
    pub name: String,
    pub variants: Vec<AbVariant>,
    pub traffic_split: Vec<u8>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub active: bool,
    #[serde(default)]
    pub metrics: Vec<String>,
}

impl AbTest {
    /// Whether the test accepts new assignments at `now`.
    pub fn is_running_at(&self, now: DateTime<Utc>) -> bool {
        if !self.active || now < self.start_date {
            return false;
        }
        match self.end_date {
            Some(end) => now <= end,
            None => true,
        }
    }
}

/// Sticky `(user_id, test_id)` → variant binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbTestAssignment {
    pub user_id: String,
    pub test_id: String,
    pub variant_id: String,
    pub organization_id: Option<String>,
    pub assigned_at: DateTime<Utc>,
}
