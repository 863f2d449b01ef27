//! Task definitions — the data model for scheduled collection work.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of data a task collects. Selects the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionType {
    StockPrice,
    StockInfo,
    TradingTrend,
    QuarterlyRevenue,
    MarketIndex,
    News,
    Disclosure,
}

impl CollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionType::StockPrice => "stock_price",
            CollectionType::StockInfo => "stock_info",
            CollectionType::TradingTrend => "trading_trend",
            CollectionType::QuarterlyRevenue => "quarterly_revenue",
            CollectionType::MarketIndex => "market_index",
            CollectionType::News => "news",
            CollectionType::Disclosure => "disclosure",
        }
    }
}

impl std::str::FromStr for CollectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stock_price" => Ok(CollectionType::StockPrice),
            "stock_info" => Ok(CollectionType::StockInfo),
            "trading_trend" => Ok(CollectionType::TradingTrend),
            "quarterly_revenue" => Ok(CollectionType::QuarterlyRevenue),
            "market_index" => Ok(CollectionType::MarketIndex),
            "news" => Ok(CollectionType::News),
            "disclosure" => Ok(CollectionType::Disclosure),
            other => Err(format!("unknown collection type: {other}")),
        }
    }
}

impl std::fmt::Display for CollectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle status.
///
/// PENDING is re-enterable: a failed attempt with retry budget left puts the
/// task back to PENDING with a bumped `scheduled_at`. COMPLETED and
/// CANCELLED are terminal; FAILED is terminal once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled collection task.
///
/// Only the execution engine mutates `status`, `started_at`, `completed_at`,
/// `error_message` and `retry_count`; callers create tasks via [`TaskSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionTask {
    pub id: Uuid,
    pub collection_type: CollectionType,
    /// Opaque parameters interpreted only by the selected collector.
    pub parameters: serde_json::Value,
    pub status: TaskStatus,
    /// Eligible for execution once `now >= scheduled_at` and status is PENDING.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure detail; cleared on successful completion.
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub is_recurring: bool,
    pub interval_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Specification for a new task. Everything the creator controls; the
/// engine-owned fields start at their initial values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub collection_type: CollectionType,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// When the task becomes due. `None` means due immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub is_recurring: bool,
    pub interval_minutes: Option<i64>,
}

fn default_max_retries() -> u32 { 3 }

impl TaskSpec {
    /// A one-shot task due immediately.
    pub fn immediate(collection_type: CollectionType, parameters: serde_json::Value) -> Self {
        Self {
            collection_type,
            parameters,
            scheduled_at: None,
            max_retries: default_max_retries(),
            is_recurring: false,
            interval_minutes: None,
        }
    }

    /// A recurring task, first due immediately, then every `interval_minutes`.
    pub fn recurring(
        collection_type: CollectionType,
        parameters: serde_json::Value,
        interval_minutes: i64,
    ) -> Self {
        Self {
            collection_type,
            parameters,
            scheduled_at: None,
            max_retries: default_max_retries(),
            is_recurring: true,
            interval_minutes: Some(interval_minutes),
        }
    }
}

impl CollectionTask {
    /// Materialize a spec into a fresh PENDING task.
    pub fn from_spec(spec: &TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            collection_type: spec.collection_type,
            parameters: spec.parameters.clone(),
            status: TaskStatus::Pending,
            scheduled_at: spec.scheduled_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            max_retries: spec.max_retries,
            is_recurring: spec.is_recurring,
            interval_minutes: spec.interval_minutes,
            created_at: now,
        }
    }

    /// The spec of this task's next recurrence, or `None` if not recurring.
    ///
    /// The successor is a distinct task identity; the completed record is
    /// kept for history.
    pub fn next_occurrence(&self, completed_at: DateTime<Utc>) -> Option<TaskSpec> {
        if !self.is_recurring {
            return None;
        }
        let interval = self.interval_minutes?;
        Some(TaskSpec {
            collection_type: self.collection_type,
            parameters: self.parameters.clone(),
            scheduled_at: Some(completed_at + Duration::minutes(interval)),
            max_retries: self.max_retries,
            is_recurring: true,
            interval_minutes: Some(interval),
        })
    }
}

/// Immutable record of one successful execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionResult {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Number of items fetched; observability only.
    pub data_count: u64,
    /// Where the collector persisted the payload, if anywhere.
    pub storage_location: Option<String>,
    /// Collector-provided run description (source, date range, filters).
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl CollectionResult {
    pub fn new(
        task_id: Uuid,
        data_count: u64,
        storage_location: Option<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            data_count,
            storage_location,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Exponential retry backoff: `base * 2^retry_count`, capped.
pub fn retry_backoff(base_secs: u64, cap_secs: u64, retry_count: u32) -> Duration {
    let secs = base_secs
        .saturating_mul(1u64.checked_shl(retry_count).unwrap_or(u64::MAX))
        .min(cap_secs);
    Duration::seconds(secs as i64)
}
