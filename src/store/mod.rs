//! External collaborator interfaces.
//!
//! The pipeline reads and writes through these traits and never owns the
//! storage engine behind them. Implementations are responsible for their own
//! concurrent-write safety. [`memory`] provides thread-safe in-memory versions
//! used by the standalone binary and the test suites.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::monitoring::alerts::{Alert, AlertFilter, AlertRule};
use crate::monitoring::metrics::{AggregatePoint, MetricSample, MetricWindow, TimeWindow};
use crate::monitoring::notifications::ChannelRecord;
use crate::monitoring::performance::PerformanceAnalysis;
use crate::utils::error::Result;

pub mod memory;

pub use memory::{
    InMemoryAlertStore, InMemoryChannelStore, InMemoryLogStore, InMemoryMetricStore,
    InMemoryPerformanceStore, InMemoryRuleStore, InMemoryTransactionStore,
};

/// Log category used for HTTP request entries
pub const HTTP_CATEGORY: &str = "http";

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One application log entry as seen by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: String,
    /// Request duration in milliseconds for HTTP entries
    pub duration_ms: Option<f64>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub message: String,
}

/// Payment transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// One payment transaction as seen by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: TransactionStatus,
    pub amount: f64,
    pub user_id: Option<String>,
}

/// Append-only time-series storage
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn write(&self, sample: MetricSample) -> Result<()>;

    /// Persist a whole collector snapshot. Implementations that can should
    /// make this all-or-nothing.
    async fn write_batch(&self, samples: Vec<MetricSample>) -> Result<()> {
        for sample in samples {
            self.write(sample).await?;
        }
        Ok(())
    }

    /// Samples of `metric` inside `window`, ascending by timestamp
    async fn read_window(&self, metric: &str, window: TimeWindow) -> Result<MetricWindow>;

    /// Bucketed averages of `metric`; empty buckets are omitted
    async fn read_aggregate(
        &self,
        metric: &str,
        window: TimeWindow,
        bucket: Duration,
    ) -> Result<Vec<AggregatePoint>>;
}

/// Application log queries
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn count_by_level(&self, level: LogLevel, window: TimeWindow) -> Result<u64>;

    /// Average duration of entries in `category`, 0.0 when there are none
    async fn avg_duration_by_category(&self, category: &str, window: TimeWindow) -> Result<f64>;

    /// HTTP request entries in the window
    async fn count_requests(&self, window: TimeWindow) -> Result<u64>;

    async fn count_distinct_sessions(&self, window: TimeWindow) -> Result<u64>;

    async fn count_distinct_users(&self, window: TimeWindow) -> Result<u64>;
}

/// Payment transaction queries
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn count_by_status(&self, status: TransactionStatus, window: TimeWindow) -> Result<u64>;

    async fn count_total(&self, window: TimeWindow) -> Result<u64>;

    /// refunded × 100 / total, 0.0 when there are no transactions
    async fn refund_rate(&self, window: TimeWindow) -> Result<f64>;

    /// Sum of amounts, optionally restricted to one status
    async fn sum_amount(&self, status: Option<TransactionStatus>, window: TimeWindow) -> Result<f64>;
}

/// Alert persistence
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn create(&self, alert: Alert) -> Result<Uuid>;

    async fn get(&self, id: Uuid) -> Result<Option<Alert>>;

    /// Mark resolved. Fails with `AlreadyResolved` on a second attempt and
    /// leaves the first resolution untouched.
    async fn resolve(&self, id: Uuid, resolved_by: &str, resolved_at: DateTime<Utc>) -> Result<Alert>;

    /// Newest first
    async fn query(&self, filter: &AlertFilter) -> Result<Vec<Alert>>;
}

/// Alert rule configuration
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list(&self) -> Result<Vec<AlertRule>>;

    async fn list_active(&self) -> Result<Vec<AlertRule>>;

    async fn get(&self, id: Uuid) -> Result<Option<AlertRule>>;

    async fn upsert(&self, rule: AlertRule) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// Notification channel configuration. Secrets are stored sealed; the
/// store never decrypts them.
#[async_trait]
pub trait ChannelConfigStore: Send + Sync {
    async fn list(&self) -> Result<Vec<ChannelRecord>>;

    async fn list_enabled(&self) -> Result<Vec<ChannelRecord>>;

    async fn get(&self, id: Uuid) -> Result<Option<ChannelRecord>>;

    async fn upsert(&self, record: ChannelRecord) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// Performance analysis history
#[async_trait]
pub trait PerformanceStore: Send + Sync {
    async fn save(&self, analysis: PerformanceAnalysis) -> Result<()>;

    /// Analyses inside the window, oldest first
    async fn range(&self, window: TimeWindow) -> Result<Vec<PerformanceAnalysis>>;
}
