// Metric data model for the monitoring pipeline
// Samples, windows and the system/business snapshots produced by each collector cycle

use crate::utils::error::{MonitorError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// Names under which collector snapshots are persisted
pub mod names {
    pub const CPU: &str = "system.cpu";
    pub const MEMORY: &str = "system.memory";
    pub const ACTIVE_CONNECTIONS: &str = "system.active_connections";
    pub const REQUEST_RATE: &str = "system.request_rate";
    pub const ERROR_RATE: &str = "system.error_rate";
    pub const RESPONSE_TIME: &str = "system.response_time";

    pub const ACTIVE_USERS: &str = "business.active_users";
    pub const TRANSACTIONS: &str = "business.transactions";
    pub const SUCCESSFUL_TRANSACTIONS: &str = "business.successful_transactions";
    pub const TRANSACTION_VALUE: &str = "business.transaction_value";
    pub const CONVERSION_RATE: &str = "business.conversion_rate";

    pub const SYSTEM: [&str; 6] = [
        CPU,
        MEMORY,
        ACTIVE_CONNECTIONS,
        REQUEST_RATE,
        ERROR_RATE,
        RESPONSE_TIME,
    ];

    pub const BUSINESS: [&str; 5] = [
        ACTIVE_USERS,
        TRANSACTIONS,
        SUCCESSFUL_TRANSACTIONS,
        TRANSACTION_VALUE,
        CONVERSION_RATE,
    ];
}

/// One observation of a named metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

impl MetricSample {
    /// Create a sample, rejecting NaN/Infinity and empty names
    pub fn new<S: Into<String>>(metric: S, value: f64, timestamp: DateTime<Utc>) -> Result<Self> {
        let metric = metric.into();
        if metric.trim().is_empty() {
            return Err(MonitorError::invalid_metric("metric name must not be empty"));
        }
        if !value.is_finite() {
            return Err(MonitorError::invalid_metric(format!(
                "{} has non-finite value {}",
                metric, value
            )));
        }
        Ok(Self {
            metric,
            value,
            timestamp,
            tags: HashMap::new(),
        })
    }

    pub fn with_tag<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A closed time interval `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window of `minutes` ending at `end`
    pub fn trailing_minutes(end: DateTime<Utc>, minutes: u32) -> Self {
        Self {
            start: end - Duration::minutes(i64::from(minutes)),
            end,
        }
    }

    /// Window of `hours` ending at `end`
    pub fn trailing_hours(end: DateTime<Utc>, hours: u32) -> Self {
        Self {
            start: end - Duration::hours(i64::from(hours)),
            end,
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn seconds(&self) -> f64 {
        self.duration().num_milliseconds() as f64 / 1000.0
    }
}

/// Samples of one metric, sorted ascending by timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricWindow {
    pub metric: String,
    pub window: TimeWindow,
    samples: Vec<MetricSample>,
}

impl MetricWindow {
    /// Build a window, sorting samples and dropping any outside the interval or for another metric
    pub fn new<S: Into<String>>(metric: S, window: TimeWindow, mut samples: Vec<MetricSample>) -> Self {
        let metric = metric.into();
        samples.retain(|s| s.metric == metric && window.contains(s.timestamp));
        samples.sort_by_key(|s| s.timestamp);
        Self {
            metric,
            window,
            samples,
        }
    }

    pub fn samples(&self) -> &[MetricSample] {
        &self.samples
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&MetricSample> {
        self.samples.last()
    }
}

/// One bucket of an aggregated series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatePoint {
    pub bucket_start: DateTime<Utc>,
    pub average: f64,
    pub count: usize,
}

/// System metrics gathered by one collector cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Non-idle fraction averaged across cores (0.0 to 1.0)
    pub cpu: f64,
    /// Used memory fraction (0.0 to 1.0)
    pub memory: f64,
    /// Distinct sessions with activity in the trailing window
    pub active_connections: u64,
    /// Requests per second over the trailing window
    pub request_rate: f64,
    /// Errors per request over the trailing window (0.0 to 1.0)
    pub error_rate: f64,
    /// Average response time in milliseconds
    pub avg_response_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Business metrics gathered by one collector cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessMetrics {
    pub active_users: u64,
    pub transaction_count: u64,
    pub successful_transactions: u64,
    pub transaction_value: f64,
    /// successful / total, 0.0 when there were no transactions
    pub conversion_rate: f64,
    pub timestamp: DateTime<Utc>,
}

/// Combined event broadcast once per successful collector cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub business: BusinessMetrics,
    pub collected_at: DateTime<Utc>,
}

/// Dashboard history payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoricalMetrics {
    pub system: Vec<SystemMetrics>,
    pub business: Vec<BusinessMetrics>,
}

/// Look-back period accepted by `get_historical_metrics`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryPeriod {
    Hour,
    Day,
    Week,
    Month,
}

impl HistoryPeriod {
    pub fn duration(&self) -> Duration {
        match self {
            HistoryPeriod::Hour => Duration::hours(1),
            HistoryPeriod::Day => Duration::hours(24),
            HistoryPeriod::Week => Duration::days(7),
            HistoryPeriod::Month => Duration::days(30),
        }
    }

    pub fn window_ending(&self, end: DateTime<Utc>) -> TimeWindow {
        TimeWindow::new(end - self.duration(), end)
    }
}

impl FromStr for HistoryPeriod {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1h" | "hour" => Ok(HistoryPeriod::Hour),
            "24h" | "1d" | "day" => Ok(HistoryPeriod::Day),
            "7d" | "week" => Ok(HistoryPeriod::Week),
            "30d" | "month" => Ok(HistoryPeriod::Month),
            other => Err(MonitorError::config(format!("Unknown history period: {}", other))),
        }
    }
}

impl SystemMetrics {
    /// Flatten into samples sharing one timestamp
    pub fn to_samples(&self) -> Result<Vec<MetricSample>> {
        let ts = self.timestamp;
        Ok(vec![
            MetricSample::new(names::CPU, self.cpu, ts)?,
            MetricSample::new(names::MEMORY, self.memory, ts)?,
            MetricSample::new(names::ACTIVE_CONNECTIONS, self.active_connections as f64, ts)?,
            MetricSample::new(names::REQUEST_RATE, self.request_rate, ts)?,
            MetricSample::new(names::ERROR_RATE, self.error_rate, ts)?,
            MetricSample::new(names::RESPONSE_TIME, self.avg_response_time_ms, ts)?,
        ])
    }

    fn from_values(timestamp: DateTime<Utc>, values: &HashMap<&str, f64>) -> Option<Self> {
        Some(Self {
            cpu: *values.get(names::CPU)?,
            memory: *values.get(names::MEMORY)?,
            active_connections: *values.get(names::ACTIVE_CONNECTIONS)? as u64,
            request_rate: *values.get(names::REQUEST_RATE)?,
            error_rate: *values.get(names::ERROR_RATE)?,
            avg_response_time_ms: *values.get(names::RESPONSE_TIME)?,
            timestamp,
        })
    }
}

impl BusinessMetrics {
    /// Flatten into samples sharing one timestamp
    pub fn to_samples(&self) -> Result<Vec<MetricSample>> {
        let ts = self.timestamp;
        Ok(vec![
            MetricSample::new(names::ACTIVE_USERS, self.active_users as f64, ts)?,
            MetricSample::new(names::TRANSACTIONS, self.transaction_count as f64, ts)?,
            MetricSample::new(names::SUCCESSFUL_TRANSACTIONS, self.successful_transactions as f64, ts)?,
            MetricSample::new(names::TRANSACTION_VALUE, self.transaction_value, ts)?,
            MetricSample::new(names::CONVERSION_RATE, self.conversion_rate, ts)?,
        ])
    }

    fn from_values(timestamp: DateTime<Utc>, values: &HashMap<&str, f64>) -> Option<Self> {
        Some(Self {
            active_users: *values.get(names::ACTIVE_USERS)? as u64,
            transaction_count: *values.get(names::TRANSACTIONS)? as u64,
            successful_transactions: *values.get(names::SUCCESSFUL_TRANSACTIONS)? as u64,
            transaction_value: *values.get(names::TRANSACTION_VALUE)?,
            conversion_rate: *values.get(names::CONVERSION_RATE)?,
            timestamp,
        })
    }
}

/// Conversion rate that never divides by zero
pub fn conversion_rate(successful: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64
    }
}

/// Regroup per-metric windows into snapshots keyed by cycle timestamp.
/// Timestamps missing any metric of the group are skipped.
pub fn regroup_history(windows: &[MetricWindow]) -> HistoricalMetrics {
    let mut by_timestamp: BTreeMap<DateTime<Utc>, HashMap<&str, f64>> = BTreeMap::new();
    for window in windows {
        for sample in window.samples() {
            by_timestamp
                .entry(sample.timestamp)
                .or_default()
                .insert(sample.metric.as_str(), sample.value);
        }
    }

    let mut history = HistoricalMetrics::default();
    for (timestamp, values) in &by_timestamp {
        if let Some(system) = SystemMetrics::from_values(*timestamp, values) {
            history.system.push(system);
        }
        if let Some(business) = BusinessMetrics::from_values(*timestamp, values) {
            history.business.push(business);
        }
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rejects_non_finite_values() {
        let now = Utc::now();
        assert!(MetricSample::new("cpu", f64::NAN, now).is_err());
        assert!(MetricSample::new("cpu", f64::INFINITY, now).is_err());
        assert!(MetricSample::new("cpu", f64::NEG_INFINITY, now).is_err());
        assert!(MetricSample::new("", 1.0, now).is_err());
        assert!(MetricSample::new("cpu", 0.5, now).is_ok());
    }

    #[test]
    fn test_window_sorts_and_filters() {
        let now = Utc::now();
        let window = TimeWindow::trailing_minutes(now, 10);
        let samples = vec![
            MetricSample::new("cpu", 3.0, now - Duration::minutes(1)).unwrap(),
            MetricSample::new("cpu", 1.0, now - Duration::minutes(9)).unwrap(),
            MetricSample::new("cpu", 9.0, now - Duration::minutes(30)).unwrap(),
            MetricSample::new("memory", 2.0, now - Duration::minutes(2)).unwrap(),
        ];
        let window = MetricWindow::new("cpu", window, samples);
        assert_eq!(window.values(), vec![1.0, 3.0]);
        assert_eq!(window.latest().map(|s| s.value), Some(3.0));
    }

    #[test]
    fn test_conversion_rate_with_zero_total() {
        let rate = conversion_rate(0, 0);
        assert_eq!(rate, 0.0);
        assert!(!rate.is_nan());
        assert_eq!(conversion_rate(3, 4), 0.75);
    }

    #[test]
    fn test_history_period_parsing() {
        assert_eq!("24h".parse::<HistoryPeriod>().unwrap(), HistoryPeriod::Day);
        assert_eq!("7d".parse::<HistoryPeriod>().unwrap(), HistoryPeriod::Week);
        assert!("fortnight".parse::<HistoryPeriod>().is_err());
    }

    #[test]
    fn test_regroup_history_pairs_samples_by_timestamp() {
        let now = Utc::now();
        let system = SystemMetrics {
            cpu: 0.5,
            memory: 0.4,
            active_connections: 12,
            request_rate: 3.0,
            error_rate: 0.01,
            avg_response_time_ms: 120.0,
            timestamp: now,
        };
        let window = TimeWindow::trailing_minutes(now, 5);
        let windows: Vec<MetricWindow> = system
            .to_samples()
            .unwrap()
            .into_iter()
            .map(|s| MetricWindow::new(s.metric.clone(), window, vec![s]))
            .collect();

        let history = regroup_history(&windows);
        assert_eq!(history.system, vec![system]);
        assert!(history.business.is_empty());
    }
}
