//! Thread-safe in-memory stores.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AlertStore, ChannelConfigStore, LogEntry, LogLevel, LogStore, MetricStore, PerformanceStore,
    RuleStore, TransactionRecord, TransactionStatus, TransactionStore, HTTP_CATEGORY,
};
use crate::monitoring::alerts::{Alert, AlertFilter, AlertRule};
use crate::monitoring::metrics::{AggregatePoint, MetricSample, MetricWindow, TimeWindow};
use crate::monitoring::notifications::ChannelRecord;
use crate::monitoring::performance::PerformanceAnalysis;
use crate::utils::error::{MonitorError, Result};

/// Samples keyed by metric name
#[derive(Debug, Default)]
pub struct InMemoryMetricStore {
    series: RwLock<HashMap<String, Vec<MetricSample>>>,
}

impl InMemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sample_count(&self, metric: &str) -> usize {
        self.series.read().await.get(metric).map_or(0, Vec::len)
    }
}

#[async_trait]
impl MetricStore for InMemoryMetricStore {
    async fn write(&self, sample: MetricSample) -> Result<()> {
        if !sample.value.is_finite() {
            return Err(MonitorError::invalid_metric(format!(
                "{} has non-finite value",
                sample.metric
            )));
        }
        self.series
            .write()
            .await
            .entry(sample.metric.clone())
            .or_default()
            .push(sample);
        Ok(())
    }

    /// Validated up front and applied under one lock
    async fn write_batch(&self, samples: Vec<MetricSample>) -> Result<()> {
        if let Some(bad) = samples.iter().find(|s| !s.value.is_finite()) {
            return Err(MonitorError::invalid_metric(format!(
                "{} has non-finite value",
                bad.metric
            )));
        }
        let mut series = self.series.write().await;
        for sample in samples {
            series.entry(sample.metric.clone()).or_default().push(sample);
        }
        Ok(())
    }

    async fn read_window(&self, metric: &str, window: TimeWindow) -> Result<MetricWindow> {
        let samples = self
            .series
            .read()
            .await
            .get(metric)
            .map(|all| all.iter().filter(|s| window.contains(s.timestamp)).cloned().collect())
            .unwrap_or_default();
        Ok(MetricWindow::new(metric, window, samples))
    }

    async fn read_aggregate(
        &self,
        metric: &str,
        window: TimeWindow,
        bucket: Duration,
    ) -> Result<Vec<AggregatePoint>> {
        let bucket_secs = bucket.num_seconds();
        if bucket_secs <= 0 {
            return Err(MonitorError::store("bucket size must be positive"));
        }

        let series = self.series.read().await;
        let mut buckets: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
        for sample in series.get(metric).into_iter().flatten() {
            if !window.contains(sample.timestamp) {
                continue;
            }
            let key = sample.timestamp.timestamp().div_euclid(bucket_secs);
            let entry = buckets.entry(key).or_insert((0.0, 0));
            entry.0 += sample.value;
            entry.1 += 1;
        }

        Ok(buckets
            .into_iter()
            .filter_map(|(key, (sum, count))| {
                let bucket_start = DateTime::<Utc>::from_timestamp(key * bucket_secs, 0)?;
                Some(AggregatePoint {
                    bucket_start,
                    average: sum / count as f64,
                    count,
                })
            })
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    entries: RwLock<Vec<LogEntry>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, entry: LogEntry) {
        self.entries.write().await.push(entry);
    }

    fn count_distinct<'a, F>(entries: &'a [LogEntry], window: TimeWindow, key: F) -> u64
    where
        F: Fn(&'a LogEntry) -> Option<&'a String>,
    {
        entries
            .iter()
            .filter(|e| window.contains(e.timestamp))
            .filter_map(key)
            .collect::<HashSet<_>>()
            .len() as u64
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn count_by_level(&self, level: LogLevel, window: TimeWindow) -> Result<u64> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.level == level && window.contains(e.timestamp))
            .count() as u64)
    }

    async fn avg_duration_by_category(&self, category: &str, window: TimeWindow) -> Result<f64> {
        let entries = self.entries.read().await;
        let durations: Vec<f64> = entries
            .iter()
            .filter(|e| e.category == category && window.contains(e.timestamp))
            .filter_map(|e| e.duration_ms)
            .collect();
        if durations.is_empty() {
            return Ok(0.0);
        }
        Ok(durations.iter().sum::<f64>() / durations.len() as f64)
    }

    async fn count_requests(&self, window: TimeWindow) -> Result<u64> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.category == HTTP_CATEGORY && window.contains(e.timestamp))
            .count() as u64)
    }

    async fn count_distinct_sessions(&self, window: TimeWindow) -> Result<u64> {
        let entries = self.entries.read().await;
        Ok(Self::count_distinct(&entries, window, |e| e.session_id.as_ref()))
    }

    async fn count_distinct_users(&self, window: TimeWindow) -> Result<u64> {
        let entries = self.entries.read().await;
        Ok(Self::count_distinct(&entries, window, |e| e.user_id.as_ref()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTransactionStore {
    records: RwLock<Vec<TransactionRecord>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, record: TransactionRecord) {
        self.records.write().await.push(record);
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn count_by_status(&self, status: TransactionStatus, window: TimeWindow) -> Result<u64> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.status == status && window.contains(r.timestamp))
            .count() as u64)
    }

    async fn count_total(&self, window: TimeWindow) -> Result<u64> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| window.contains(r.timestamp))
            .count() as u64)
    }

    async fn refund_rate(&self, window: TimeWindow) -> Result<f64> {
        let records = self.records.read().await;
        let in_window: Vec<&TransactionRecord> =
            records.iter().filter(|r| window.contains(r.timestamp)).collect();
        if in_window.is_empty() {
            return Ok(0.0);
        }
        let refunded = in_window
            .iter()
            .filter(|r| r.status == TransactionStatus::Refunded)
            .count();
        Ok(refunded as f64 * 100.0 / in_window.len() as f64)
    }

    async fn sum_amount(&self, status: Option<TransactionStatus>, window: TimeWindow) -> Result<f64> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| window.contains(r.timestamp))
            .filter(|r| status.map_or(true, |s| r.status == s))
            .map(|r| r.amount)
            .sum())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAlertStore {
    alerts: RwLock<HashMap<Uuid, Alert>>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn create(&self, alert: Alert) -> Result<Uuid> {
        let id = alert.id;
        self.alerts.write().await.insert(id, alert);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Alert>> {
        Ok(self.alerts.read().await.get(&id).cloned())
    }

    async fn resolve(&self, id: Uuid, resolved_by: &str, resolved_at: DateTime<Utc>) -> Result<Alert> {
        let mut alerts = self.alerts.write().await;
        let alert = alerts
            .get_mut(&id)
            .ok_or_else(|| MonitorError::not_found("alert".to_string(), id.to_string()))?;
        alert.resolve(resolved_by, resolved_at)?;
        Ok(alert.clone())
    }

    async fn query(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let mut matched: Vec<Alert> = self
            .alerts
            .read()
            .await
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<BTreeMap<Uuid, AlertRule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn list(&self) -> Result<Vec<AlertRule>> {
        Ok(self.rules.read().await.values().cloned().collect())
    }

    async fn list_active(&self) -> Result<Vec<AlertRule>> {
        Ok(self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.active)
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AlertRule>> {
        Ok(self.rules.read().await.get(&id).cloned())
    }

    async fn upsert(&self, rule: AlertRule) -> Result<()> {
        self.rules.write().await.insert(rule.id, rule);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.rules.write().await.remove(&id).is_some())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryChannelStore {
    channels: RwLock<BTreeMap<Uuid, ChannelRecord>>,
}

impl InMemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelConfigStore for InMemoryChannelStore {
    async fn list(&self) -> Result<Vec<ChannelRecord>> {
        Ok(self.channels.read().await.values().cloned().collect())
    }

    async fn list_enabled(&self) -> Result<Vec<ChannelRecord>> {
        Ok(self
            .channels
            .read()
            .await
            .values()
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ChannelRecord>> {
        Ok(self.channels.read().await.get(&id).cloned())
    }

    async fn upsert(&self, record: ChannelRecord) -> Result<()> {
        self.channels.write().await.insert(record.id, record);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.channels.write().await.remove(&id).is_some())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPerformanceStore {
    analyses: RwLock<Vec<PerformanceAnalysis>>,
}

impl InMemoryPerformanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PerformanceStore for InMemoryPerformanceStore {
    async fn save(&self, analysis: PerformanceAnalysis) -> Result<()> {
        self.analyses.write().await.push(analysis);
        Ok(())
    }

    async fn range(&self, window: TimeWindow) -> Result<Vec<PerformanceAnalysis>> {
        let mut found: Vec<PerformanceAnalysis> = self
            .analyses
            .read()
            .await
            .iter()
            .filter(|a| window.contains(a.timestamp))
            .cloned()
            .collect();
        found.sort_by_key(|a| a.timestamp);
        Ok(found)
    }
}
