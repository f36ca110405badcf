// Metric Collector for the Monitoring Pipeline
// Gathers system and business metrics each cycle, persists them and broadcasts a snapshot

use super::broadcast::{LiveBroadcast, LiveEvent};
use super::metrics::{
    conversion_rate, names, regroup_history, BusinessMetrics, HistoricalMetrics, HistoryPeriod,
    MetricWindow, MetricsSnapshot, SystemMetrics, TimeWindow,
};
use super::resource_tracker::ResourceProbe;
use super::stats::running_mean;
use crate::config::CollectorSettings;
use crate::store::{LogLevel, LogStore, MetricStore, TransactionStatus, TransactionStore, HTTP_CATEGORY};
use crate::utils::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Collection statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    /// Total collection cycles attempted
    pub total_collections: u64,
    /// Cycles persisted and broadcast
    pub successful_collections: u64,
    /// Cycles abandoned on a collaborator failure
    pub failed_collections: u64,
    /// Samples persisted
    pub samples_written: u64,
    /// Average cycle duration in milliseconds
    pub avg_collection_time_ms: f64,
    pub last_collection: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Periodically samples the host and the log and transaction stores
pub struct MetricCollector {
    settings: CollectorSettings,
    probe: Arc<dyn ResourceProbe>,
    logs: Arc<dyn LogStore>,
    transactions: Arc<dyn TransactionStore>,
    metrics: Arc<dyn MetricStore>,
    live: Arc<dyn LiveBroadcast>,
    stats: RwLock<CollectionStats>,
}

impl MetricCollector {
    pub fn new(
        settings: CollectorSettings,
        probe: Arc<dyn ResourceProbe>,
        logs: Arc<dyn LogStore>,
        transactions: Arc<dyn TransactionStore>,
        metrics: Arc<dyn MetricStore>,
        live: Arc<dyn LiveBroadcast>,
    ) -> Self {
        Self {
            settings,
            probe,
            logs,
            transactions,
            metrics,
            live,
            stats: RwLock::new(CollectionStats::default()),
        }
    }

    /// Sample host and request metrics over the trailing window ending at `now`
    pub async fn collect_system_metrics(&self, now: DateTime<Utc>) -> Result<SystemMetrics> {
        let window = TimeWindow::trailing_minutes(now, self.settings.trailing_window_minutes);

        let usage = self
            .probe
            .sample()
            .await
            .map_err(|e| MonitorError::transient("resource probe".to_string(), e.to_string()))?;
        let requests = self.logs.count_requests(window).await?;
        let errors = self.logs.count_by_level(LogLevel::Error, window).await?;
        let sessions = self.logs.count_distinct_sessions(window).await?;
        let avg_response_time_ms = self.logs.avg_duration_by_category(HTTP_CATEGORY, window).await?;

        let seconds = window.seconds();
        let request_rate = if seconds > 0.0 { requests as f64 / seconds } else { 0.0 };
        let error_rate = if requests > 0 {
            (errors as f64 / requests as f64).min(1.0)
        } else {
            0.0
        };

        Ok(SystemMetrics {
            cpu: usage.cpu_percent / 100.0,
            memory: usage.memory_percent / 100.0,
            active_connections: sessions,
            request_rate,
            error_rate,
            avg_response_time_ms,
            timestamp: now,
        })
    }

    /// Sample user and transaction activity over the business window ending at `now`
    pub async fn collect_business_metrics(&self, now: DateTime<Utc>) -> Result<BusinessMetrics> {
        let window = TimeWindow::trailing_hours(now, self.settings.business_window_hours);

        let active_users = self.logs.count_distinct_users(window).await?;
        let transaction_count = self.transactions.count_total(window).await?;
        let successful_transactions = self
            .transactions
            .count_by_status(TransactionStatus::Completed, window)
            .await?;
        let transaction_value = self
            .transactions
            .sum_amount(Some(TransactionStatus::Completed), window)
            .await?;

        Ok(BusinessMetrics {
            active_users,
            transaction_count,
            successful_transactions,
            transaction_value,
            conversion_rate: conversion_rate(successful_transactions, transaction_count),
            timestamp: now,
        })
    }

    /// One collection cycle. Both groups are collected before anything is
    /// written; on any failure nothing is persisted or broadcast.
    pub async fn run_cycle(&self) -> Result<MetricsSnapshot> {
        let started = Instant::now();
        let now = Utc::now();
        let result = self.collect_and_publish(now).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut stats = self.stats.write().await;
        stats.total_collections += 1;
        stats.avg_collection_time_ms =
            running_mean(stats.avg_collection_time_ms, elapsed_ms, stats.total_collections);
        match &result {
            Ok(_) => {
                stats.successful_collections += 1;
                stats.last_collection = Some(now);
            }
            Err(e) => {
                stats.failed_collections += 1;
                stats.last_error = Some(e.to_string());
                warn!(error = %e, "Metric collection cycle abandoned");
            }
        }
        result
    }

    async fn collect_and_publish(&self, now: DateTime<Utc>) -> Result<MetricsSnapshot> {
        let system = self.collect_system_metrics(now).await?;
        let business = self.collect_business_metrics(now).await?;

        let mut samples = system.to_samples()?;
        samples.extend(business.to_samples()?);
        let written = samples.len() as u64;
        self.metrics.write_batch(samples).await?;

        let snapshot = MetricsSnapshot {
            system,
            business,
            collected_at: now,
        };
        let observers = self.live.publish(LiveEvent::Metrics(snapshot.clone()));

        self.stats.write().await.samples_written += written;
        debug!(samples = written, observers, "Collected metrics");
        Ok(snapshot)
    }

    /// Dashboard history for a look-back period ending now
    pub async fn get_historical_metrics(&self, period: HistoryPeriod) -> Result<HistoricalMetrics> {
        let window = period.window_ending(Utc::now());
        let mut windows: Vec<MetricWindow> = Vec::with_capacity(names::SYSTEM.len() + names::BUSINESS.len());
        for metric in names::SYSTEM.iter().chain(names::BUSINESS.iter()) {
            windows.push(self.metrics.read_window(metric, window).await?);
        }
        Ok(regroup_history(&windows))
    }

    pub async fn stats(&self) -> CollectionStats {
        self.stats.read().await.clone()
    }
}
