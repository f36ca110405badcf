// Operational Monitoring Pipeline
// Wires the collector, rule engine, forecast engine, performance analyzer and
// notification dispatcher together and supervises their periodic loops

use crate::config::MonitorConfig;
use crate::security::SecretCipher;
use crate::store::{
    AlertStore, ChannelConfigStore, InMemoryAlertStore, InMemoryChannelStore, InMemoryLogStore,
    InMemoryMetricStore, InMemoryPerformanceStore, InMemoryRuleStore, InMemoryTransactionStore,
    LogStore, MetricStore, PerformanceStore, RuleStore, TransactionStore,
};
use crate::utils::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod alerts;
pub mod broadcast;
pub mod collectors;
pub mod forecast;
pub mod metrics;
pub mod notifications;
pub mod performance;
pub mod resource_tracker;
pub mod stats;

#[cfg(test)]
mod tests;

use alerts::{Alert, AlertFilter, AlertRule, AlertRuleEngine, RuleEngineStats, RuleEvaluation};
use broadcast::{BroadcastHub, LiveBroadcast, Observer};
use collectors::{CollectionStats, MetricCollector};
use forecast::{AnomalyLog, AnomalyPoint, ForecastEngine, ForecastOutcome, TrendResult};
use metrics::{HistoricalMetrics, HistoryPeriod, MetricsSnapshot, TimeWindow};
use notifications::{ChannelDefinition, ChannelOutcome, ChannelRecord, DispatchStats, NotificationDispatcher};
use performance::{PerformanceAnalysis, PerformanceAnalyzer, PerformanceTrends};
use resource_tracker::{ResourceProbe, SysinfoProbe};

/// External collaborators the pipeline reads from and writes to
#[derive(Clone)]
pub struct Stores {
    pub metrics: Arc<dyn MetricStore>,
    pub logs: Arc<dyn LogStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub rules: Arc<dyn RuleStore>,
    pub channels: Arc<dyn ChannelConfigStore>,
    pub performance: Arc<dyn PerformanceStore>,
}

impl Stores {
    /// Fresh in-memory stores
    pub fn in_memory() -> Self {
        Self {
            metrics: Arc::new(InMemoryMetricStore::new()),
            logs: Arc::new(InMemoryLogStore::new()),
            transactions: Arc::new(InMemoryTransactionStore::new()),
            alerts: Arc::new(InMemoryAlertStore::new()),
            rules: Arc::new(InMemoryRuleStore::new()),
            channels: Arc::new(InMemoryChannelStore::new()),
            performance: Arc::new(InMemoryPerformanceStore::new()),
        }
    }
}

/// Periodic loops supervised by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Collector,
    Rules,
    Forecast,
    Performance,
}

impl LoopKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopKind::Collector => "collector",
            LoopKind::Rules => "rules",
            LoopKind::Forecast => "forecast",
            LoopKind::Performance => "performance",
        }
    }
}

/// Health of one periodic loop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopHealth {
    pub cycles: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
}

impl LoopHealth {
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures == 0
    }
}

/// Service-wide health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub running: bool,
    pub overall_healthy: bool,
    pub uptime_seconds: u64,
    pub loops: BTreeMap<LoopKind, LoopHealth>,
    pub collector: CollectionStats,
    pub rules: RuleEngineStats,
    pub dispatch: DispatchStats,
    pub live_observers: usize,
    pub anomalies_logged: usize,
}

type HealthMap = Arc<RwLock<BTreeMap<LoopKind, LoopHealth>>>;

/// Optional collaborators; defaults are used for anything left unset
#[derive(Default)]
pub struct ServiceParts {
    pub cipher: Option<Arc<SecretCipher>>,
    pub hub: Option<Arc<BroadcastHub>>,
    pub probe: Option<Arc<dyn ResourceProbe>>,
    pub dispatcher: Option<Arc<NotificationDispatcher>>,
}

/// Monitoring pipeline entry point
pub struct MonitoringService {
    config: MonitorConfig,
    hub: Arc<BroadcastHub>,
    anomalies: Arc<AnomalyLog>,
    dispatcher: Arc<NotificationDispatcher>,
    collector: Arc<MetricCollector>,
    rule_engine: Arc<AlertRuleEngine>,
    forecast: Arc<ForecastEngine>,
    performance: Arc<PerformanceAnalyzer>,
    health: HealthMap,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    start_time: Instant,
}

impl MonitoringService {
    /// Build the pipeline with the master key read from the configured env var
    pub fn new(config: MonitorConfig, stores: Stores) -> Result<Self> {
        Self::with_parts(config, stores, ServiceParts::default())
    }

    /// Build the pipeline, substituting any provided collaborators
    pub fn with_parts(config: MonitorConfig, stores: Stores, parts: ServiceParts) -> Result<Self> {
        config.validate()?;

        let hub = parts.hub.unwrap_or_else(|| Arc::new(BroadcastHub::default()));
        let probe: Arc<dyn ResourceProbe> = match parts.probe {
            Some(probe) => probe,
            None => Arc::new(SysinfoProbe::new(config.performance.network_capacity_bytes_per_sec)),
        };
        let dispatcher = match parts.dispatcher {
            Some(dispatcher) => dispatcher,
            None => {
                let cipher = match parts.cipher {
                    Some(cipher) => cipher,
                    None => Arc::new(SecretCipher::from_env(&config.security.master_key_env)?),
                };
                let live: Arc<dyn LiveBroadcast> = hub.clone();
                Arc::new(NotificationDispatcher::new(
                    config.notifications.clone(),
                    stores.channels.clone(),
                    cipher,
                    live,
                )?)
            }
        };

        let anomalies = Arc::new(AnomalyLog::new(config.forecast.anomaly_log_capacity));
        let rule_engine = Arc::new(AlertRuleEngine::new(
            stores.rules.clone(),
            stores.alerts.clone(),
            stores.metrics.clone(),
            stores.logs.clone(),
            stores.transactions.clone(),
            anomalies.clone(),
            dispatcher.clone(),
        ));
        let collector = Arc::new(MetricCollector::new(
            config.collector.clone(),
            probe.clone(),
            stores.logs.clone(),
            stores.transactions.clone(),
            stores.metrics.clone(),
            hub.clone(),
        ));
        let forecast = Arc::new(ForecastEngine::new(
            config.forecast.clone(),
            stores.metrics.clone(),
            anomalies.clone(),
            rule_engine.clone(),
        ));
        let performance = Arc::new(PerformanceAnalyzer::new(
            config.performance.clone(),
            stores.logs.clone(),
            probe,
            stores.performance.clone(),
            rule_engine.clone(),
        )
        .with_trend_dead_zone(config.forecast.trend_dead_zone));

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            hub,
            anomalies,
            dispatcher,
            collector,
            rule_engine,
            forecast,
            performance,
            health: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown,
            handles: Mutex::new(Vec::new()),
            start_time: Instant::now(),
        })
    }

    /// Load channels and spawn the four periodic loops
    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Err(MonitorError::config("monitoring service is already running"));
        }
        info!("Starting monitoring pipeline");
        self.shutdown.send_replace(false);

        if let Err(e) = self.dispatcher.reload_channels().await {
            warn!(error = %e, "Could not load notification channels, continuing with none");
        }

        let intervals = &self.config.intervals;

        let collector = self.collector.clone();
        handles.push(self.spawn_loop(LoopKind::Collector, intervals.collector(), move || {
            let collector = collector.clone();
            async move { collector.run_cycle().await.map(|_| ()) }
        }));

        let rule_engine = self.rule_engine.clone();
        handles.push(self.spawn_loop(LoopKind::Rules, intervals.rules(), move || {
            let rule_engine = rule_engine.clone();
            async move { rule_engine.evaluate_all().await.map(|_| ()) }
        }));

        let forecast = self.forecast.clone();
        handles.push(self.spawn_loop(LoopKind::Forecast, intervals.forecast(), move || {
            let forecast = forecast.clone();
            async move { forecast.run_cycle().await.map(|_| ()) }
        }));

        let performance = self.performance.clone();
        handles.push(self.spawn_loop(LoopKind::Performance, intervals.performance(), move || {
            let performance = performance.clone();
            async move { performance.analyze_performance().await.map(|_| ()) }
        }));

        info!(loops = handles.len(), "Monitoring pipeline started");
        Ok(())
    }

    /// Run `cycle` every `period` until shutdown. A failed cycle is logged
    /// and recorded; the loop keeps going. Cycles never overlap, and an
    /// in-flight cycle finishes before shutdown is observed.
    fn spawn_loop<F, Fut>(&self, kind: LoopKind, period: Duration, mut cycle: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let health = self.health.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(loop_kind = kind.as_str(), period_secs = period.as_secs(), "Loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        let result = cycle().await;
                        let elapsed = started.elapsed().as_millis() as u64;

                        let mut health = health.write().await;
                        let entry = health.entry(kind).or_default();
                        entry.cycles += 1;
                        entry.last_duration_ms = Some(elapsed);
                        match result {
                            Ok(()) => {
                                entry.consecutive_failures = 0;
                                entry.last_success = Some(Utc::now());
                            }
                            Err(e) => {
                                entry.failures += 1;
                                entry.consecutive_failures += 1;
                                entry.last_error = Some(e.to_string());
                                error!(loop_kind = kind.as_str(), error = %e, "Cycle failed");
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(loop_kind = kind.as_str(), "Loop stopped");
        })
    }

    /// Signal every loop to stop and wait for in-flight cycles to finish
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping monitoring pipeline");
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Loop task ended abnormally");
            }
        }
        info!("Monitoring pipeline stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        !self.handles.lock().await.is_empty()
    }

    pub async fn health(&self) -> ServiceHealth {
        let loops = self.health.read().await.clone();
        let running = self.is_running().await;
        ServiceHealth {
            running,
            overall_healthy: loops.values().all(LoopHealth::is_healthy),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            loops,
            collector: self.collector.stats().await,
            rules: self.rule_engine.stats().await,
            dispatch: self.dispatcher.stats().await,
            live_observers: self.hub.observer_count(),
            anomalies_logged: self.anomalies.len().await,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Register a live observer
    pub fn subscribe(&self) -> Observer {
        self.hub.subscribe()
    }

    pub async fn collect_now(&self) -> Result<MetricsSnapshot> {
        self.collector.run_cycle().await
    }

    pub async fn evaluate_rules_now(&self) -> Result<Vec<RuleEvaluation>> {
        self.rule_engine.evaluate_all().await
    }

    pub async fn get_historical_metrics(&self, period: HistoryPeriod) -> Result<HistoricalMetrics> {
        self.collector.get_historical_metrics(period).await
    }

    pub async fn get_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        self.rule_engine.get_alerts(filter).await
    }

    pub async fn resolve_alert(&self, id: Uuid, resolved_by: &str) -> Result<Alert> {
        self.rule_engine.resolve_alert(id, resolved_by).await
    }

    pub async fn create_rule(&self, rule: AlertRule) -> Result<AlertRule> {
        self.rule_engine.create_rule(rule).await
    }

    pub async fn update_rule(&self, rule: AlertRule) -> Result<AlertRule> {
        self.rule_engine.update_rule(rule).await
    }

    pub async fn delete_rule(&self, id: Uuid) -> Result<()> {
        self.rule_engine.delete_rule(id).await
    }

    pub async fn list_rules(&self) -> Result<Vec<AlertRule>> {
        self.rule_engine.list_rules().await
    }

    pub async fn predict_metric(&self, metric: &str) -> Result<ForecastOutcome> {
        self.forecast.predict_metric(metric).await
    }

    pub async fn detect_anomalies(&self, metric: &str) -> Result<Vec<AnomalyPoint>> {
        self.forecast.detect_anomalies(metric).await
    }

    pub async fn analyze_trends(&self, metric: &str) -> Result<TrendResult> {
        self.forecast.analyze_trends(metric).await
    }

    pub async fn analyze_performance(&self) -> Result<PerformanceAnalysis> {
        self.performance.analyze_performance().await
    }

    pub async fn get_historical_performance(&self, window: TimeWindow) -> Result<Vec<PerformanceAnalysis>> {
        self.performance.get_historical_performance(window).await
    }

    pub async fn get_performance_trends(&self) -> Result<PerformanceTrends> {
        self.performance.get_trends().await
    }

    pub async fn create_channel(&self, definition: ChannelDefinition) -> Result<ChannelRecord> {
        self.dispatcher.create_channel(definition).await
    }

    pub async fn update_channel(&self, id: Uuid, definition: ChannelDefinition) -> Result<ChannelRecord> {
        self.dispatcher.update_channel(id, definition).await
    }

    pub async fn delete_channel(&self, id: Uuid) -> Result<()> {
        self.dispatcher.delete_channel(id).await
    }

    pub async fn list_channels(&self) -> Result<Vec<ChannelRecord>> {
        self.dispatcher.list_channels().await
    }

    pub async fn reload_channels(&self) -> Result<usize> {
        self.dispatcher.reload_channels().await
    }

    pub async fn test_channel(&self, id: Uuid) -> Result<ChannelOutcome> {
        self.dispatcher.test_channel(id).await
    }
}
