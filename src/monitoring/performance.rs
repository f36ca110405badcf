// Performance Analyzer
// Scores host and request health, persists each analysis and alerts on degradation

use super::alerts::{Alert, AlertRuleEngine, AlertType, Severity};
use super::metrics::TimeWindow;
use super::notifications::ChannelKind;
use super::resource_tracker::{ResourceProbe, ResourceUsage};
use super::stats::{self, TrendDirection};
use crate::config::{ForecastSettings, PerformanceSettings, ThresholdLevel, ThresholdTable};
use crate::store::{LogLevel, LogStore, PerformanceStore, HTTP_CATEGORY};
use crate::utils::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const WARNING_WEIGHT: f64 = 10.0;
const CRITICAL_WEIGHT: f64 = 20.0;
const OVERAGE_FACTOR: f64 = 0.5;
const ERROR_RATE_FACTOR: f64 = 2.0;

/// Resource a bottleneck can be attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Cpu,
    Memory,
    Disk,
    Network,
    ResponseTime,
    ErrorRate,
}

impl Resource {
    pub const ALL: [Resource; 6] = [
        Resource::Cpu,
        Resource::Memory,
        Resource::Disk,
        Resource::Network,
        Resource::ResponseTime,
        Resource::ErrorRate,
    ];

    fn threshold(&self, table: &ThresholdTable) -> ThresholdLevel {
        match self {
            Resource::Cpu => table.cpu,
            Resource::Memory => table.memory,
            Resource::Disk => table.disk,
            Resource::Network => table.network,
            Resource::ResponseTime => table.response_time_ms,
            Resource::ErrorRate => table.error_rate,
        }
    }

    fn recommendation(&self, severity: BottleneckSeverity) -> &'static str {
        match (self, severity) {
            (Resource::Cpu, BottleneckSeverity::Critical) => {
                "CPU saturated: scale out or shed load immediately"
            }
            (Resource::Cpu, _) => "CPU usage high: profile hot paths or add capacity",
            (Resource::Memory, BottleneckSeverity::Critical) => {
                "Memory nearly exhausted: restart leaking workers or add memory"
            }
            (Resource::Memory, _) => "Memory usage high: review caches and allocation growth",
            (Resource::Disk, BottleneckSeverity::Critical) => {
                "Disk nearly full: free space or expand the volume now"
            }
            (Resource::Disk, _) => "Disk usage high: rotate logs and prune old data",
            (Resource::Network, BottleneckSeverity::Critical) => {
                "Network link saturated: throttle transfers or add bandwidth"
            }
            (Resource::Network, _) => "Network usage high: check for unexpected traffic",
            (Resource::ResponseTime, BottleneckSeverity::Critical) => {
                "Responses very slow: inspect slow queries and downstream latency"
            }
            (Resource::ResponseTime, _) => "Responses slowing: review caching and query plans",
            (Resource::ErrorRate, BottleneckSeverity::Critical) => {
                "Error rate critical: check recent deployments and dependencies"
            }
            (Resource::ErrorRate, _) => "Error rate elevated: inspect error logs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckSeverity {
    Warning,
    Critical,
}

impl BottleneckSeverity {
    fn weight(&self) -> f64 {
        match self {
            BottleneckSeverity::Warning => WARNING_WEIGHT,
            BottleneckSeverity::Critical => CRITICAL_WEIGHT,
        }
    }

    fn rank(&self) -> f64 {
        match self {
            BottleneckSeverity::Warning => 1.0,
            BottleneckSeverity::Critical => 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub resource: Resource,
    pub severity: BottleneckSeverity,
    pub value: f64,
    pub threshold: f64,
    pub recommendation: String,
}

/// Overall health derived from the score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Inputs gathered for one analysis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceInputs {
    pub resources: ResourceUsage,
    pub avg_response_time_ms: f64,
    /// Errors per request, in percent
    pub error_rate_percent: f64,
    pub concurrent_users: u64,
}

impl PerformanceInputs {
    fn value_of(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Cpu => self.resources.cpu_percent,
            Resource::Memory => self.resources.memory_percent,
            Resource::Disk => self.resources.disk_percent,
            Resource::Network => self.resources.network_percent,
            Resource::ResponseTime => self.avg_response_time_ms,
            Resource::ErrorRate => self.error_rate_percent,
        }
    }
}

/// One persisted analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAnalysis {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub inputs: PerformanceInputs,
    pub bottlenecks: Vec<Bottleneck>,
    /// 0 (worst) to 100 (best)
    pub score: f64,
    pub status: HealthStatus,
}

/// Direction of one resource over the trend window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTrend {
    pub resource: Resource,
    pub direction: TrendDirection,
    pub first_half_avg: f64,
    pub second_half_avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckRanking {
    pub resource: Resource,
    pub occurrences: usize,
    /// 1.0 = always warning, 2.0 = always critical
    pub avg_severity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTrends {
    pub window: TimeWindow,
    pub analyses: usize,
    pub score: ResourceTrendScore,
    pub resources: Vec<ResourceTrend>,
    /// Most frequent first, ties broken by average severity
    pub top_bottlenecks: Vec<BottleneckRanking>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTrendScore {
    pub direction: TrendDirection,
    pub average: f64,
}

/// Threshold check per resource, reporting the more severe level crossed
pub fn detect_bottlenecks(table: &ThresholdTable, inputs: &PerformanceInputs) -> Vec<Bottleneck> {
    Resource::ALL
        .iter()
        .filter_map(|&resource| {
            let value = inputs.value_of(resource);
            let level = resource.threshold(table);
            let (severity, threshold) = if value >= level.critical {
                (BottleneckSeverity::Critical, level.critical)
            } else if value >= level.warning {
                (BottleneckSeverity::Warning, level.warning)
            } else {
                return None;
            };
            Some(Bottleneck {
                resource,
                severity,
                value,
                threshold,
                recommendation: resource.recommendation(severity).to_string(),
            })
        })
        .collect()
}

/// 100 minus bottleneck weights, host overage above warning levels and a
/// penalty proportional to the error rate, clamped to [0, 100]
pub fn compute_score(table: &ThresholdTable, inputs: &PerformanceInputs, bottlenecks: &[Bottleneck]) -> f64 {
    let weights: f64 = bottlenecks.iter().map(|b| b.severity.weight()).sum();
    let overage: f64 = [Resource::Cpu, Resource::Memory, Resource::Disk, Resource::Network]
        .iter()
        .map(|r| (inputs.value_of(*r) - r.threshold(table).warning).max(0.0))
        .sum();
    let score = 100.0 - weights - overage * OVERAGE_FACTOR - inputs.error_rate_percent * ERROR_RATE_FACTOR;
    score.clamp(0.0, 100.0)
}

/// Analyzes host and request health on a fixed interval
pub struct PerformanceAnalyzer {
    settings: PerformanceSettings,
    logs: Arc<dyn LogStore>,
    probe: Arc<dyn ResourceProbe>,
    store: Arc<dyn PerformanceStore>,
    alerts: Arc<AlertRuleEngine>,
    trend_dead_zone: f64,
}

impl PerformanceAnalyzer {
    pub fn new(
        settings: PerformanceSettings,
        logs: Arc<dyn LogStore>,
        probe: Arc<dyn ResourceProbe>,
        store: Arc<dyn PerformanceStore>,
        alerts: Arc<AlertRuleEngine>,
    ) -> Self {
        Self {
            settings,
            logs,
            probe,
            store,
            alerts,
            trend_dead_zone: ForecastSettings::default().trend_dead_zone,
        }
    }

    /// Relative change below which a resource counts as stable
    pub fn with_trend_dead_zone(mut self, dead_zone: f64) -> Self {
        self.trend_dead_zone = dead_zone;
        self
    }

    async fn gather(&self, now: DateTime<Utc>) -> Result<PerformanceInputs> {
        let window = TimeWindow::trailing_minutes(now, self.settings.window_minutes);
        let resources = self
            .probe
            .sample()
            .await
            .map_err(|e| MonitorError::transient("resource probe".to_string(), e.to_string()))?;
        let avg_response_time_ms = self.logs.avg_duration_by_category(HTTP_CATEGORY, window).await?;
        let requests = self.logs.count_requests(window).await?;
        let errors = self.logs.count_by_level(LogLevel::Error, window).await?;
        let concurrent_users = self.logs.count_distinct_sessions(window).await?;

        let error_rate_percent = if requests > 0 {
            (errors as f64 * 100.0 / requests as f64).min(100.0)
        } else {
            0.0
        };

        Ok(PerformanceInputs {
            resources,
            avg_response_time_ms,
            error_rate_percent,
            concurrent_users,
        })
    }

    /// Score a set of inputs without persisting or alerting
    pub fn evaluate(&self, inputs: PerformanceInputs, timestamp: DateTime<Utc>) -> PerformanceAnalysis {
        let table = &self.settings.thresholds;
        let bottlenecks = detect_bottlenecks(table, &inputs);
        let score = compute_score(table, &inputs, &bottlenecks);
        let status = if score < self.settings.critical_score {
            HealthStatus::Critical
        } else if score < self.settings.warning_score {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        PerformanceAnalysis {
            id: Uuid::new_v4(),
            timestamp,
            inputs,
            bottlenecks,
            score,
            status,
        }
    }

    /// Gather, score, persist and alert
    pub async fn analyze_performance(&self) -> Result<PerformanceAnalysis> {
        let now = Utc::now();
        let inputs = self.gather(now).await?;
        let analysis = self.evaluate(inputs, now);
        self.store.save(analysis.clone()).await?;

        info!(
            score = analysis.score,
            bottlenecks = analysis.bottlenecks.len(),
            status = ?analysis.status,
            "Performance analysis complete"
        );

        let severity = match analysis.status {
            HealthStatus::Critical => Some(Severity::Critical),
            HealthStatus::Degraded => Some(Severity::Medium),
            HealthStatus::Healthy => None,
        };
        if let Some(severity) = severity {
            let resources: Vec<Resource> = analysis.bottlenecks.iter().map(|b| b.resource).collect();
            let alert = Alert::new(
                AlertType::PerformanceDegraded,
                severity,
                format!(
                    "Performance score {:.1} with {} bottleneck(s)",
                    analysis.score,
                    analysis.bottlenecks.len()
                ),
                json!({
                    "analysis_id": analysis.id,
                    "score": analysis.score,
                    "bottlenecks": analysis.bottlenecks,
                    "resources": resources,
                }),
            );
            let channels: BTreeSet<ChannelKind> = self.settings.alert_channels.iter().copied().collect();
            if let Err(e) = self.alerts.raise(alert, &channels).await {
                warn!(error = %e, "Failed to raise performance alert");
            }
        }

        Ok(analysis)
    }

    pub async fn get_historical_performance(&self, window: TimeWindow) -> Result<Vec<PerformanceAnalysis>> {
        self.store.range(window).await
    }

    /// Per-resource direction and the most frequent bottlenecks over the trend window
    pub async fn get_trends(&self) -> Result<PerformanceTrends> {
        let window = TimeWindow::trailing_hours(Utc::now(), self.settings.trend_window_hours);
        let history = self.store.range(window).await?;
        Ok(summarize_trends(window, &history, self.trend_dead_zone))
    }
}

/// Trend summary over a chronologically ordered history
pub fn summarize_trends(window: TimeWindow, history: &[PerformanceAnalysis], dead_zone: f64) -> PerformanceTrends {
    let resources = Resource::ALL
        .iter()
        .map(|&resource| {
            let values: Vec<f64> = history.iter().map(|a| a.inputs.value_of(resource)).collect();
            let (first, second) = values.split_at(values.len() / 2);
            ResourceTrend {
                resource,
                direction: stats::classify_trend(&values, dead_zone),
                first_half_avg: stats::mean(first).unwrap_or(0.0),
                second_half_avg: stats::mean(second).unwrap_or(0.0),
            }
        })
        .collect();

    let scores: Vec<f64> = history.iter().map(|a| a.score).collect();

    let mut counts: HashMap<Resource, (usize, f64)> = HashMap::new();
    for bottleneck in history.iter().flat_map(|a| &a.bottlenecks) {
        let entry = counts.entry(bottleneck.resource).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += bottleneck.severity.rank();
    }
    let mut top_bottlenecks: Vec<BottleneckRanking> = counts
        .into_iter()
        .map(|(resource, (occurrences, severity_sum))| BottleneckRanking {
            resource,
            occurrences,
            avg_severity: severity_sum / occurrences as f64,
        })
        .collect();
    top_bottlenecks.sort_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then(b.avg_severity.total_cmp(&a.avg_severity))
            .then(a.resource.cmp(&b.resource))
    });

    PerformanceTrends {
        window,
        analyses: history.len(),
        score: ResourceTrendScore {
            direction: stats::classify_trend(&scores, dead_zone),
            average: stats::mean(&scores).unwrap_or(0.0),
        },
        resources,
        top_bottlenecks,
    }
}
