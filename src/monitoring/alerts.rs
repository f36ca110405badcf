// Alert Rule Engine for the Monitoring Pipeline
// Evaluates persisted rules against recent data and materializes Alert records

use super::forecast::AnomalyLog;
use super::metrics::TimeWindow;
use super::notifications::{ChannelKind, DispatchReport, Notification, NotificationDispatcher};
use crate::store::{AlertStore, LogLevel, LogStore, MetricStore, RuleStore, TransactionStatus, TransactionStore, HTTP_CATEGORY};
use crate::utils::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Alert severity levels, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What produced an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    ErrorRate,
    PaymentFailure,
    HighRefund,
    SystemLoad,
    ForecastAnomaly,
    AnomalyDetected,
    PerformanceDegraded,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::ErrorRate => "ERROR_RATE",
            AlertType::PaymentFailure => "PAYMENT_FAILURE",
            AlertType::HighRefund => "HIGH_REFUND",
            AlertType::SystemLoad => "SYSTEM_LOAD",
            AlertType::ForecastAnomaly => "FORECAST_ANOMALY",
            AlertType::AnomalyDetected => "ANOMALY_DETECTED",
            AlertType::PerformanceDegraded => "PERFORMANCE_DEGRADED",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Closed set of rule conditions; each has a dedicated evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Error-level log entries in the window, count ≥ threshold
    ErrorRate,
    /// Failed transactions in the window, count ≥ threshold
    PaymentFailure,
    /// Refunded percentage of transactions in the window ≥ threshold
    HighRefund,
    /// Average HTTP duration (or the average of `metric`) ≥ threshold
    SystemLoad,
    /// Any anomalous point recorded in the window
    ForecastAnomaly,
}

impl ConditionKind {
    pub fn alert_type(&self) -> AlertType {
        match self {
            ConditionKind::ErrorRate => AlertType::ErrorRate,
            ConditionKind::PaymentFailure => AlertType::PaymentFailure,
            ConditionKind::HighRefund => AlertType::HighRefund,
            ConditionKind::SystemLoad => AlertType::SystemLoad,
            ConditionKind::ForecastAnomaly => AlertType::ForecastAnomaly,
        }
    }
}

/// Persisted trigger definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub name: String,
    pub condition: ConditionKind,
    pub threshold: f64,
    pub time_window_minutes: u32,
    pub severity: Severity,
    pub channels: BTreeSet<ChannelKind>,
    /// Metric source for `system_load`, anomaly filter for `forecast_anomaly`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlertRule {
    /// Create an active rule with no channels
    pub fn new<S: Into<String>>(
        name: S,
        condition: ConditionKind,
        threshold: f64,
        time_window_minutes: u32,
        severity: Severity,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            condition,
            threshold,
            time_window_minutes,
            severity,
            channels: BTreeSet::new(),
            metric: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_channels<I: IntoIterator<Item = ChannelKind>>(mut self, channels: I) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    pub fn with_metric<S: Into<String>>(mut self, metric: S) -> Self {
        self.metric = Some(metric.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Reject definitions that must never reach the evaluation loop
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MonitorError::config("rule name must not be empty"));
        }
        if self.time_window_minutes == 0 {
            return Err(MonitorError::config(format!(
                "rule '{}': time_window must be greater than 0",
                self.name
            )));
        }
        if !self.threshold.is_finite() {
            return Err(MonitorError::config(format!(
                "rule '{}': threshold must be finite",
                self.name
            )));
        }
        if self.active && self.channels.is_empty() {
            return Err(MonitorError::config(format!(
                "rule '{}': active rules need at least one channel",
                self.name
            )));
        }
        if let Some(metric) = &self.metric {
            if metric.trim().is_empty() {
                return Err(MonitorError::config(format!(
                    "rule '{}': metric must not be blank",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Trailing evaluation window ending at `now`
    pub fn window_ending(&self, now: DateTime<Utc>) -> TimeWindow {
        TimeWindow::trailing_minutes(now, self.time_window_minutes)
    }
}

/// One firing instance of a rule or anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<Uuid>,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new<S: Into<String>>(
        alert_type: AlertType,
        severity: Severity,
        message: S,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            message: message.into(),
            details,
            created_at: Utc::now(),
            rule_id: None,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
        }
    }

    /// Alert for a triggered rule; details carry the rule snapshot
    pub fn from_rule(rule: &AlertRule, observed: f64, window: TimeWindow) -> Self {
        let mut alert = Self::new(
            rule.condition.alert_type(),
            rule.severity,
            format!("{} triggered", rule.name),
            json!({
                "rule": rule,
                "observed_value": observed,
                "window": window,
            }),
        );
        alert.rule_id = Some(rule.id);
        alert
    }

    /// Transition to resolved exactly once
    pub fn resolve<S: Into<String>>(&mut self, resolved_by: S, at: DateTime<Utc>) -> Result<()> {
        if self.resolved {
            return Err(MonitorError::AlreadyResolved {
                alert_id: self.id.to_string(),
            });
        }
        self.resolved = true;
        self.resolved_by = Some(resolved_by.into());
        self.resolved_at = Some(at);
        Ok(())
    }

    /// Notification payload for this alert
    pub fn to_notification(&self) -> Notification {
        Notification {
            alert_id: Some(self.id),
            severity: self.severity,
            title: format!("[{}] {}", self.severity.as_str().to_uppercase(), self.alert_type),
            message: self.message.clone(),
            data: Some(self.details.clone()),
            created_at: self.created_at,
        }
    }
}

/// Alert query filter; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertFilter {
    pub alert_type: Option<AlertType>,
    pub min_severity: Option<Severity>,
    pub resolved: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AlertFilter {
    pub fn unresolved() -> Self {
        Self {
            resolved: Some(false),
            ..Self::default()
        }
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        self.alert_type.map_or(true, |t| alert.alert_type == t)
            && self.min_severity.map_or(true, |s| alert.severity >= s)
            && self.resolved.map_or(true, |r| alert.resolved == r)
            && self.since.map_or(true, |s| alert.created_at >= s)
            && self.until.map_or(true, |u| alert.created_at <= u)
    }
}

/// Result of evaluating one rule in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Triggered { alert_id: Uuid, observed: f64 },
    NotTriggered { observed: f64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub outcome: EvaluationOutcome,
}

impl RuleEvaluation {
    pub fn triggered(&self) -> bool {
        matches!(self.outcome, EvaluationOutcome::Triggered { .. })
    }
}

/// Rule engine statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleEngineStats {
    pub cycles: u64,
    pub evaluations: u64,
    pub triggered: u64,
    pub failed_evaluations: u64,
    pub alerts_by_severity: HashMap<Severity, u64>,
    pub alerts_resolved: u64,
    pub last_evaluation: Option<DateTime<Utc>>,
}

/// Evaluates active rules and owns the alert raise/resolve path
pub struct AlertRuleEngine {
    rules: Arc<dyn RuleStore>,
    alerts: Arc<dyn AlertStore>,
    metrics: Arc<dyn MetricStore>,
    logs: Arc<dyn LogStore>,
    transactions: Arc<dyn TransactionStore>,
    anomalies: Arc<AnomalyLog>,
    dispatcher: Arc<NotificationDispatcher>,
    stats: RwLock<RuleEngineStats>,
}

impl AlertRuleEngine {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        alerts: Arc<dyn AlertStore>,
        metrics: Arc<dyn MetricStore>,
        logs: Arc<dyn LogStore>,
        transactions: Arc<dyn TransactionStore>,
        anomalies: Arc<AnomalyLog>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            rules,
            alerts,
            metrics,
            logs,
            transactions,
            anomalies,
            dispatcher,
            stats: RwLock::new(RuleEngineStats::default()),
        }
    }

    /// Validate and persist a new rule
    pub async fn create_rule(&self, rule: AlertRule) -> Result<AlertRule> {
        rule.validate()?;
        self.rules.upsert(rule.clone()).await?;
        info!(rule_id = %rule.id, rule = %rule.name, "Created alert rule");
        Ok(rule)
    }

    /// Validate and replace an existing rule
    pub async fn update_rule(&self, mut rule: AlertRule) -> Result<AlertRule> {
        let existing = self
            .rules
            .get(rule.id)
            .await?
            .ok_or_else(|| MonitorError::not_found("rule".to_string(), rule.id.to_string()))?;
        rule.created_at = existing.created_at;
        rule.updated_at = Utc::now();
        rule.validate()?;
        self.rules.upsert(rule.clone()).await?;
        info!(rule_id = %rule.id, rule = %rule.name, "Updated alert rule");
        Ok(rule)
    }

    pub async fn delete_rule(&self, id: Uuid) -> Result<()> {
        if self.rules.delete(id).await? {
            info!(rule_id = %id, "Deleted alert rule");
            Ok(())
        } else {
            Err(MonitorError::not_found("rule".to_string(), id.to_string()))
        }
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<Option<AlertRule>> {
        self.rules.get(id).await
    }

    pub async fn list_rules(&self) -> Result<Vec<AlertRule>> {
        self.rules.list().await
    }

    /// Evaluate every active rule once. A failing rule is logged and
    /// reported; the remaining rules are still evaluated. Only a failure to
    /// load the rule set fails the cycle.
    pub async fn evaluate_all(&self) -> Result<Vec<RuleEvaluation>> {
        let rules = self.rules.list_active().await.map_err(|e| {
            MonitorError::transient("rule store".to_string(), e.to_string())
        })?;

        let mut evaluations = Vec::with_capacity(rules.len());
        for rule in &rules {
            evaluations.push(self.evaluate_rule(rule).await);
        }

        {
            let mut stats = self.stats.write().await;
            stats.cycles += 1;
            stats.last_evaluation = Some(Utc::now());
        }

        let triggered = evaluations.iter().filter(|e| e.triggered()).count();
        debug!(rules = rules.len(), triggered, "Rule evaluation cycle complete");
        Ok(evaluations)
    }

    /// Idle → Evaluating → Triggered | NotTriggered, with failures isolated to this rule
    pub async fn evaluate_rule(&self, rule: &AlertRule) -> RuleEvaluation {
        let now = Utc::now();
        let window = rule.window_ending(now);

        let outcome = match self.measure(rule, window).await {
            Ok(observed) if self.is_breached(rule, observed) => {
                let alert = Alert::from_rule(rule, observed, window);
                match self.raise(alert, &rule.channels).await {
                    Ok((alert, _report)) => EvaluationOutcome::Triggered {
                        alert_id: alert.id,
                        observed,
                    },
                    Err(e) => {
                        error!(rule_id = %rule.id, rule = %rule.name, error = %e, "Failed to persist alert");
                        EvaluationOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                }
            }
            Ok(observed) => EvaluationOutcome::NotTriggered { observed },
            Err(e) => {
                let e = MonitorError::rule_evaluation(rule.name.clone(), e.to_string());
                warn!(rule_id = %rule.id, error = %e, "Skipping rule for this cycle");
                EvaluationOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        {
            let mut stats = self.stats.write().await;
            stats.evaluations += 1;
            match &outcome {
                EvaluationOutcome::Triggered { .. } => stats.triggered += 1,
                EvaluationOutcome::Failed { .. } => stats.failed_evaluations += 1,
                EvaluationOutcome::NotTriggered { .. } => {}
            }
        }

        RuleEvaluation {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            outcome,
        }
    }

    /// Observed value for the rule's condition over `window`
    async fn measure(&self, rule: &AlertRule, window: TimeWindow) -> Result<f64> {
        match rule.condition {
            ConditionKind::ErrorRate => {
                let count = self.logs.count_by_level(LogLevel::Error, window).await?;
                Ok(count as f64)
            }
            ConditionKind::PaymentFailure => {
                let count = self
                    .transactions
                    .count_by_status(TransactionStatus::Failed, window)
                    .await?;
                Ok(count as f64)
            }
            ConditionKind::HighRefund => self.transactions.refund_rate(window).await,
            ConditionKind::SystemLoad => match &rule.metric {
                Some(metric) => {
                    let samples = self.metrics.read_window(metric, window).await?;
                    Ok(super::stats::mean(&samples.values()).unwrap_or(0.0))
                }
                None => {
                    self.logs
                        .avg_duration_by_category(HTTP_CATEGORY, window)
                        .await
                }
            },
            ConditionKind::ForecastAnomaly => {
                let points = self
                    .anomalies
                    .in_window(rule.metric.as_deref(), window)
                    .await;
                Ok(points.len() as f64)
            }
        }
    }

    fn is_breached(&self, rule: &AlertRule, observed: f64) -> bool {
        match rule.condition {
            ConditionKind::ForecastAnomaly => observed >= 1.0,
            _ => observed >= rule.threshold,
        }
    }

    /// Persist an alert and hand it to the dispatcher. Used by rule
    /// evaluation and by the forecast engine for anomaly alerts.
    pub async fn raise(
        &self,
        alert: Alert,
        channels: &BTreeSet<ChannelKind>,
    ) -> Result<(Alert, DispatchReport)> {
        self.alerts.create(alert.clone()).await?;

        {
            let mut stats = self.stats.write().await;
            *stats.alerts_by_severity.entry(alert.severity).or_insert(0) += 1;
        }
        warn!(
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            "Alert triggered: {}",
            alert.message
        );

        let report = self
            .dispatcher
            .dispatch(alert.to_notification(), channels)
            .await;
        Ok((alert, report))
    }

    pub async fn get_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        self.alerts.query(filter).await
    }

    /// Resolve an alert; a second resolution fails with `AlreadyResolved`
    pub async fn resolve_alert(&self, id: Uuid, resolved_by: &str) -> Result<Alert> {
        let alert = self.alerts.resolve(id, resolved_by, Utc::now()).await?;
        self.stats.write().await.alerts_resolved += 1;
        info!(alert_id = %id, resolved_by, "Alert resolved");
        Ok(alert)
    }

    pub async fn stats(&self) -> RuleEngineStats {
        self.stats.read().await.clone()
    }
}
