// Tests for the monitoring pipeline components
// Rule evaluation, dispatch isolation, collection cycles and service supervision

use super::alerts::*;
use super::broadcast::*;
use super::collectors::*;
use super::forecast::*;
use super::metrics::*;
use super::notifications::*;
use super::resource_tracker::*;
use super::stats::Baseline;
use super::*;
use crate::config::NotificationSettings;
use crate::store::*;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use secrecy::ExposeSecret;
use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex as StdMutex;

#[derive(Default)]
struct RecordingTransport {
    delivered: StdMutex<Vec<(String, Notification)>>,
    fail: HashSet<String>,
    slow: HashSet<String>,
    panic_on: HashSet<String>,
}

impl RecordingTransport {
    fn failing(names: &[&str]) -> Self {
        Self {
            fail: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    fn delivered_to(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ChannelTransport for RecordingTransport {
    async fn deliver(&self, channel: &ResolvedChannel, notification: &Notification) -> Result<()> {
        if self.panic_on.contains(&channel.name) {
            panic!("transport bug for {}", channel.name);
        }
        if self.slow.contains(&channel.name) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.fail.contains(&channel.name) {
            return Err(MonitorError::channel_delivery(
                channel.name.clone(),
                "connection refused".to_string(),
            ));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((channel.name.clone(), notification.clone()));
        Ok(())
    }
}

struct FixedProbe(ResourceUsage);

#[async_trait]
impl ResourceProbe for FixedProbe {
    async fn sample(&self) -> Result<ResourceUsage> {
        Ok(self.0)
    }
}

struct FailingLogStore;

#[async_trait]
impl LogStore for FailingLogStore {
    async fn count_by_level(&self, _level: LogLevel, _window: TimeWindow) -> Result<u64> {
        Err(MonitorError::store("log database unavailable"))
    }

    async fn avg_duration_by_category(&self, _category: &str, _window: TimeWindow) -> Result<f64> {
        Err(MonitorError::store("log database unavailable"))
    }

    async fn count_requests(&self, _window: TimeWindow) -> Result<u64> {
        Err(MonitorError::store("log database unavailable"))
    }

    async fn count_distinct_sessions(&self, _window: TimeWindow) -> Result<u64> {
        Err(MonitorError::store("log database unavailable"))
    }

    async fn count_distinct_users(&self, _window: TimeWindow) -> Result<u64> {
        Err(MonitorError::store("log database unavailable"))
    }
}

struct Harness {
    metrics: Arc<InMemoryMetricStore>,
    logs: Arc<InMemoryLogStore>,
    transactions: Arc<InMemoryTransactionStore>,
    channels: Arc<InMemoryChannelStore>,
    hub: Arc<BroadcastHub>,
    transport: Arc<RecordingTransport>,
    dispatcher: Arc<NotificationDispatcher>,
    anomalies: Arc<AnomalyLog>,
    engine: Arc<AlertRuleEngine>,
}

fn cipher() -> Arc<SecretCipher> {
    let key = SecretCipher::generate_key().unwrap();
    Arc::new(SecretCipher::from_base64_key(&key).unwrap())
}

fn harness_with(settings: NotificationSettings, transport: RecordingTransport, logs: Option<Arc<dyn LogStore>>) -> Harness {
    let metrics = Arc::new(InMemoryMetricStore::new());
    let memory_logs = Arc::new(InMemoryLogStore::new());
    let transactions = Arc::new(InMemoryTransactionStore::new());
    let channels = Arc::new(InMemoryChannelStore::new());
    let hub = Arc::new(BroadcastHub::default());
    let transport = Arc::new(transport);

    let mut dispatcher =
        NotificationDispatcher::new(settings, channels.clone(), cipher(), hub.clone()).unwrap();
    for kind in [ChannelKind::Email, ChannelKind::Chat, ChannelKind::Webhook, ChannelKind::Sms] {
        dispatcher = dispatcher.with_transport(kind, transport.clone());
    }
    let dispatcher = Arc::new(dispatcher);

    let anomalies = Arc::new(AnomalyLog::new(100));
    let engine = Arc::new(AlertRuleEngine::new(
        Arc::new(InMemoryRuleStore::new()),
        Arc::new(InMemoryAlertStore::new()),
        metrics.clone(),
        logs.unwrap_or_else(|| memory_logs.clone() as Arc<dyn LogStore>),
        transactions.clone(),
        anomalies.clone(),
        dispatcher.clone(),
    ));

    Harness {
        metrics,
        logs: memory_logs,
        transactions,
        channels,
        hub,
        transport,
        dispatcher,
        anomalies,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(NotificationSettings::default(), RecordingTransport::default(), None)
}

fn webhook(name: &str) -> ChannelDefinition {
    ChannelDefinition::new(name, ChannelKind::Webhook)
        .with_setting(keys::URL, format!("https://{}.example.com/hook", name.to_lowercase()))
}

fn log_entry(level: LogLevel, minutes_ago: i64) -> LogEntry {
    LogEntry {
        timestamp: Utc::now() - ChronoDuration::minutes(minutes_ago),
        level,
        category: HTTP_CATEGORY.to_string(),
        duration_ms: Some(150.0),
        session_id: Some(format!("session-{}", minutes_ago)),
        user_id: Some("user-1".to_string()),
        message: "GET /api/listings".to_string(),
    }
}

fn transaction(status: TransactionStatus, amount: f64) -> TransactionRecord {
    TransactionRecord {
        id: Uuid::new_v4(),
        timestamp: Utc::now() - ChronoDuration::minutes(1),
        status,
        amount,
        user_id: Some("buyer".to_string()),
    }
}

#[tokio::test]
async fn test_error_rate_rule_triggers_at_threshold() {
    let h = harness();
    h.dispatcher.create_channel(webhook("ops")).await.unwrap();
    for _ in 0..10 {
        h.logs.append(log_entry(LogLevel::Error, 1)).await;
    }

    let rule = h
        .engine
        .create_rule(
            AlertRule::new("High errors", ConditionKind::ErrorRate, 10.0, 5, Severity::High)
                .with_channels([ChannelKind::Webhook]),
        )
        .await
        .unwrap();

    let evaluations = h.engine.evaluate_all().await.unwrap();
    assert_eq!(evaluations.len(), 1);
    let EvaluationOutcome::Triggered { alert_id, observed } = evaluations[0].outcome.clone() else {
        panic!("expected trigger, got {:?}", evaluations[0].outcome);
    };
    assert_eq!(observed, 10.0);

    let alerts = h.engine.get_alerts(&AlertFilter::default()).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].id, alert_id);
    assert_eq!(alerts[0].alert_type, AlertType::ErrorRate);
    assert_eq!(alerts[0].severity, Severity::High);
    assert_eq!(alerts[0].message, "High errors triggered");
    assert_eq!(alerts[0].rule_id, Some(rule.id));
    assert_eq!(alerts[0].details["rule"]["name"], "High errors");
    assert_eq!(h.transport.delivered_to(), vec!["ops"]);
}

#[tokio::test]
async fn test_error_rate_rule_below_threshold_is_quiet() {
    let h = harness();
    for _ in 0..9 {
        h.logs.append(log_entry(LogLevel::Error, 1)).await;
    }
    h.engine
        .create_rule(
            AlertRule::new("High errors", ConditionKind::ErrorRate, 10.0, 5, Severity::High)
                .with_channels([ChannelKind::Webhook]),
        )
        .await
        .unwrap();

    let evaluations = h.engine.evaluate_all().await.unwrap();
    assert_eq!(evaluations[0].outcome, EvaluationOutcome::NotTriggered { observed: 9.0 });
    assert!(h.engine.get_alerts(&AlertFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rule_ignores_data_outside_window() {
    let h = harness();
    for _ in 0..25 {
        h.logs.append(log_entry(LogLevel::Error, 10)).await;
    }
    h.engine
        .create_rule(
            AlertRule::new("High errors", ConditionKind::ErrorRate, 10.0, 5, Severity::High)
                .with_channels([ChannelKind::Webhook]),
        )
        .await
        .unwrap();

    let evaluations = h.engine.evaluate_all().await.unwrap();
    assert!(!evaluations[0].triggered());
}

#[tokio::test]
async fn test_refund_and_payment_failure_rules() {
    let h = harness();
    for _ in 0..3 {
        h.transactions.append(transaction(TransactionStatus::Completed, 20.0)).await;
    }
    h.transactions.append(transaction(TransactionStatus::Refunded, 20.0)).await;
    h.transactions.append(transaction(TransactionStatus::Failed, 20.0)).await;

    h.engine
        .create_rule(
            AlertRule::new("Refunds", ConditionKind::HighRefund, 20.0, 60, Severity::Medium)
                .with_channels([ChannelKind::Chat]),
        )
        .await
        .unwrap();
    h.engine
        .create_rule(
            AlertRule::new("Payments", ConditionKind::PaymentFailure, 2.0, 60, Severity::Critical)
                .with_channels([ChannelKind::Chat]),
        )
        .await
        .unwrap();

    let evaluations = h.engine.evaluate_all().await.unwrap();
    let refunds = evaluations.iter().find(|e| e.rule_name == "Refunds").unwrap();
    let payments = evaluations.iter().find(|e| e.rule_name == "Payments").unwrap();
    // 1 of 5 refunded is exactly 20%
    assert!(refunds.triggered());
    assert_eq!(payments.outcome, EvaluationOutcome::NotTriggered { observed: 1.0 });
}

#[tokio::test]
async fn test_failing_rule_does_not_block_others() {
    let h = harness_with(
        NotificationSettings::default(),
        RecordingTransport::default(),
        Some(Arc::new(FailingLogStore)),
    );
    h.transactions.append(transaction(TransactionStatus::Failed, 5.0)).await;

    h.engine
        .create_rule(
            AlertRule::new("Errors", ConditionKind::ErrorRate, 1.0, 5, Severity::High)
                .with_channels([ChannelKind::Webhook]),
        )
        .await
        .unwrap();
    h.engine
        .create_rule(
            AlertRule::new("Payments", ConditionKind::PaymentFailure, 1.0, 5, Severity::High)
                .with_channels([ChannelKind::Webhook]),
        )
        .await
        .unwrap();

    let evaluations = h.engine.evaluate_all().await.unwrap();
    let errors = evaluations.iter().find(|e| e.rule_name == "Errors").unwrap();
    let payments = evaluations.iter().find(|e| e.rule_name == "Payments").unwrap();
    assert!(matches!(errors.outcome, EvaluationOutcome::Failed { .. }));
    assert!(payments.triggered());

    let stats = h.engine.stats().await;
    assert_eq!(stats.failed_evaluations, 1);
    assert_eq!(stats.triggered, 1);
}

#[tokio::test]
async fn test_system_load_uses_http_duration_without_metric() {
    let h = harness();
    let mut slow = log_entry(LogLevel::Info, 1);
    slow.duration_ms = Some(2500.0);
    h.logs.append(slow).await;

    let rule = AlertRule::new("Slow", ConditionKind::SystemLoad, 2000.0, 5, Severity::High)
        .with_channels([ChannelKind::Webhook]);
    let evaluation = h.engine.evaluate_rule(&rule).await;
    assert!(evaluation.triggered());
}

#[tokio::test]
async fn test_forecast_anomaly_rule_reads_anomaly_log() {
    let h = harness();
    let rule = AlertRule::new("Anomalies", ConditionKind::ForecastAnomaly, 1.0, 15, Severity::Medium)
        .with_channels([ChannelKind::Chat])
        .with_metric(names::CPU);
    assert!(!h.engine.evaluate_rule(&rule).await.triggered());

    h.anomalies
        .record(AnomalyPoint {
            metric: names::CPU.to_string(),
            timestamp: Utc::now() - ChronoDuration::minutes(2),
            value: 0.99,
            z_score: 4.2,
            baseline: Baseline { mean: 0.4, std_dev: 0.14 },
            predicted: false,
            detected_at: Utc::now() - ChronoDuration::minutes(2),
        })
        .await;
    assert!(h.engine.evaluate_rule(&rule).await.triggered());
}

#[tokio::test]
async fn test_rule_validation() {
    let h = harness();
    let zero_window = AlertRule::new("Bad", ConditionKind::ErrorRate, 1.0, 0, Severity::Low)
        .with_channels([ChannelKind::Email]);
    assert!(h.engine.create_rule(zero_window).await.unwrap_err().is_config_error());

    let no_channels = AlertRule::new("Bad", ConditionKind::ErrorRate, 1.0, 5, Severity::Low);
    assert!(h.engine.create_rule(no_channels).await.is_err());

    let inactive = AlertRule::new("Parked", ConditionKind::ErrorRate, 1.0, 5, Severity::Low).inactive();
    assert!(h.engine.create_rule(inactive).await.is_ok());

    let nan = AlertRule::new("Bad", ConditionKind::ErrorRate, f64::NAN, 5, Severity::Low)
        .with_channels([ChannelKind::Email]);
    assert!(h.engine.create_rule(nan).await.is_err());
}

#[tokio::test]
async fn test_inactive_rules_are_not_evaluated() {
    let h = harness();
    for _ in 0..5 {
        h.logs.append(log_entry(LogLevel::Error, 1)).await;
    }
    h.engine
        .create_rule(AlertRule::new("Parked", ConditionKind::ErrorRate, 1.0, 5, Severity::Low).inactive())
        .await
        .unwrap();
    assert!(h.engine.evaluate_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resolve_twice_is_rejected() {
    let h = harness();
    let alert = Alert::new(AlertType::ErrorRate, Severity::High, "High errors triggered", serde_json::json!({}));
    let (alert, _) = h.engine.raise(alert, &BTreeSet::new()).await.unwrap();

    let first = h.engine.resolve_alert(alert.id, "alice").await.unwrap();
    assert!(first.resolved);
    assert_eq!(first.resolved_by.as_deref(), Some("alice"));

    let second = h.engine.resolve_alert(alert.id, "bob").await;
    assert!(matches!(second, Err(MonitorError::AlreadyResolved { .. })));

    let open = h.engine.get_alerts(&AlertFilter::unresolved()).await.unwrap();
    assert!(open.is_empty());
    let all = h.engine.get_alerts(&AlertFilter::default()).await.unwrap();
    assert_eq!(all[0].resolved_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_dispatch_isolates_failing_channel() {
    let h = harness_with(
        NotificationSettings::default(),
        RecordingTransport::failing(&["B"]),
        None,
    );
    let a = h.dispatcher.create_channel(webhook("A")).await.unwrap();
    let b = h.dispatcher.create_channel(webhook("B")).await.unwrap();
    let c = h.dispatcher.create_channel(webhook("C")).await.unwrap();

    let notification = Notification::new(Severity::High, "Test", "three channels");
    let report = h
        .dispatcher
        .dispatch(notification, &BTreeSet::from([ChannelKind::Webhook]))
        .await;

    assert_eq!(report.outcomes.len(), 3);
    assert!(report.outcome_for(a.id).unwrap().is_delivered());
    assert!(report.outcome_for(c.id).unwrap().is_delivered());
    assert!(matches!(
        report.outcome_for(b.id).unwrap().status,
        DeliveryStatus::Failed { .. }
    ));
    assert_eq!(h.transport.delivered_to(), vec!["A", "C"]);

    let stats = h.dispatcher.stats().await;
    assert_eq!(stats.deliveries, 2);
    assert_eq!(stats.failures, 1);
}

#[tokio::test]
async fn test_dispatch_times_out_slow_channel() {
    let settings = NotificationSettings {
        channel_timeout_secs: 1,
        ..NotificationSettings::default()
    };
    let transport = RecordingTransport {
        slow: HashSet::from(["slow".to_string()]),
        ..RecordingTransport::default()
    };
    let h = harness_with(settings, transport, None);
    h.dispatcher.create_channel(webhook("slow")).await.unwrap();
    h.dispatcher.create_channel(webhook("fast")).await.unwrap();

    let report = h
        .dispatcher
        .dispatch(
            Notification::new(Severity::Medium, "Test", "timeouts"),
            &BTreeSet::from([ChannelKind::Webhook]),
        )
        .await;

    let slow = report.outcomes.iter().find(|o| o.channel_name == "slow").unwrap();
    assert_eq!(slow.status, DeliveryStatus::TimedOut);
    assert_eq!(h.transport.delivered_to(), vec!["fast"]);
}

#[tokio::test]
async fn test_dispatch_survives_panicking_transport() {
    let transport = RecordingTransport {
        panic_on: HashSet::from(["buggy".to_string()]),
        ..RecordingTransport::default()
    };
    let h = harness_with(NotificationSettings::default(), transport, None);
    h.dispatcher.create_channel(webhook("buggy")).await.unwrap();
    h.dispatcher.create_channel(webhook("steady")).await.unwrap();

    let report = h
        .dispatcher
        .dispatch(
            Notification::new(Severity::Low, "Test", "panic"),
            &BTreeSet::from([ChannelKind::Webhook]),
        )
        .await;

    assert_eq!(report.delivered(), 1);
    assert_eq!(report.failures().count(), 1);
    assert_eq!(h.transport.delivered_to(), vec!["steady"]);
}

#[tokio::test]
async fn test_dispatch_skips_disabled_and_unrequested_channels() {
    let h = harness();
    h.dispatcher.create_channel(webhook("off").disabled()).await.unwrap();
    h.dispatcher
        .create_channel(
            ChannelDefinition::new("team", ChannelKind::Chat)
                .with_secret(keys::WEBHOOK_URL, "https://chat.example.com/hooks/T0/B0/xyz"),
        )
        .await
        .unwrap();

    let report = h
        .dispatcher
        .dispatch(
            Notification::new(Severity::Low, "Test", "kinds"),
            &BTreeSet::from([ChannelKind::Webhook]),
        )
        .await;
    assert!(report.outcomes.is_empty());
    assert!(h.transport.delivered_to().is_empty());
}

#[tokio::test]
async fn test_dispatch_always_reaches_live_observers() {
    let h = harness();
    let mut observer = h.hub.subscribe();

    let report = h
        .dispatcher
        .dispatch(Notification::new(Severity::Low, "Test", "live"), &BTreeSet::new())
        .await;
    assert_eq!(report.observers, 1);
    assert!(matches!(observer.try_next(), Some(LiveEvent::Alert(n)) if n.message == "live"));
}

#[tokio::test]
async fn test_critical_alert_escalates_to_admins() {
    let settings = NotificationSettings {
        admin_emails: vec!["oncall@example.com".to_string()],
        admin_email_relay_url: Some("https://relay.example.com/send".to_string()),
        ..NotificationSettings::default()
    };
    let h = harness_with(settings, RecordingTransport::default(), None);

    let high = h
        .dispatcher
        .dispatch(Notification::new(Severity::High, "Test", "high"), &BTreeSet::new())
        .await;
    assert!(high.outcomes.is_empty());

    let critical = h
        .dispatcher
        .dispatch(Notification::new(Severity::Critical, "Test", "critical"), &BTreeSet::new())
        .await;
    assert_eq!(critical.outcomes.len(), 1);
    assert_eq!(critical.outcomes[0].channel_id, None);
    assert_eq!(critical.outcomes[0].kind, ChannelKind::Email);
    assert_eq!(h.transport.delivered_to(), vec!["admin-escalation"]);
}

#[tokio::test]
async fn test_channel_secrets_are_sealed_at_rest() {
    let h = harness();
    let secret_url = "https://chat.example.com/hooks/T0/B0/very-secret";
    let record = h
        .dispatcher
        .create_channel(
            ChannelDefinition::new("team", ChannelKind::Chat).with_secret(keys::WEBHOOK_URL, secret_url),
        )
        .await
        .unwrap();

    let stored = h.channels.get(record.id).await.unwrap().unwrap();
    let sealed = stored.sealed_secrets.get(keys::WEBHOOK_URL).unwrap();
    assert!(!sealed.contains("very-secret"));
    assert!(!format!("{:?}", stored).contains(sealed.as_str()));

    let resolved = h.dispatcher.resolve_channel(&stored).unwrap();
    assert_eq!(resolved.secret(keys::WEBHOOK_URL).unwrap().expose_secret(), secret_url);
}

#[tokio::test]
async fn test_failed_chat_delivery_keeps_webhook_secret_out_of_reports() {
    let channels = Arc::new(InMemoryChannelStore::new());
    let hub = Arc::new(BroadcastHub::default());
    let dispatcher =
        NotificationDispatcher::new(NotificationSettings::default(), channels, cipher(), hub).unwrap();
    dispatcher
        .create_channel(
            ChannelDefinition::new("team", ChannelKind::Chat)
                .with_secret(keys::WEBHOOK_URL, "http://127.0.0.1:1/services/T000/B000/TOPSECRETTOKEN"),
        )
        .await
        .unwrap();

    let report = dispatcher
        .dispatch(
            Notification::new(Severity::High, "Test", "unreachable chat"),
            &BTreeSet::from([ChannelKind::Chat]),
        )
        .await;

    assert_eq!(report.outcomes.len(), 1);
    let DeliveryStatus::Failed { error } = &report.outcomes[0].status else {
        panic!("expected failed delivery, got {:?}", report.outcomes[0].status);
    };
    assert!(!error.contains("TOPSECRETTOKEN"), "{}", error);
    assert!(!error.contains("/services/"), "{}", error);

    let stats = dispatcher.stats().await;
    let last_error = stats.last_error.unwrap();
    assert!(!last_error.contains("TOPSECRETTOKEN"), "{}", last_error);
}

#[tokio::test]
async fn test_sealed_secret_bound_to_channel() {
    let h = harness();
    let first = h
        .dispatcher
        .create_channel(
            ChannelDefinition::new("one", ChannelKind::Chat)
                .with_secret(keys::WEBHOOK_URL, "https://chat.example.com/hooks/one"),
        )
        .await
        .unwrap();
    let mut second = h
        .dispatcher
        .create_channel(
            ChannelDefinition::new("two", ChannelKind::Chat)
                .with_secret(keys::WEBHOOK_URL, "https://chat.example.com/hooks/two"),
        )
        .await
        .unwrap();

    second.sealed_secrets = first.sealed_secrets.clone();
    assert!(h.dispatcher.resolve_channel(&second).is_err());
}

#[tokio::test]
async fn test_channel_crud_refreshes_cache() {
    let h = harness();
    let record = h.dispatcher.create_channel(webhook("ops")).await.unwrap();
    assert_eq!(h.dispatcher.cached_channel_count().await, 1);

    h.dispatcher.set_channel_enabled(record.id, false).await.unwrap();
    assert_eq!(h.dispatcher.cached_channel_count().await, 0);

    h.dispatcher.delete_channel(record.id).await.unwrap();
    assert!(h.dispatcher.list_channels().await.unwrap().is_empty());
    assert!(h.dispatcher.delete_channel(record.id).await.is_err());
}

#[tokio::test]
async fn test_test_channel_reports_outcome() {
    let h = harness_with(NotificationSettings::default(), RecordingTransport::failing(&["down"]), None);
    let up = h.dispatcher.create_channel(webhook("up")).await.unwrap();
    let down = h.dispatcher.create_channel(webhook("down")).await.unwrap();

    assert!(h.dispatcher.test_channel(up.id).await.unwrap().is_delivered());
    assert!(!h.dispatcher.test_channel(down.id).await.unwrap().is_delivered());
    assert!(h.dispatcher.test_channel(Uuid::new_v4()).await.is_err());
}

fn collector(h: &Harness, transactions: Arc<dyn TransactionStore>) -> MetricCollector {
    MetricCollector::new(
        crate::config::CollectorSettings::default(),
        Arc::new(FixedProbe(ResourceUsage {
            cpu_percent: 42.0,
            memory_percent: 60.0,
            disk_percent: 30.0,
            network_percent: 1.0,
        })),
        h.logs.clone(),
        transactions,
        h.metrics.clone(),
        h.hub.clone(),
    )
}

#[tokio::test]
async fn test_collection_cycle_persists_and_broadcasts_once() {
    let h = harness();
    for minutes in 0..4 {
        h.logs.append(log_entry(LogLevel::Info, minutes)).await;
    }
    h.logs.append(log_entry(LogLevel::Error, 1)).await;
    h.transactions.append(transaction(TransactionStatus::Completed, 30.0)).await;
    h.transactions.append(transaction(TransactionStatus::Failed, 10.0)).await;

    let mut observer = h.hub.subscribe();
    let collector = collector(&h, h.transactions.clone());
    let snapshot = collector.run_cycle().await.unwrap();

    assert_eq!(snapshot.system.cpu, 0.42);
    assert_eq!(snapshot.system.error_rate, 0.2);
    assert_eq!(snapshot.business.transaction_count, 2);
    assert_eq!(snapshot.business.conversion_rate, 0.5);
    assert_eq!(snapshot.business.transaction_value, 30.0);

    for metric in names::SYSTEM.iter().chain(names::BUSINESS.iter()) {
        assert_eq!(h.metrics.sample_count(metric).await, 1, "{}", metric);
    }
    assert!(matches!(observer.try_next(), Some(LiveEvent::Metrics(_))));
    assert!(observer.try_next().is_none());
}

struct FailingTransactionStore;

#[async_trait]
impl TransactionStore for FailingTransactionStore {
    async fn count_by_status(&self, _status: TransactionStatus, _window: TimeWindow) -> Result<u64> {
        Err(MonitorError::store("payments database unavailable"))
    }

    async fn count_total(&self, _window: TimeWindow) -> Result<u64> {
        Err(MonitorError::store("payments database unavailable"))
    }

    async fn refund_rate(&self, _window: TimeWindow) -> Result<f64> {
        Err(MonitorError::store("payments database unavailable"))
    }

    async fn sum_amount(&self, _status: Option<TransactionStatus>, _window: TimeWindow) -> Result<f64> {
        Err(MonitorError::store("payments database unavailable"))
    }
}

#[tokio::test]
async fn test_failed_collection_writes_nothing() {
    let h = harness();
    let mut observer = h.hub.subscribe();
    let collector = collector(&h, Arc::new(FailingTransactionStore));

    assert!(collector.run_cycle().await.is_err());
    assert_eq!(h.metrics.sample_count(names::CPU).await, 0);
    assert!(observer.try_next().is_none());

    let stats = collector.stats().await;
    assert_eq!(stats.failed_collections, 1);
    assert!(stats.last_error.is_some());
}

#[tokio::test]
async fn test_historical_metrics_regroups_cycles() {
    let h = harness();
    let collector = collector(&h, h.transactions.clone());
    collector.run_cycle().await.unwrap();
    collector.run_cycle().await.unwrap();

    let history = collector.get_historical_metrics(HistoryPeriod::Hour).await.unwrap();
    assert_eq!(history.system.len(), 2);
    assert_eq!(history.business.len(), 2);
    assert!(history.system[0].timestamp <= history.system[1].timestamp);
}

#[tokio::test]
async fn test_forecast_engine_raises_anomaly_alert() {
    let h = harness();
    h.dispatcher
        .create_channel(
            ChannelDefinition::new("team", ChannelKind::Chat)
                .with_secret(keys::WEBHOOK_URL, "https://chat.example.com/hooks/a"),
        )
        .await
        .unwrap();

    let now = Utc::now();
    let mut samples = Vec::new();
    for i in 0..40 {
        let value = if i % 2 == 0 { 0.40 } else { 0.42 };
        samples.push(MetricSample::new(names::CPU, value, now - ChronoDuration::minutes(200 - 5 * i)).unwrap());
    }
    samples.push(MetricSample::new(names::CPU, 0.98, now - ChronoDuration::minutes(1)).unwrap());
    h.metrics.write_batch(samples).await.unwrap();

    let engine = ForecastEngine::new(
        crate::config::ForecastSettings::default(),
        h.metrics.clone(),
        h.anomalies.clone(),
        h.engine.clone(),
    );
    let outcome = engine.predict_metric(names::CPU).await.unwrap();
    assert_eq!(outcome.predictions().len(), 12);
    let points = outcome.anomalies();
    assert!(!points.is_empty());
    assert_eq!(h.anomalies.len().await, points.len());

    let alerts = h
        .engine
        .get_alerts(&AlertFilter {
            alert_type: Some(AlertType::AnomalyDetected),
            ..AlertFilter::default()
        })
        .await
        .unwrap();
    // One alert per anomalous point
    assert_eq!(alerts.len(), points.len());
    assert!(alerts.iter().all(|a| a.details["metric"] == names::CPU));
    assert_eq!(h.transport.delivered_to(), vec!["team"; points.len()]);
}

#[tokio::test]
async fn test_predicted_anomaly_reaches_forecast_anomaly_rule() {
    let h = harness();
    let now = Utc::now();
    let samples = (0..=40)
        .map(|i| MetricSample::new(names::REQUEST_RATE, i as f64, now - ChronoDuration::minutes(200 - 5 * i)).unwrap())
        .collect();
    h.metrics.write_batch(samples).await.unwrap();

    let engine = ForecastEngine::new(
        crate::config::ForecastSettings::default(),
        h.metrics.clone(),
        h.anomalies.clone(),
        h.engine.clone(),
    );
    let outcome = engine.predict_metric(names::REQUEST_RATE).await.unwrap();
    let points = outcome.anomalies();
    assert!(!points.is_empty());
    assert!(points.iter().all(|p| p.predicted && p.timestamp > now));

    let rule = AlertRule::new("Ramp", ConditionKind::ForecastAnomaly, 1.0, 15, Severity::Medium)
        .with_channels([ChannelKind::Chat])
        .with_metric(names::REQUEST_RATE);
    let EvaluationOutcome::Triggered { observed, .. } = h.engine.evaluate_rule(&rule).await.outcome else {
        panic!("predicted anomalies should be visible to the rule");
    };
    assert_eq!(observed, points.len() as f64);
}

#[tokio::test]
async fn test_forecast_insufficient_data_is_not_an_error() {
    let h = harness();
    h.metrics
        .write(MetricSample::new(names::MEMORY, 0.5, Utc::now()).unwrap())
        .await
        .unwrap();
    let engine = ForecastEngine::new(
        crate::config::ForecastSettings::default(),
        h.metrics.clone(),
        h.anomalies.clone(),
        h.engine.clone(),
    );
    let outcome = engine.predict_metric(names::MEMORY).await.unwrap();
    assert!(outcome.is_insufficient());
    assert_eq!(engine.run_cycle().await.unwrap(), 0);
}

#[tokio::test]
async fn test_analyze_trends_on_ascending_series() {
    let h = harness();
    let now = Utc::now();
    let samples = (0..20)
        .map(|i| MetricSample::new(names::RESPONSE_TIME, 100.0 + 10.0 * i as f64, now - ChronoDuration::minutes(100 - 5 * i)).unwrap())
        .collect();
    h.metrics.write_batch(samples).await.unwrap();

    let engine = ForecastEngine::new(
        crate::config::ForecastSettings::default(),
        h.metrics.clone(),
        h.anomalies.clone(),
        h.engine.clone(),
    );
    let trend = engine.analyze_trends(names::RESPONSE_TIME).await.unwrap();
    assert_eq!(trend.direction, stats::TrendDirection::Up);
    assert!(trend.slope > 0.0);
    assert_eq!(trend.samples, 20);
    assert!(!trend.daily.detected);
}

fn service_with(probe: ResourceUsage, settings: NotificationSettings) -> (MonitoringService, Arc<RecordingTransport>, Stores) {
    let stores = Stores::in_memory();
    let hub = Arc::new(BroadcastHub::default());
    let transport = Arc::new(RecordingTransport::default());
    let mut config = MonitorConfig::default();
    config.notifications = settings.clone();

    let mut dispatcher = NotificationDispatcher::new(settings, stores.channels.clone(), cipher(), hub.clone()).unwrap();
    for kind in [ChannelKind::Email, ChannelKind::Chat, ChannelKind::Webhook, ChannelKind::Sms] {
        dispatcher = dispatcher.with_transport(kind, transport.clone());
    }

    let service = MonitoringService::with_parts(
        config,
        stores.clone(),
        ServiceParts {
            hub: Some(hub),
            probe: Some(Arc::new(FixedProbe(probe))),
            dispatcher: Some(Arc::new(dispatcher)),
            ..ServiceParts::default()
        },
    )
    .unwrap();
    (service, transport, stores)
}

#[tokio::test]
async fn test_performance_analysis_is_persisted_and_alerts_when_degraded() {
    let settings = NotificationSettings {
        admin_emails: vec!["oncall@example.com".to_string()],
        admin_email_relay_url: Some("https://relay.example.com/send".to_string()),
        ..NotificationSettings::default()
    };
    let (service, transport, _stores) = service_with(
        ResourceUsage {
            cpu_percent: 99.0,
            memory_percent: 97.0,
            disk_percent: 96.0,
            network_percent: 10.0,
        },
        settings,
    );

    let analysis = service.analyze_performance().await.unwrap();
    assert!(analysis.score < 50.0);
    assert_eq!(analysis.status, performance::HealthStatus::Critical);
    assert_eq!(analysis.bottlenecks.len(), 3);

    let history = service
        .get_historical_performance(TimeWindow::trailing_minutes(Utc::now(), 5))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    let alerts = service.get_alerts(&AlertFilter::default()).await.unwrap();
    assert_eq!(alerts[0].alert_type, AlertType::PerformanceDegraded);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(transport.delivered_to(), vec!["admin-escalation"]);
}

#[tokio::test]
async fn test_healthy_performance_does_not_alert() {
    let (service, transport, _stores) = service_with(ResourceUsage::default(), NotificationSettings::default());
    let analysis = service.analyze_performance().await.unwrap();
    assert_eq!(analysis.score, 100.0);
    assert!(service.get_alerts(&AlertFilter::default()).await.unwrap().is_empty());
    assert!(transport.delivered_to().is_empty());
}

#[tokio::test]
async fn test_service_start_stop_and_health() {
    let (service, _transport, _stores) = service_with(ResourceUsage::default(), NotificationSettings::default());
    service.start().await.unwrap();
    assert!(service.is_running().await);
    assert!(service.start().await.is_err());

    // Every loop ticks immediately on start
    tokio::time::sleep(Duration::from_millis(200)).await;
    service.stop().await.unwrap();
    assert!(!service.is_running().await);

    let health = service.health().await;
    assert!(!health.running);
    assert_eq!(health.loops.len(), 4);
    assert!(health.loops[&LoopKind::Collector].cycles >= 1);
    assert!(health.overall_healthy);
    assert!(health.collector.successful_collections >= 1);
}
