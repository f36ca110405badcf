// Notification Dispatcher
// Fans alert notifications out to configured channels and the live broadcast

pub mod format;
pub mod transports;

use super::alerts::Severity;
use super::broadcast::{LiveBroadcast, LiveEvent};
use crate::config::NotificationSettings;
use crate::security::SecretCipher;
use crate::store::ChannelConfigStore;
use crate::utils::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use transports::{ChatTransport, EmailTransport, SmsTransport, WebhookTransport};

/// Kind of delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Chat,
    Webhook,
    Sms,
    /// Live observers; always published, never delivered per record
    Broadcast,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Chat => "chat",
            ChannelKind::Webhook => "webhook",
            ChannelKind::Sms => "sms",
            ChannelKind::Broadcast => "broadcast",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Well-known settings and secret keys per channel kind
pub mod keys {
    /// Email: comma-separated recipient list
    pub const RECIPIENTS: &str = "recipients";
    /// Email: HTTP mail relay endpoint
    pub const RELAY_URL: &str = "relay_url";
    /// Webhook: target endpoint
    pub const URL: &str = "url";
    /// SMS: provider endpoint
    pub const API_URL: &str = "api_url";
    /// SMS: comma-separated phone numbers
    pub const TO: &str = "to";
    /// SMS: sender id
    pub const FROM: &str = "from";

    /// Chat: incoming-webhook URL (secret)
    pub const WEBHOOK_URL: &str = "webhook_url";
    /// Email relay / SMS provider key (secret)
    pub const API_KEY: &str = "api_key";
    /// Webhook bearer token (secret)
    pub const AUTH_TOKEN: &str = "auth_token";
}

/// Persisted channel configuration. Secrets are sealed with the channel id
/// as associated data and never appear in plaintext here.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: Uuid,
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub settings: BTreeMap<String, String>,
    pub sealed_secrets: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for ChannelRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("settings", &self.settings)
            .field("secrets", &self.sealed_secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Channel definition as supplied by an operator, secrets in plaintext
#[derive(Debug, Clone)]
pub struct ChannelDefinition {
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub settings: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, SecretString>,
}

impl ChannelDefinition {
    pub fn new<S: Into<String>>(name: S, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            settings: BTreeMap::new(),
            secrets: BTreeMap::new(),
        }
    }

    pub fn with_setting<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn with_secret<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.secrets.insert(key.into(), SecretString::new(value.into()));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check the keys each kind needs before anything is persisted
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MonitorError::config("channel name must not be empty"));
        }
        let require_setting = |key: &str| -> Result<()> {
            match self.settings.get(key) {
                Some(v) if !v.trim().is_empty() => Ok(()),
                _ => Err(MonitorError::config(format!(
                    "{} channel '{}' requires setting '{}'",
                    self.kind, self.name, key
                ))),
            }
        };
        let require_url = |key: &str| -> Result<()> {
            require_setting(key)?;
            let raw = self.settings.get(key).map(String::as_str).unwrap_or_default();
            url::Url::parse(raw)
                .map(|_| ())
                .map_err(|e| MonitorError::config(format!("invalid {} for '{}': {}", key, self.name, e)))
        };

        match self.kind {
            ChannelKind::Email => {
                require_setting(keys::RECIPIENTS)?;
                require_url(keys::RELAY_URL)
            }
            ChannelKind::Webhook => require_url(keys::URL),
            ChannelKind::Sms => {
                require_setting(keys::TO)?;
                require_url(keys::API_URL)
            }
            ChannelKind::Chat => {
                let secret = self.secrets.get(keys::WEBHOOK_URL).ok_or_else(|| {
                    MonitorError::config(format!(
                        "chat channel '{}' requires secret '{}'",
                        self.name,
                        keys::WEBHOOK_URL
                    ))
                })?;
                url::Url::parse(secret.expose_secret()).map(|_| ()).map_err(|_| {
                    MonitorError::config(format!("invalid webhook_url for '{}'", self.name))
                })
            }
            ChannelKind::Broadcast => Ok(()),
        }
    }
}

/// Channel with its secrets decrypted for a single delivery
#[derive(Debug, Clone)]
pub struct ResolvedChannel {
    pub id: Option<Uuid>,
    pub name: String,
    pub kind: ChannelKind,
    pub settings: BTreeMap<String, String>,
    pub secrets: HashMap<String, SecretString>,
}

impl ResolvedChannel {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    pub fn secret(&self, key: &str) -> Option<&SecretString> {
        self.secrets.get(key)
    }

    /// Setting value or a delivery error naming the missing key
    pub fn require_setting(&self, key: &str) -> Result<&str> {
        self.setting(key).ok_or_else(|| {
            MonitorError::channel_delivery(self.name.clone(), format!("missing setting '{}'", key))
        })
    }

    pub fn require_secret(&self, key: &str) -> Result<&SecretString> {
        self.secret(key).ok_or_else(|| {
            MonitorError::channel_delivery(self.name.clone(), format!("missing secret '{}'", key))
        })
    }

    /// Split a comma-separated list setting
    pub fn list_setting(&self, key: &str) -> Vec<String> {
        self.setting(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Payload handed to channels and observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub alert_id: Option<Uuid>,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new<T: Into<String>, M: Into<String>>(severity: Severity, title: T, message: M) -> Self {
        Self {
            alert_id: None,
            severity,
            title: title.into(),
            message: message.into(),
            data: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Delivery mechanism for one channel kind
#[async_trait::async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn deliver(&self, channel: &ResolvedChannel, notification: &Notification) -> Result<()>;
}

/// Outcome of one channel delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed { error: String },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    /// `None` for the administrator escalation list
    pub channel_id: Option<Uuid>,
    pub channel_name: String,
    pub kind: ChannelKind,
    pub status: DeliveryStatus,
    pub duration_ms: u64,
}

impl ChannelOutcome {
    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}

/// Per-dispatch result across every target channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub alert_id: Option<Uuid>,
    pub outcomes: Vec<ChannelOutcome>,
    /// Live observers that received the notification
    pub observers: usize,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_delivered()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChannelOutcome> {
        self.outcomes.iter().filter(|o| !o.is_delivered())
    }

    pub fn outcome_for(&self, channel_id: Uuid) -> Option<&ChannelOutcome> {
        self.outcomes.iter().find(|o| o.channel_id == Some(channel_id))
    }
}

/// Dispatcher statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchStats {
    pub dispatches: u64,
    pub deliveries: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub escalations: u64,
    pub last_dispatch: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Routes notifications to every enabled channel of the requested kinds,
/// concurrently and independently
pub struct NotificationDispatcher {
    settings: NotificationSettings,
    store: Arc<dyn ChannelConfigStore>,
    cipher: Arc<SecretCipher>,
    live: Arc<dyn LiveBroadcast>,
    transports: HashMap<ChannelKind, Arc<dyn ChannelTransport>>,
    channels: RwLock<Vec<ChannelRecord>>,
    admin_relay_key: Option<SecretString>,
    stats: RwLock<DispatchStats>,
}

impl NotificationDispatcher {
    /// Create a dispatcher with the default HTTP transports
    pub fn new(
        settings: NotificationSettings,
        store: Arc<dyn ChannelConfigStore>,
        cipher: Arc<SecretCipher>,
        live: Arc<dyn LiveBroadcast>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.channel_timeout())
            .user_agent(settings.user_agent.clone())
            .build()?;

        let mut transports: HashMap<ChannelKind, Arc<dyn ChannelTransport>> = HashMap::new();
        transports.insert(
            ChannelKind::Email,
            Arc::new(EmailTransport::new(client.clone(), settings.email_from.clone())),
        );
        transports.insert(ChannelKind::Chat, Arc::new(ChatTransport::new(client.clone())));
        transports.insert(ChannelKind::Webhook, Arc::new(WebhookTransport::new(client.clone())));
        transports.insert(ChannelKind::Sms, Arc::new(SmsTransport::new(client)));

        let admin_relay_key = std::env::var(&settings.admin_email_relay_key_env)
            .ok()
            .map(SecretString::new);

        Ok(Self {
            settings,
            store,
            cipher,
            live,
            transports,
            channels: RwLock::new(Vec::new()),
            admin_relay_key,
            stats: RwLock::new(DispatchStats::default()),
        })
    }

    /// Replace the transport used for one channel kind
    pub fn with_transport(mut self, kind: ChannelKind, transport: Arc<dyn ChannelTransport>) -> Self {
        self.transports.insert(kind, transport);
        self
    }

    /// Refresh the cached channel list from the store
    pub async fn reload_channels(&self) -> Result<usize> {
        let records = self.store.list_enabled().await?;
        let count = records.len();
        *self.channels.write().await = records;
        info!(channels = count, "Reloaded notification channels");
        Ok(count)
    }

    pub async fn list_channels(&self) -> Result<Vec<ChannelRecord>> {
        self.store.list().await
    }

    /// Validate, seal secrets and persist a new channel
    pub async fn create_channel(&self, definition: ChannelDefinition) -> Result<ChannelRecord> {
        definition.validate()?;
        let now = Utc::now();
        let id = Uuid::new_v4();
        let record = ChannelRecord {
            id,
            name: definition.name.clone(),
            kind: definition.kind,
            enabled: definition.enabled,
            settings: definition.settings.clone(),
            sealed_secrets: self.seal_secrets(id, &definition.secrets)?,
            created_at: now,
            updated_at: now,
        };
        self.store.upsert(record.clone()).await?;
        self.reload_channels().await?;
        info!(channel_id = %id, kind = %record.kind, "Created notification channel");
        Ok(record)
    }

    /// Replace a channel's definition; secrets are re-sealed
    pub async fn update_channel(&self, id: Uuid, definition: ChannelDefinition) -> Result<ChannelRecord> {
        definition.validate()?;
        let existing = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| MonitorError::not_found("channel".to_string(), id.to_string()))?;
        let record = ChannelRecord {
            id,
            name: definition.name.clone(),
            kind: definition.kind,
            enabled: definition.enabled,
            settings: definition.settings.clone(),
            sealed_secrets: self.seal_secrets(id, &definition.secrets)?,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };
        self.store.upsert(record.clone()).await?;
        self.reload_channels().await?;
        info!(channel_id = %id, "Updated notification channel");
        Ok(record)
    }

    pub async fn set_channel_enabled(&self, id: Uuid, enabled: bool) -> Result<ChannelRecord> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| MonitorError::not_found("channel".to_string(), id.to_string()))?;
        record.enabled = enabled;
        record.updated_at = Utc::now();
        self.store.upsert(record.clone()).await?;
        self.reload_channels().await?;
        Ok(record)
    }

    pub async fn delete_channel(&self, id: Uuid) -> Result<()> {
        if !self.store.delete(id).await? {
            return Err(MonitorError::not_found("channel".to_string(), id.to_string()));
        }
        self.reload_channels().await?;
        info!(channel_id = %id, "Deleted notification channel");
        Ok(())
    }

    fn seal_secrets(
        &self,
        id: Uuid,
        secrets: &BTreeMap<String, SecretString>,
    ) -> Result<BTreeMap<String, String>> {
        let context = id.to_string();
        secrets
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.cipher.seal(value.expose_secret(), &context)?)))
            .collect()
    }

    /// Decrypt a record's secrets for one delivery
    pub fn resolve_channel(&self, record: &ChannelRecord) -> Result<ResolvedChannel> {
        let context = record.id.to_string();
        let secrets = record
            .sealed_secrets
            .iter()
            .map(|(key, sealed)| Ok((key.clone(), self.cipher.open(sealed, &context)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(ResolvedChannel {
            id: Some(record.id),
            name: record.name.clone(),
            kind: record.kind,
            settings: record.settings.clone(),
            secrets,
        })
    }

    /// Administrator distribution list as an email target
    fn admin_escalation(&self) -> Option<Result<ResolvedChannel>> {
        if self.settings.admin_emails.is_empty() {
            return None;
        }
        let Some(relay_url) = &self.settings.admin_email_relay_url else {
            return Some(Err(MonitorError::config("no admin_email_relay_url configured")));
        };
        let mut settings = BTreeMap::new();
        settings.insert(keys::RECIPIENTS.to_string(), self.settings.admin_emails.join(","));
        settings.insert(keys::RELAY_URL.to_string(), relay_url.clone());
        let mut secrets = HashMap::new();
        if let Some(key) = &self.admin_relay_key {
            secrets.insert(keys::API_KEY.to_string(), key.clone());
        }
        Some(Ok(ResolvedChannel {
            id: None,
            name: "admin-escalation".to_string(),
            kind: ChannelKind::Email,
            settings,
            secrets,
        }))
    }

    /// Publish to live observers and deliver to every enabled channel whose
    /// kind is in `kinds`. Critical notifications also go to the admin list.
    /// A failing channel never blocks or fails the others.
    pub async fn dispatch(&self, notification: Notification, kinds: &BTreeSet<ChannelKind>) -> DispatchReport {
        let observers = self.live.publish(LiveEvent::Alert(notification.clone()));

        let mut targets: Vec<(Option<Uuid>, String, ChannelKind, Result<ResolvedChannel>)> = self
            .channels
            .read()
            .await
            .iter()
            .filter(|r| r.enabled && r.kind != ChannelKind::Broadcast && kinds.contains(&r.kind))
            .map(|r| (Some(r.id), r.name.clone(), r.kind, self.resolve_channel(r)))
            .collect();

        let escalate = notification.severity == Severity::Critical;
        if escalate {
            if let Some(admin) = self.admin_escalation() {
                targets.push((None, "admin-escalation".to_string(), ChannelKind::Email, admin));
            }
        }

        let outcomes = self.deliver_all(Arc::new(notification.clone()), targets).await;

        {
            let mut stats = self.stats.write().await;
            stats.dispatches += 1;
            stats.last_dispatch = Some(Utc::now());
            if escalate && !self.settings.admin_emails.is_empty() {
                stats.escalations += 1;
            }
            for outcome in &outcomes {
                match &outcome.status {
                    DeliveryStatus::Delivered => stats.deliveries += 1,
                    DeliveryStatus::TimedOut => {
                        stats.timeouts += 1;
                        stats.failures += 1;
                    }
                    DeliveryStatus::Failed { error } => {
                        stats.failures += 1;
                        stats.last_error = Some(error.clone());
                    }
                }
            }
        }

        let report = DispatchReport {
            alert_id: notification.alert_id,
            outcomes,
            observers,
        };
        debug!(
            alert_id = ?report.alert_id,
            delivered = report.delivered(),
            targets = report.outcomes.len(),
            observers,
            "Dispatch complete"
        );
        report
    }

    async fn deliver_all(
        &self,
        notification: Arc<Notification>,
        targets: Vec<(Option<Uuid>, String, ChannelKind, Result<ResolvedChannel>)>,
    ) -> Vec<ChannelOutcome> {
        let timeout = self.settings.channel_timeout();
        let mut statuses: Vec<Option<(DeliveryStatus, u64)>> = vec![None; targets.len()];
        let mut meta = Vec::with_capacity(targets.len());
        let mut tasks = JoinSet::new();

        for (index, (channel_id, name, kind, resolved)) in targets.into_iter().enumerate() {
            meta.push((channel_id, name, kind));
            let channel = match resolved {
                Ok(channel) => channel,
                Err(e) => {
                    statuses[index] = Some((DeliveryStatus::Failed { error: e.to_string() }, 0));
                    continue;
                }
            };
            let Some(transport) = self.transports.get(&kind).cloned() else {
                statuses[index] = Some((
                    DeliveryStatus::Failed {
                        error: format!("no transport for {} channels", kind),
                    },
                    0,
                ));
                continue;
            };

            let notification = Arc::clone(&notification);
            tasks.spawn(async move {
                let started = Instant::now();
                let status =
                    match tokio::time::timeout(timeout, transport.deliver(&channel, &notification)).await {
                        Ok(Ok(())) => DeliveryStatus::Delivered,
                        Ok(Err(e)) => DeliveryStatus::Failed { error: e.to_string() },
                        Err(_) => DeliveryStatus::TimedOut,
                    };
                (index, status, started.elapsed().as_millis() as u64)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, status, elapsed)) => statuses[index] = Some((status, elapsed)),
                // Panicked tasks keep their slot empty and are reported below
                Err(e) => warn!(error = %e, "Delivery task aborted"),
            }
        }

        meta.into_iter()
            .zip(statuses)
            .map(|((channel_id, channel_name, kind), status)| {
                let (status, duration_ms) = status.unwrap_or((
                    DeliveryStatus::Failed {
                        error: "delivery task panicked".to_string(),
                    },
                    0,
                ));
                match &status {
                    DeliveryStatus::Delivered => {
                        debug!(channel_id = ?channel_id, channel = %channel_name, "Notification delivered")
                    }
                    DeliveryStatus::Failed { error } => error!(
                        channel_id = ?channel_id,
                        channel = %channel_name,
                        alert_id = ?notification.alert_id,
                        error = %error,
                        "Notification delivery failed"
                    ),
                    DeliveryStatus::TimedOut => error!(
                        channel_id = ?channel_id,
                        channel = %channel_name,
                        alert_id = ?notification.alert_id,
                        timeout_secs = timeout.as_secs(),
                        "Notification delivery timed out"
                    ),
                }
                ChannelOutcome {
                    channel_id,
                    channel_name,
                    kind,
                    status,
                    duration_ms,
                }
            })
            .collect()
    }

    /// Send a test notification through one stored channel
    pub async fn test_channel(&self, id: Uuid) -> Result<ChannelOutcome> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| MonitorError::not_found("channel".to_string(), id.to_string()))?;
        if record.kind == ChannelKind::Broadcast {
            return Err(MonitorError::config("broadcast channels cannot be tested directly"));
        }
        let notification = Notification::new(
            Severity::Low,
            "Test notification",
            format!("Test message for channel '{}'", record.name),
        );
        let target = (Some(record.id), record.name.clone(), record.kind, self.resolve_channel(&record));
        let mut outcomes = self.deliver_all(Arc::new(notification), vec![target]).await;
        outcomes
            .pop()
            .ok_or_else(|| MonitorError::channel_delivery(record.name, "no outcome".to_string()))
    }

    pub async fn stats(&self) -> DispatchStats {
        self.stats.read().await.clone()
    }

    pub async fn cached_channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
