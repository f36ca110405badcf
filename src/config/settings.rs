use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::monitoring::notifications::ChannelKind;
use crate::utils::error::{MonitorError, Result};

/// Main configuration for the monitoring pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Loop intervals
    pub intervals: IntervalConfig,
    /// Metric collector settings
    pub collector: CollectorSettings,
    /// Forecasting and anomaly detection settings
    pub forecast: ForecastSettings,
    /// Performance analyzer settings
    pub performance: PerformanceSettings,
    /// Notification dispatch settings
    pub notifications: NotificationSettings,
    /// Secret handling settings
    pub security: SecuritySettings,
}

/// Fixed interval of each periodic loop, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub collector_secs: u64,
    pub rules_secs: u64,
    pub forecast_secs: u64,
    pub performance_secs: u64,
}

/// Metric collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Trailing window shared by every rate computed in a cycle
    pub trailing_window_minutes: u32,
    /// Window for business metrics (active users, transactions)
    pub business_window_hours: u32,
}

/// Forecast engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastSettings {
    /// Length of the training window
    pub training_hours: u32,
    /// Minimum samples for a non-degenerate mean/variance
    pub min_samples: usize,
    /// Spacing between emitted predictions
    pub step_minutes: u32,
    /// How far ahead predictions are emitted
    pub horizon_minutes: u32,
    /// |value - mean| / stddev above which a point is anomalous
    pub z_threshold: f64,
    /// Multiplier of stddev for the one-sided confidence bound
    pub confidence_z: f64,
    /// Level smoothing factor
    pub smoothing_alpha: f64,
    /// Trend smoothing factor
    pub smoothing_beta: f64,
    /// Relative change below which a trend is stable
    pub trend_dead_zone: f64,
    /// Window used for seasonality estimation
    pub seasonality_days: u32,
    /// Metrics forecast by the periodic loop
    pub metrics: Vec<String>,
    /// Anomaly events retained for forecast_anomaly rules
    pub anomaly_log_capacity: usize,
    /// Channels notified when an ANOMALY_DETECTED alert is raised
    pub anomaly_channels: Vec<ChannelKind>,
}

/// Two-level threshold for one resource
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdLevel {
    pub warning: f64,
    pub critical: f64,
}

/// Bottleneck threshold table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    /// CPU usage percentage
    pub cpu: ThresholdLevel,
    /// Memory usage percentage
    pub memory: ThresholdLevel,
    /// Disk usage percentage
    pub disk: ThresholdLevel,
    /// Network usage percentage of configured capacity
    pub network: ThresholdLevel,
    /// Average response time in milliseconds
    pub response_time_ms: ThresholdLevel,
    /// Error rate percentage
    pub error_rate: ThresholdLevel,
}

/// Performance analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    pub window_minutes: u32,
    pub thresholds: ThresholdTable,
    /// Score below which a critical alert is dispatched
    pub critical_score: f64,
    /// Score below which a warning alert is dispatched
    pub warning_score: f64,
    /// Network throughput treated as 100% usage
    pub network_capacity_bytes_per_sec: u64,
    /// Analyses considered by trend reporting
    pub trend_window_hours: u32,
    /// Channels notified when performance degrades
    pub alert_channels: Vec<ChannelKind>,
}

/// Notification dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Upper bound on a single channel delivery
    pub channel_timeout_secs: u64,
    /// Administrator distribution list, notified on every critical alert
    pub admin_emails: Vec<String>,
    /// HTTP mail relay used for the administrator distribution list
    pub admin_email_relay_url: Option<String>,
    /// Env var holding the relay API key
    pub admin_email_relay_key_env: String,
    /// Sender address for outgoing mail
    pub email_from: String,
    /// User agent for outgoing HTTP deliveries
    pub user_agent: String,
}

/// Secret handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Env var holding the base64 master key for channel secrets
    pub master_key_env: String,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            collector_secs: 60,
            rules_secs: 60,
            forecast_secs: 900,
            performance_secs: 300,
        }
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            trailing_window_minutes: 5,
            business_window_hours: 24,
        }
    }
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            training_hours: 24,
            min_samples: 2,
            step_minutes: 5,
            horizon_minutes: 60,
            z_threshold: 2.5,
            confidence_z: 1.96,
            smoothing_alpha: 0.3,
            smoothing_beta: 0.1,
            trend_dead_zone: 0.05,
            seasonality_days: 14,
            metrics: vec![
                "system.cpu".to_string(),
                "system.memory".to_string(),
                "system.error_rate".to_string(),
                "system.response_time".to_string(),
                "business.transactions".to_string(),
            ],
            anomaly_log_capacity: 1000,
            anomaly_channels: vec![ChannelKind::Chat, ChannelKind::Webhook],
        }
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            cpu: ThresholdLevel { warning: 70.0, critical: 90.0 },
            memory: ThresholdLevel { warning: 80.0, critical: 95.0 },
            disk: ThresholdLevel { warning: 85.0, critical: 95.0 },
            network: ThresholdLevel { warning: 70.0, critical: 90.0 },
            response_time_ms: ThresholdLevel { warning: 1000.0, critical: 3000.0 },
            error_rate: ThresholdLevel { warning: 1.0, critical: 5.0 },
        }
    }
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            window_minutes: 5,
            thresholds: ThresholdTable::default(),
            critical_score: 50.0,
            warning_score: 70.0,
            network_capacity_bytes_per_sec: 125_000_000,
            trend_window_hours: 24,
            alert_channels: vec![ChannelKind::Email, ChannelKind::Chat],
        }
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            channel_timeout_secs: 10,
            admin_emails: Vec::new(),
            admin_email_relay_url: None,
            admin_email_relay_key_env: "OPSWATCH_EMAIL_RELAY_KEY".to_string(),
            email_from: "alerts@opswatch.local".to_string(),
            user_agent: concat!("opswatch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            master_key_env: "OPSWATCH_MASTER_KEY".to_string(),
        }
    }
}

impl IntervalConfig {
    pub fn collector(&self) -> Duration {
        Duration::from_secs(self.collector_secs)
    }

    pub fn rules(&self) -> Duration {
        Duration::from_secs(self.rules_secs)
    }

    pub fn forecast(&self) -> Duration {
        Duration::from_secs(self.forecast_secs)
    }

    pub fn performance(&self) -> Duration {
        Duration::from_secs(self.performance_secs)
    }
}

impl NotificationSettings {
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.into())?;
        let config: MonitorConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: Into<PathBuf>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| MonitorError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.into(), content)?;
        Ok(())
    }

    /// Override selected fields from `OPSWATCH_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(emails) = std::env::var("OPSWATCH_ADMIN_EMAILS") {
            self.notifications.admin_emails = emails
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(relay) = std::env::var("OPSWATCH_EMAIL_RELAY_URL") {
            self.notifications.admin_email_relay_url = Some(relay);
        }
        if let Ok(timeout) = std::env::var("OPSWATCH_CHANNEL_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                self.notifications.channel_timeout_secs = secs;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("collector", self.intervals.collector_secs),
            ("rules", self.intervals.rules_secs),
            ("forecast", self.intervals.forecast_secs),
            ("performance", self.intervals.performance_secs),
        ];
        for (name, secs) in intervals {
            if secs == 0 {
                return Err(MonitorError::config(format!(
                    "{} interval must be greater than 0",
                    name
                )));
            }
        }

        if self.collector.trailing_window_minutes == 0 || self.collector.business_window_hours == 0 {
            return Err(MonitorError::config("collector windows must be greater than 0"));
        }

        let forecast = &self.forecast;
        if forecast.training_hours == 0 || forecast.step_minutes == 0 {
            return Err(MonitorError::config(
                "forecast training window and step must be greater than 0",
            ));
        }
        if forecast.horizon_minutes < forecast.step_minutes {
            return Err(MonitorError::config("forecast horizon must cover at least one step"));
        }
        if forecast.min_samples < 2 {
            return Err(MonitorError::config("forecast min_samples must be at least 2"));
        }
        if !forecast.z_threshold.is_finite() || forecast.z_threshold <= 0.0 {
            return Err(MonitorError::config("z_threshold must be a positive number"));
        }
        for (name, factor) in [
            ("smoothing_alpha", forecast.smoothing_alpha),
            ("smoothing_beta", forecast.smoothing_beta),
        ] {
            if !(factor > 0.0 && factor <= 1.0) {
                return Err(MonitorError::config(format!("{} must be in (0, 1]", name)));
            }
        }

        let table = &self.performance.thresholds;
        for (name, level) in [
            ("cpu", table.cpu),
            ("memory", table.memory),
            ("disk", table.disk),
            ("network", table.network),
            ("response_time_ms", table.response_time_ms),
            ("error_rate", table.error_rate),
        ] {
            if !level.warning.is_finite() || !level.critical.is_finite() {
                return Err(MonitorError::config(format!("{} thresholds must be finite", name)));
            }
            if level.warning >= level.critical {
                return Err(MonitorError::config(format!(
                    "{} warning threshold must be below critical",
                    name
                )));
            }
        }
        if self.performance.critical_score >= self.performance.warning_score {
            return Err(MonitorError::config("critical_score must be below warning_score"));
        }
        if self.performance.window_minutes == 0 {
            return Err(MonitorError::config("performance window must be greater than 0"));
        }

        if forecast.anomaly_log_capacity == 0 {
            return Err(MonitorError::config("anomaly_log_capacity must be greater than 0"));
        }

        if self.notifications.channel_timeout_secs == 0 {
            return Err(MonitorError::config("channel_timeout_secs must be greater than 0"));
        }

        Ok(())
    }
}
