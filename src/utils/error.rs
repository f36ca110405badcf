use thiserror::Error;

/// Result type alias for the monitoring pipeline
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Error types for the monitoring pipeline
#[derive(Error, Debug)]
pub enum MonitorError {
    /// A collector or engine cycle could not read its data source
    #[error("Transient collection failure: {source_name}: {message}")]
    TransientCollection { source_name: String, message: String },

    /// Not enough history for forecasting or anomaly detection
    #[error("Insufficient data for {metric}: {available} samples, {required} required")]
    InsufficientData {
        metric: String,
        available: usize,
        required: usize,
    },

    /// One rule's data source was unavailable
    #[error("Rule evaluation failed: {rule_name}: {message}")]
    RuleEvaluation { rule_name: String, message: String },

    /// One notification channel failed or timed out
    #[error("Channel delivery failed: {channel}: {message}")]
    ChannelDelivery { channel: String, message: String },

    /// Malformed rule, channel or service configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Resolution attempted on an alert that is already resolved
    #[error("Alert {alert_id} is already resolved")]
    AlreadyResolved { alert_id: String },

    /// Requested entity does not exist
    #[error("Not found: {entity} {id}")]
    NotFound { entity: String, id: String },

    /// External store errors
    #[error("Store error: {message}")]
    Store { message: String },

    /// Rejected metric samples (non-finite values, empty names)
    #[error("Invalid metric: {message}")]
    InvalidMetric { message: String },

    /// Secret encryption/decryption errors
    #[error("Encryption error: {message}")]
    Encryption { message: String },

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File system errors
    #[error("File system error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl MonitorError {
    /// Create a new transient collection error
    pub fn transient<S: Into<String>>(source_name: S, message: S) -> Self {
        Self::TransientCollection {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create a new rule evaluation error
    pub fn rule_evaluation<S: Into<String>>(rule_name: S, message: S) -> Self {
        Self::RuleEvaluation {
            rule_name: rule_name.into(),
            message: message.into(),
        }
    }

    /// Create a new channel delivery error
    pub fn channel_delivery<S: Into<String>>(channel: S, message: S) -> Self {
        Self::ChannelDelivery {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(entity: S, id: S) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a new store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a new invalid metric error
    pub fn invalid_metric<S: Into<String>>(message: S) -> Self {
        Self::InvalidMetric {
            message: message.into(),
        }
    }

    /// Create a new encryption error
    pub fn encryption<S: Into<String>>(message: S) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    /// Check if this error comes from a degraded data source or transport
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MonitorError::TransientCollection { .. }
                | MonitorError::Store { .. }
                | MonitorError::Http(_)
                | MonitorError::ChannelDelivery { .. }
        )
    }

    /// Check if this error is a rejected configuration
    pub fn is_config_error(&self) -> bool {
        matches!(self, MonitorError::Configuration { .. })
    }
}
