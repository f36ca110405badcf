//! # opswatch
//!
//! Operational monitoring and alerting pipeline. It samples system and
//! business metrics on a fixed interval and forecasts their near-term
//! values. It also flags statistical anomalies, evaluates configurable alert
//! rules, and fans notifications out to email, chat, webhook, SMS and live
//! observers with per-channel failure isolation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use opswatch::{MonitorConfig, MonitoringService, Stores};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     opswatch::init().await?;
//!
//!     let service = MonitoringService::new(MonitorConfig::default(), Stores::in_memory())?;
//!     service.start().await?;
//!
//!     let mut observer = service.subscribe();
//!     if let Some(event) = observer.next().await {
//!         println!("{}", serde_json::to_string(&event)?);
//!     }
//!
//!     service.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod monitoring;
pub mod security;
pub mod store;
pub mod utils;

// Re-export main types for convenience
pub use config::MonitorConfig;
pub use monitoring::{MonitoringService, ServiceHealth, ServiceParts, Stores};
pub use utils::error::{MonitorError, Result};

pub use monitoring::alerts::{Alert, AlertFilter, AlertRule, AlertType, ConditionKind, Severity};
pub use monitoring::broadcast::{BroadcastHub, LiveBroadcast, LiveEvent};
pub use monitoring::notifications::{
    ChannelDefinition, ChannelKind, ChannelRecord, ChannelTransport, DispatchReport, Notification,
    NotificationDispatcher,
};
pub use security::SecretCipher;

/// Initialize the pipeline with default logging
pub async fn init() -> Result<()> {
    utils::logging::init_logging()?;
    Ok(())
}

/// Initialize the pipeline with custom logging configuration
pub async fn init_with_logging(level: tracing::Level) -> Result<()> {
    utils::logging::init_logging_with_level(level)?;
    Ok(())
}
