pub mod settings;

pub use settings::{
    CollectorSettings, ForecastSettings, IntervalConfig, MonitorConfig, NotificationSettings,
    PerformanceSettings, SecuritySettings, ThresholdLevel, ThresholdTable,
};
