use clap::{Parser, Subcommand};
use opswatch::monitoring::alerts::{AlertRule, ConditionKind, Severity};
use opswatch::{ChannelKind, MonitorConfig, MonitoringService, SecretCipher, Stores};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "opswatch")]
#[command(about = "Operational monitoring, forecasting and alerting pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, env = "OPSWATCH_CONFIG")]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring loops until interrupted
    Run {
        /// Seed the in-memory rule store with a default rule set
        #[arg(long)]
        default_rules: bool,
    },

    /// Write a default configuration file
    Init {
        /// Output configuration file path
        #[arg(short, long, default_value = "opswatch.toml")]
        output: String,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig,

    /// Generate a base64 master key for channel secret encryption
    GenerateKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    if cli.json_logs {
        opswatch::utils::logging::init_json_logging(log_level)?;
    } else {
        opswatch::init_with_logging(log_level).await?;
    }

    match cli.command {
        Commands::Init { output } => {
            MonitorConfig::default().save_to_file(&output)?;
            println!("Wrote default configuration to {}", output);
        }
        Commands::GenerateKey => {
            println!("{}", SecretCipher::generate_key()?);
        }
        Commands::CheckConfig => {
            let config = load_config(cli.config.as_deref())?;
            println!("{}", toml::to_string_pretty(&config)?);
            println!("Configuration is valid");
        }
        Commands::Run { default_rules } => {
            let config = load_config(cli.config.as_deref())?;
            run(config, default_rules).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&str>) -> anyhow::Result<MonitorConfig> {
    let mut config = match path {
        Some(path) => MonitorConfig::from_file(path)?,
        None => MonitorConfig::default(),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn default_rule_set() -> Vec<AlertRule> {
    let channels = [ChannelKind::Email, ChannelKind::Chat];
    vec![
        AlertRule::new("High error volume", ConditionKind::ErrorRate, 50.0, 5, Severity::High)
            .with_channels(channels),
        AlertRule::new("Payment failures", ConditionKind::PaymentFailure, 10.0, 15, Severity::Critical)
            .with_channels(channels),
        AlertRule::new("Refund spike", ConditionKind::HighRefund, 20.0, 60, Severity::Medium)
            .with_channels(channels),
        AlertRule::new("Slow responses", ConditionKind::SystemLoad, 2000.0, 5, Severity::High)
            .with_channels(channels),
        AlertRule::new("Forecast anomaly", ConditionKind::ForecastAnomaly, 1.0, 15, Severity::Medium)
            .with_channels([ChannelKind::Chat]),
    ]
}

async fn run(config: MonitorConfig, default_rules: bool) -> anyhow::Result<()> {
    let service = MonitoringService::new(config, Stores::in_memory())?;

    if default_rules {
        for rule in default_rule_set() {
            service.create_rule(rule).await?;
        }
    }

    service.start().await?;
    info!("opswatch running, press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }

    service.stop().await?;
    let health = service.health().await;
    info!(
        uptime_secs = health.uptime_seconds,
        dispatches = health.dispatch.dispatches,
        "Shutdown complete"
    );
    Ok(())
}
