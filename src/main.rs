//! Packet Holder - transparent TCP relay that withholds and releases packets by rule

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use packetholder::{
    config::{CliOverrides, Config, ConfigManager},
    management::{AppState, ManagementServer},
    PacketHolder, ReleaseType, RelayState, ShutdownCoordinator, StartMode,
};

/// CLI arguments for Packet Holder
#[derive(Parser, Debug)]
#[command(name = "packetholder")]
#[command(about = "Packet Holder - TCP relay that withholds packets until a release condition is met")]
#[command(version)]
#[command(long_about = "
Packet Holder - TCP relay that withholds packets until a release condition is met

Sits between one client and one upstream server. Client packets matching a hold
rule are queued instead of forwarded, and released later when a matching
packet is seen from the client or the server, or when an operator flushes the
queue through the management API.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  PACKETHOLDER_BIND_ADDR       - Client-facing listen address (e.g., 127.0.0.1:16000)
  PACKETHOLDER_UPSTREAM_ADDR   - Upstream server address (e.g., 127.0.0.1:6000)
  PACKETHOLDER_RETRY_COUNT     - Upstream connect attempts
  PACKETHOLDER_RETRY_INTERVAL  - Pause between attempts (e.g., 3s)
  PACKETHOLDER_LOG_LEVEL       - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "packetholder.toml")]
    pub config: PathBuf,

    /// Client-facing listen address (overrides config file)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Upstream server address (overrides config file)
    #[arg(short, long)]
    pub upstream: Option<String>,

    /// Hold pattern for rule 0
    #[arg(long)]
    pub hold: Option<String>,

    /// Release type for rule 0 (none, from-server, from-client)
    #[arg(long, requires = "hold")]
    pub release_type: Option<ReleaseType>,

    /// Release pattern for rule 0
    #[arg(long, requires = "hold")]
    pub release_keyword: Option<String>,

    /// Hold keyword released only by a manual flush (repeatable)
    #[arg(short = 'k', long = "keyword")]
    pub keywords: Vec<String>,

    /// Only report held and released packets
    #[arg(long)]
    pub only_held: bool,

    /// Upstream connect attempts
    #[arg(long)]
    pub retry_count: Option<u32>,

    /// Pause between upstream connect attempts (e.g., 3s, 500ms)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub retry_interval: Option<Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,

    /// Do not serve the management API
    #[arg(long)]
    pub no_management: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            bind: self.bind.clone(),
            upstream: self.upstream.clone(),
            hold: self.hold.clone(),
            release_type: self.release_type,
            release_keyword: self.release_keyword.clone(),
            keywords: self.keywords.clone(),
            only_held: self.only_held,
            retry_count: self.retry_count,
            retry_interval: self.retry_interval,
            log_level: self.log_level.clone(),
            no_management: self.no_management,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = ConfigManager::load(&args.config)?;
    config.merge_with_cli_args(&args.overrides());
    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&config, args.verbose)?;

    info!("Starting Packet Holder v{}", env!("CARGO_PKG_VERSION"));
    if !args.config.exists() {
        info!(
            "Config file {} not found, using environment and defaults",
            args.config.display()
        );
    }

    if args.validate_config {
        info!("Configuration is valid");
        log_summary(&config);
        return Ok(());
    }
    log_summary(&config);

    let holder = PacketHolder::from_config(&config).context("Failed to build holding rules")?;
    let shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(10));

    let management_enabled = config.monitoring.management_api.enabled;
    let management_handle = if management_enabled {
        let state = AppState::new(
            holder.clone(),
            config.relay.bind_addr,
            config.relay.upstream_addr,
        );
        let server = ManagementServer::new(
            config.monitoring.management_api.bind_addr,
            state,
            config.monitoring.management_api.auth.clone(),
        );
        let shutdown_rx = shutdown_coordinator.subscribe();

        Some(tokio::spawn(async move {
            if let Err(e) = server.start(shutdown_rx).await {
                error!("Management API server error: {}", e);
            }
        }))
    } else {
        info!("Management API server disabled");
        None
    };

    holder
        .start(
            config.relay.bind_addr,
            config.relay.upstream_addr,
            StartMode::Background,
        )
        .await?;

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shut down");

    // Without the management API nobody can restart the relay, so the
    // process ends with the first run.
    let relay_finished = async {
        if management_enabled {
            std::future::pending::<()>().await;
        }
        let status = holder
            .wait_for_status(|status| status.state == RelayState::Idle)
            .await;
        match status.last_error {
            Some(e) => warn!("Relay ended with error: {}", e),
            None => info!("Relay session ended"),
        }
    };

    tokio::select! {
        result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
            }
        }
        _ = relay_finished => {
            shutdown_coordinator.trigger();
        }
    }

    info!("Initiating graceful shutdown...");
    if let Err(e) = shutdown_coordinator.shutdown_holder(&holder).await {
        error!("Error stopping relay: {}", e);
    }

    if let Some(handle) = management_handle {
        if let Err(e) = handle.await {
            error!("Management API task failed: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn log_summary(config: &Config) {
    info!("Configuration summary:");
    info!("  Listen address: {}", config.relay.bind_addr);
    info!("  Upstream address: {}", config.relay.upstream_addr);
    info!(
        "  Upstream retries: {} every {:?}",
        config.upstream.retry_count, config.upstream.retry_interval
    );
    for (index, rule) in config.rules.iter().enumerate() {
        info!(
            "  Rule {}: hold '{}' release {} '{}'{}",
            index,
            rule.hold_keyword,
            rule.release_type,
            rule.release_keyword,
            if rule.enabled { "" } else { " (disabled)" }
        );
    }
    if !config.keywords.is_empty() {
        info!("  Hold keywords: {}", config.keywords.join(", "));
    }
    info!(
        "  Packet output: {}",
        if config.relay.only_held_output {
            "held only"
        } else {
            "all"
        }
    );
    info!(
        "  Management API: {}",
        if config.monitoring.management_api.enabled {
            config.monitoring.management_api.bind_addr.to_string()
        } else {
            "disabled".to_string()
        }
    );
}

/// Initialize tracing/logging
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let log_level = if verbose {
        "debug"
    } else {
        config.monitoring.log_level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
