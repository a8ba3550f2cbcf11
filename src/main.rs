//! telemetry-agent: streams host metrics to a central collector
//!
//! Runs as a system service. Exits only when asked to stop, or after
//! installing a new binary, in which case the service supervisor starts
//! the new version.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use telemetry_agent::config::Config;
use telemetry_agent::connection::{ConnectionManager, ExitReason};
use telemetry_agent::metrics::SystemCollector;
use telemetry_agent::platform::{PlatformOps, ServiceRestarter};
use telemetry_agent::protocol::UpdateCommand;
use telemetry_agent::update::{
    ExecutableSwap, HttpReleaseSource, Recovery, Resolution, SelfUpdater, CURRENT_VERSION,
};

#[derive(Parser)]
#[command(name = "telemetry-agent")]
#[command(about = "Host metrics agent for a central telemetry collector")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "telemetry-agent.toml")]
    config: PathBuf,

    /// Collector URL (overrides config file)
    #[arg(long, env = "AGENT_SERVER_URL")]
    server_url: Option<String>,

    /// Server ID this host is registered under (overrides config file)
    #[arg(long, env = "AGENT_SERVER_ID")]
    server_id: Option<String>,

    /// Agent token (overrides config file)
    #[arg(long, env = "AGENT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Seconds between metrics reports (overrides config file)
    #[arg(long)]
    interval: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether a newer release exists, without installing it
    CheckUpdate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("telemetry_agent=info".parse()?);
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = Config::load(&cli.config)?;
    if !cli.config.exists() {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    // Apply CLI overrides
    if let Some(url) = cli.server_url {
        config.server.url = url;
    }
    if let Some(server_id) = cli.server_id {
        config.server.server_id = server_id;
    }
    if let Some(token) = cli.token {
        config.server.token = token;
    }
    if let Some(interval) = cli.interval {
        config.report.interval_secs = interval;
    }

    let platform = PlatformOps::detect();
    let executable = std::env::current_exe()?;

    let release_source = Arc::new(HttpReleaseSource::new(&config.update));
    let restarter = Arc::new(ServiceRestarter::new(platform, &config.update.service_name));
    let updater = Arc::new(
        SelfUpdater::new(
            executable.clone(),
            &config.update.binary_name,
            platform,
            release_source,
            restarter,
        )
        .with_restart_grace(Duration::from_millis(config.update.restart_grace_ms)),
    );

    if let Some(Commands::CheckUpdate) = cli.command {
        println!("Current version: {}", updater.current_version());
        match updater.resolve(&UpdateCommand::default()).await {
            Resolution::UpToDate { version } => println!("Up to date ({})", version),
            Resolution::Download { url, latest } => {
                match latest {
                    Some(tag) => println!("Update available: {}", tag),
                    None => println!("Latest release unknown, would install 'latest'"),
                }
                println!("Artifact: {}", url);
            }
        }
        return Ok(());
    }

    config.validate()?;

    info!(version = CURRENT_VERSION, platform = ?platform, "Starting telemetry-agent");
    info!(
        server_id = %config.server.server_id,
        interval_secs = config.report.interval_secs,
        "Reporting to {}",
        config.server.ws_url()
    );

    // Heal anything an interrupted update left next to the executable
    match ExecutableSwap::for_executable(&executable).recover() {
        Ok(Recovery::Clean) => {}
        Ok(Recovery::Cleaned) => info!("Removed leftover update files"),
        Ok(Recovery::Restored) => warn!("Restored executable from backup"),
        Err(e) => warn!(error = %e, "Update recovery failed"),
    }

    let collector = Arc::new(SystemCollector::new(CURRENT_VERSION));
    let manager = ConnectionManager::new(&config, CURRENT_VERSION, collector, updater);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    match manager.run(shutdown_rx).await {
        ExitReason::Restarting => info!("Exiting for restart into the new version"),
        ExitReason::ShutdownSignal => info!("telemetry-agent stopped"),
    }

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
