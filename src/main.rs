//! Broker Link - Main Entry Point
//!
//! Runs one supervised broker connection for the configured queue and relays
//! a delivery confirmation for every message it handles.

use async_trait::async_trait;
use broker_link::config::LinkConfig;
use broker_link::observability::init_default_logging;
use broker_link::protocol::DeliveryConfirmation;
use broker_link::resilience::{
    ConnectionRegistry, JsonFileUsageStore, NetworkMonitor, NetworkState, RetryOutbox,
    UsageGovernor,
};
use broker_link::supervisor::ConnectionSupervisor;
use broker_link::transport::amqp::{BrokerConnection, LapinTransportFactory, MessageHandler};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const CONFIRMATION_BACKLOG: usize = 64;

/// Resilient device-to-broker link
#[derive(Parser)]
#[command(name = "broker-link")]
#[command(about = "Crash-resilient AMQP link with quota governance and a durable retry outbox")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BROKER_LINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and process messages until SIGINT/SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Print the configuration with credentials masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting broker-link v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_link(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<LinkConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(LinkConfig::load_from_file(path)?);
    }

    for candidate in ["broker-link.toml", "config/broker-link.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(LinkConfig::load_from_file(&path)?);
        }
    }

    Err("no configuration file found; pass -c/--config or create broker-link.toml".into())
}

/// Logs each message and queues a success confirmation keyed by its `id`
struct ConfirmingHandler {
    device_id: String,
    confirmations: mpsc::Sender<DeliveryConfirmation>,
}

#[async_trait]
impl MessageHandler for ConfirmingHandler {
    async fn handle(&self, message: &str) -> bool {
        info!(bytes = message.len(), "Message received");
        debug!(message, "Message body");

        let id = serde_json::from_str::<Value>(message)
            .ok()
            .and_then(|value| match value.get("id") {
                Some(Value::String(id)) => Some(id.clone()),
                Some(Value::Number(id)) => Some(id.to_string()),
                _ => None,
            });
        let Some(id) = id else {
            warn!("Message has no id field, nothing to confirm");
            return true;
        };

        let confirmation = DeliveryConfirmation::success(id, &self.device_id, "received");
        if self.confirmations.send(confirmation).await.is_err() {
            warn!("Confirmation relay stopped");
        }
        true
    }
}

async fn run_link(config: LinkConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(device_id = %config.device.id, queue = %config.broker.queue, "Building broker link");

    let settings = config.connection_settings()?;
    let registry = Arc::new(ConnectionRegistry::new());
    // A host process has no radio to report; treat it as wired
    let network = Arc::new(NetworkMonitor::new(NetworkState::wired()));
    let governor = Arc::new(UsageGovernor::new(
        config.usage_limits(),
        Arc::new(JsonFileUsageStore::new(&config.usage.state_file)),
    ));
    let outbox = Arc::new(RetryOutbox::open(&config.outbox.path).await?);

    let (connection, reconnects) = BrokerConnection::new(
        settings,
        registry,
        network.clone(),
        Arc::new(LapinTransportFactory),
    );

    let (confirmations_tx, mut confirmations_rx) = mpsc::channel(CONFIRMATION_BACKLOG);
    let handler = Arc::new(ConfirmingHandler {
        device_id: config.device.id.clone(),
        confirmations: confirmations_tx,
    });

    let supervisor = Arc::new(ConnectionSupervisor::new(
        connection,
        reconnects,
        handler,
        governor,
        outbox.clone(),
        network,
        config.supervisor_settings(),
    ));

    let relay = tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            while let Some(confirmation) = confirmations_rx.recv().await {
                match supervisor.send_confirmation(&confirmation).await {
                    Ok(true) => debug!(id = %confirmation.message_id, "Confirmation published"),
                    Ok(false) => info!(id = %confirmation.message_id, "Confirmation parked in retry outbox"),
                    Err(e) => warn!("Confirmation not sent: {}", e.sanitized()),
                }
            }
        }
    });

    supervisor.start().await;
    let run_loop = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.run().await }
    });

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Broker link running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }

    supervisor.shutdown().await;
    if let Err(e) = run_loop.await {
        error!("Supervisor loop ended abnormally: {}", e);
    }
    relay.abort();
    outbox.close().await;
    Ok(())
}

fn handle_config_command(
    config: &LinkConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!("Configuration validation complete");
    Ok(())
}
