//! Roomcast Control-Plane Node
//!
//! Runs one coordination instance: joins the cluster ring, reconciles room
//! topology, and binds consumers for the queues this instance owns. Ships
//! with the in-process store and broker backends; production deployments
//! plug their own [`roomcast::store::CoordinationStore`] and
//! [`roomcast::broker::BrokerAdmin`] implementations into
//! [`roomcast::WorkerNode`].

use clap::{Arg, Command};
use roomcast::broker::MemoryBroker;
use roomcast::store::MemoryStore;
use roomcast::{core::Config, Result, WorkerNode};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("roomcast")
        .version(roomcast::VERSION)
        .about("Cluster coordination for live-chat fan-out.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("instance-type")
                .long("instance-type")
                .value_name("TYPE")
                .help("Logical instance pool to join"),
        )
        .arg(
            Arg::new("key-prefix")
                .long("key-prefix")
                .value_name("PREFIX")
                .help("Coordination store key prefix"),
        )
        .arg(
            Arg::new("weight")
                .long("weight")
                .value_name("N")
                .help("Relative hash ring weight of this instance"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .get_matches();

    // Load configuration
    let mut config = if let Some(config_path) = matches.get_one::<String>("config") {
        Config::from_file(config_path)?
    } else {
        Config::load()?
    };

    // Apply CLI overrides
    apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;

    // Initialize logging from the resolved level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!("Starting roomcast v{}", roomcast::VERSION);
    roomcast::system::metrics::init_registry();

    // In-process backends; see the module docs for plugging in real ones
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new());

    let node = WorkerNode::new(&config, store, broker);
    node.start().await?;
    info!(instance_id = %node.instance_id(), "node running");

    // Wait for shutdown signal
    shutdown_signal().await;
    warn!("Received shutdown signal, leaving the cluster...");

    node.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &clap::ArgMatches) -> Result<()> {
    if let Some(instance_type) = matches.get_one::<String>("instance-type") {
        config.cluster.instance_type = instance_type.clone();
    }

    if let Some(prefix) = matches.get_one::<String>("key-prefix") {
        config.cluster.key_prefix = prefix.clone();
    }

    if let Some(weight) = matches.get_one::<String>("weight") {
        config.cluster.weight = weight
            .parse()
            .map_err(|e| roomcast::Error::config(format!("Invalid weight: {}", e)))?;
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    Ok(())
}

/// Block until Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!(error = %e, "Failed to install signal handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
