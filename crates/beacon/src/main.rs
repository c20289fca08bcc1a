//! # Beacon - fleet config and liveness over etcd
//!
//! One binary, four modes. Each mode drives a single component against the
//! shared etcd cluster.
//!
//! ## Architecture
//! ```text
//! beacon config      → /config/<server>/<var>   (operator write)
//! beacon server      ← /config/<server>/        (ConfigMirror)
//! beacon serverbeat  → /running/<server>        (HeartbeatManager)
//! beacon serverwatch ← /running/                (LivenessObserver)
//! ```

use anyhow::Result;
use beacon_common::constants::DEFAULT_CONFIG_PATH;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod config;
mod heartbeat;
mod mirror;
mod observer;
mod store;

use config::AppConfig;
use store::EtcdClient;

/// Beacon - server config distribution and liveness tracking
#[derive(Parser, Debug)]
#[command(name = "beacon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// etcd endpoints, comma separated (overrides config)
    #[arg(long, env = "BEACON_PEERS", value_delimiter = ',')]
    peers: Option<Vec<String>>,

    /// etcd username (overrides config)
    #[arg(long, env = "BEACON_USER")]
    user: Option<String>,

    /// etcd password (overrides config)
    #[arg(long, env = "BEACON_PASS", hide_env_values = true)]
    pass: Option<String>,

    /// CA certificate bundle for the etcd endpoints (overrides config)
    #[arg(long, env = "BEACON_CACERT")]
    cacert: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set a config variable for a server
    Config {
        server: String,
        var: String,
        val: String,
    },
    /// Mirror a server's config and print every change
    Server { server: String },
    /// Heartbeat a server's liveness token
    Serverbeat {
        server: String,
        /// Seconds between beats (overrides config)
        #[arg(long)]
        rate: Option<u64>,
        /// Number of beats, 0 for unbounded (overrides config)
        #[arg(long)]
        count: Option<u64>,
        /// Token lease in seconds (overrides config)
        #[arg(long)]
        lease: Option<u64>,
    },
    /// Watch which servers are alive
    Serverwatch,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("📡 Starting Beacon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = AppConfig::load(&args.config, &args)?;
    info!("📋 Configuration loaded from {}", args.config);

    // Create shutdown broadcast channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("🛑 Shutdown signal received");
        let _ = signal_tx.send(());
    });

    let store = Arc::new(EtcdClient::connect(&config)?);
    info!(peers = ?config.peers, "✅ etcd client ready");

    match args.command {
        Command::Config { server, var, val } => {
            commands::set_config(store, &config, &server, &var, &val).await?;
        }
        Command::Server { server } => {
            commands::serve_config(store, &config, &server, shutdown_rx).await?;
        }
        Command::Serverbeat {
            server,
            rate,
            count,
            lease,
        } => {
            if let Some(rate) = rate {
                config.heartbeat.interval_secs = commands::positive_secs(rate, "--rate")?.as_secs();
            }
            if let Some(count) = count {
                config.heartbeat.count = count;
            }
            if let Some(lease) = lease {
                config.heartbeat.lease_ttl_secs =
                    Some(commands::positive_secs(lease, "--lease")?.as_secs());
            }
            commands::heartbeat(store, &config, &server, shutdown_rx).await?;
        }
        Command::Serverwatch => {
            commands::watch_fleet(store, &config, shutdown_rx).await?;
        }
    }

    drop(shutdown_tx);
    info!("👋 Beacon shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
