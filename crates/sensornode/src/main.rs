//! sensornode - one Tandem sensor node
//!
//! Dials the conductor, keeps its clock answerable, and records the
//! configured sensor streams when a session starts.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use sensornode::NodeAgent;
use tandemconf::TandemConfig;
use tandemproto::MonotonicClock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sensornode")]
#[command(about = "Tandem sensor node agent")]
#[command(version)]
struct Cli {
    /// Config file, used instead of ./tandem.toml
    #[arg(short, long, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    /// Override node.node_id
    #[arg(long)]
    node_id: Option<String>,

    /// Override bind.conductor
    #[arg(long)]
    conductor: Option<String>,

    /// Override node.capabilities (comma separated)
    #[arg(long, value_delimiter = ',')]
    capabilities: Vec<String>,

    /// Override paths.storage_dir
    #[arg(long)]
    storage_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        TandemConfig::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(node_id) = cli.node_id {
        config.node.node_id = node_id;
    }
    if let Some(conductor) = cli.conductor {
        config.bind.conductor = conductor;
    }
    if !cli.capabilities.is_empty() {
        config.node.capabilities = cli.capabilities;
    }
    if let Some(storage_dir) = cli.storage_dir {
        config.paths.storage_dir = storage_dir;
    }

    init_tracing(&config.telemetry.log_level)?;

    let agent = NodeAgent::from_config(config, Arc::new(MonotonicClock::new()))
        .context("failed to set up node")?;
    info!(node = %agent.node_id(), "sensor node starting");

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            on_signal.cancel();
        }
    });

    agent.run(shutdown).await?;
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid telemetry.log_level {:?}", level))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
