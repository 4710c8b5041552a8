//! conductor - master daemon and operator CLI for a Tandem rig
//!
//! Subcommands:
//! - `conductor serve` - accept nodes and keep their clocks tracked
//! - `conductor record --nodes a,b --duration-secs N` - run one session
//! - `conductor config` - print the effective configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tandemconf::TandemConfig;
use tandemproto::{MonotonicClock, NodeId};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Clock sync and session coordination for Tandem sensor nodes")]
#[command(version)]
struct Cli {
    /// Config file, used instead of ./tandem.toml
    #[arg(short, long, global = true, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept node connections until interrupted
    Serve {
        /// Override bind.listen
        #[arg(long)]
        listen: Option<String>,

        /// Seconds between registry summaries in the log
        #[arg(long, default_value = "10")]
        report_secs: u64,
    },

    /// Arm, start, stop and archive one session, then print its manifest
    Record {
        /// Participating node ids
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,

        /// Recording length
        #[arg(long, default_value = "10")]
        duration_secs: u64,

        /// How long to wait for the nodes to connect and sync
        #[arg(long, default_value = "30")]
        wait_secs: u64,

        /// Override bind.listen
        #[arg(long)]
        listen: Option<String>,
    },

    /// Print the effective configuration and where it came from
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = TandemConfig::load_with_sources_from(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Config => {
            for file in &sources.files {
                eprintln!("# loaded {}", file.display());
            }
            for var in &sources.env_overrides {
                eprintln!("# env {}", var);
            }
            print!("{}", config.to_toml());
            Ok(())
        }
        Commands::Serve {
            listen,
            report_secs,
        } => {
            if let Some(listen) = listen {
                config.bind.listen = listen;
            }
            conductor::telemetry::init(&config.telemetry)?;
            serve(config, Duration::from_secs(report_secs.max(1))).await
        }
        Commands::Record {
            nodes,
            duration_secs,
            wait_secs,
            listen,
        } => {
            if let Some(listen) = listen {
                config.bind.listen = listen;
            }
            conductor::telemetry::init(&config.telemetry)?;
            let nodes = nodes.into_iter().map(NodeId::new).collect();
            record(
                config,
                nodes,
                Duration::from_secs(duration_secs),
                Duration::from_secs(wait_secs),
            )
            .await
        }
    }
}

async fn serve(config: TandemConfig, report_every: Duration) -> Result<()> {
    let running = conductor::start(config, Arc::new(MonotonicClock::new())).await?;

    let mut report = tokio::time::interval(report_every);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                for snap in running.ctx.registry.snapshots().await {
                    let offset_us = snap.clock.as_ref().map(|c| c.estimate.offset_ns / 1_000);
                    let confidence_us = snap.clock.as_ref().map(|c| c.estimate.confidence_ns / 1_000);
                    info!(
                        node = %snap.id,
                        state = ?snap.state,
                        ?offset_us,
                        ?confidence_us,
                        degraded = snap.clock_degraded.is_some(),
                        "node"
                    );
                }
            }
        }
    }

    running.shutdown().await;
    Ok(())
}

async fn record(
    config: TandemConfig,
    nodes: Vec<NodeId>,
    duration: Duration,
    wait: Duration,
) -> Result<()> {
    let running = conductor::start(config, Arc::new(MonotonicClock::new())).await?;

    info!(nodes = ?nodes, "waiting for nodes to connect and sync");
    if let Err((node, reason)) = running.wait_until_schedulable(&nodes, wait).await {
        running.shutdown().await;
        anyhow::bail!("node {} not ready after {:?}: {}", node, wait, reason);
    }

    let result = run_session(&running, nodes, duration).await;
    if let Err(e) = &result {
        warn!("session failed: {:#}", e);
        if let Err(abort) = running.coordinator.abort(format!("{:#}", e)).await {
            warn!("abort after failure: {}", abort);
        }
    }
    running.shutdown().await;

    let manifest = result?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

async fn run_session(
    running: &conductor::RunningConductor,
    nodes: Vec<NodeId>,
    duration: Duration,
) -> Result<conductor::Manifest> {
    let coordinator = &running.coordinator;
    let session = coordinator.arm(nodes).await.context("arm failed")?;
    info!(%session, "armed");

    let plan = coordinator.start().await.context("start failed")?;
    info!(
        %session,
        t_start = plan.t_start_master,
        lead_ms = plan.lead_ns / 1_000_000,
        "start scheduled"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted, stopping early"),
        _ = tokio::time::sleep(duration) => {}
    }

    coordinator.stop().await.context("stop failed")
}
