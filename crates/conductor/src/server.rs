//! Conductor process wiring: bind, accept node connections, run the
//! coordinator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tandemconf::TandemConfig;
use tandemproto::{Clock, NodeId};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vault::Archive;

use crate::aggregate::Aggregator;
use crate::context::ConductorContext;
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::link::serve_node;
use crate::registry::UnreadyReason;

const READY_POLL: Duration = Duration::from_millis(50);

/// A started conductor.
pub struct RunningConductor {
    pub local_addr: SocketAddr,
    pub ctx: Arc<ConductorContext>,
    pub coordinator: CoordinatorHandle,
    accept_task: JoinHandle<()>,
    coordinator_task: JoinHandle<()>,
}

/// Bind the listener and start the accept loop and coordinator.
pub async fn start(config: TandemConfig, clock: Arc<dyn Clock>) -> Result<RunningConductor> {
    config.validate().context("invalid configuration")?;

    let archive = Archive::new(&config.paths.archive_dir).with_context(|| {
        format!(
            "failed to open archive at {}",
            config.paths.archive_dir.display()
        )
    })?;

    let listener = TcpListener::bind(&config.bind.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.bind.listen))?;
    let local_addr = listener
        .local_addr()
        .context("listener has no local address")?;
    info!("conductor listening on {}", local_addr);

    let (ctx, events) = ConductorContext::new(config, clock);
    let aggregator = Aggregator::new(
        archive,
        ctx.config.transfer.clone(),
        ctx.policies.transfer.clone(),
    );
    let (coordinator, coordinator_task) = Coordinator::spawn(ctx.clone(), events, aggregator);
    let accept_task = tokio::spawn(accept_loop(ctx.clone(), listener));

    Ok(RunningConductor {
        local_addr,
        ctx,
        coordinator,
        accept_task,
        coordinator_task,
    })
}

async fn accept_loop(ctx: Arc<ConductorContext>, listener: TcpListener) {
    let shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_node(ctx, stream, peer).await {
                            warn!(%peer, "connection ended: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(READY_POLL).await;
                }
            },
        }
    }
    debug!("accept loop stopped");
}

impl RunningConductor {
    /// Wait until every node in `ids` could be armed right now.
    pub async fn wait_until_schedulable(
        &self,
        ids: &[NodeId],
        timeout: Duration,
    ) -> Result<(), (NodeId, UnreadyReason)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let blocker = self.first_unschedulable(ids).await;
            let Some(blocker) = blocker else {
                return Ok(());
            };
            if tokio::time::Instant::now() >= deadline {
                return Err(blocker);
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    async fn first_unschedulable(&self, ids: &[NodeId]) -> Option<(NodeId, UnreadyReason)> {
        let now = self.ctx.master_now();
        for id in ids {
            let reason = match self.ctx.registry.snapshot(id).await {
                None => Some(UnreadyReason::Unknown),
                Some(snap) => snap.schedulable(now, &self.ctx.config.sync).err(),
            };
            if let Some(reason) = reason {
                return Some((id.clone(), reason));
            }
        }
        None
    }

    /// Cancel everything and wait for the accept loop and coordinator.
    pub async fn shutdown(self) {
        info!("conductor shutting down");
        self.ctx.shutdown.cancel();
        let _ = self.accept_task.await;
        let _ = self.coordinator_task.await;
    }
}
