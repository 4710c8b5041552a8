//! Device registry.
//!
//! Tracks which nodes exist and hands out their [`NodeHandle`]s. The map lock
//! guards membership only; everything about a node's condition lives in the
//! snapshot its link task publishes over a `watch` channel.

use std::collections::HashMap;

use serde::Serialize;
use tandemconf::SyncConfig;
use tandemproto::{duration_ns, Nanos, NodeId, SensorKind};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::clock_sync::{ClockStatus, OffsetEstimate};
use crate::link::NodeHandle;

/// Node lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Handshake read, not yet registered.
    Discovered,
    /// Registered, handshake ack not yet sent.
    Handshaking,
    Ready,
    Armed,
    Recording,
    Stopping,
    Disconnected,
}

impl NodeState {
    pub fn is_live(&self) -> bool {
        !matches!(self, NodeState::Disconnected)
    }
}

/// Point-in-time view of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub capabilities: Vec<SensorKind>,
    pub state: NodeState,
    pub clock: Option<ClockStatus>,
    /// Set when the last sync round produced nothing usable.
    pub clock_degraded: Option<String>,
    pub connected_at: Nanos,
    pub violations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_reason: Option<String>,
}

/// Why a node cannot take part in a new session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnreadyReason {
    #[error("node is not registered")]
    Unknown,

    #[error("node is {0:?}, expected Ready")]
    NotReady(NodeState),

    #[error("no clock estimate yet")]
    NoEstimate,

    #[error("clock degraded: {0}")]
    ClockDegraded(String),

    #[error("clock estimate is {age_ms} ms old")]
    Stale { age_ms: i64 },

    #[error("clock confidence ±{confidence_us} µs exceeds ±{limit_us} µs")]
    LowConfidence { confidence_us: i64, limit_us: u64 },
}

impl NodeSnapshot {
    pub fn new(id: NodeId, capabilities: Vec<SensorKind>, connected_at: Nanos) -> Self {
        Self {
            id,
            capabilities,
            state: NodeState::Discovered,
            clock: None,
            clock_degraded: None,
            connected_at,
            violations: 0,
            disconnect_reason: None,
        }
    }

    /// The estimate to schedule with, if the node may be scheduled at all.
    pub fn schedulable(&self, now: Nanos, sync: &SyncConfig) -> Result<OffsetEstimate, UnreadyReason> {
        if self.state != NodeState::Ready {
            return Err(UnreadyReason::NotReady(self.state));
        }
        if let Some(reason) = &self.clock_degraded {
            return Err(UnreadyReason::ClockDegraded(reason.clone()));
        }
        let Some(clock) = &self.clock else {
            return Err(UnreadyReason::NoEstimate);
        };

        let age = now - clock.measured_at;
        if age > duration_ns(sync.staleness()) {
            return Err(UnreadyReason::Stale {
                age_ms: age / 1_000_000,
            });
        }

        let limit_ns = sync.max_confidence_us as i64 * 1_000;
        if clock.estimate.confidence_ns > limit_ns {
            return Err(UnreadyReason::LowConfidence {
                confidence_us: clock.estimate.confidence_ns / 1_000,
                limit_us: sync.max_confidence_us,
            });
        }

        Ok(clock.scheduling_estimate())
    }
}

/// Disconnected records kept for status queries once newer nodes register.
pub const KEEP_DISCONNECTED: usize = 64;

/// Ids of the disconnected nodes beyond the newest `keep`, oldest first.
fn expired_disconnected(snapshots: Vec<NodeSnapshot>, keep: usize) -> Vec<NodeId> {
    let mut gone: Vec<(Nanos, NodeId)> = snapshots
        .into_iter()
        .filter(|s| !s.state.is_live())
        .map(|s| (s.connected_at, s.id))
        .collect();
    if gone.len() <= keep {
        return Vec::new();
    }
    gone.sort();
    let excess = gone.len() - keep;
    gone.into_iter().take(excess).map(|(_, id)| id).collect()
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node {0} is already connected")]
    DuplicateLive(NodeId),
}

/// Live and recently disconnected nodes by id.
#[derive(Debug, Default)]
pub struct Registry {
    nodes: RwLock<HashMap<NodeId, NodeHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly handshaken node. A Disconnected record with the same
    /// id is replaced; a live one is not.
    pub async fn register(&self, handle: NodeHandle) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.get(handle.id()) {
            if existing.snapshot().state.is_live() {
                return Err(RegistryError::DuplicateLive(handle.id().clone()));
            }
            info!(node = %handle.id(), "replacing disconnected node record");
        } else {
            info!(node = %handle.id(), "node registered");
        }
        nodes.insert(handle.id().clone(), handle);

        let snapshots = nodes.values().map(|h| h.snapshot()).collect();
        for id in expired_disconnected(snapshots, KEEP_DISCONNECTED) {
            debug!(node = %id, "forgetting disconnected node");
            nodes.remove(&id);
        }
        Ok(())
    }

    pub async fn get(&self, id: &NodeId) -> Option<NodeHandle> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn snapshot(&self, id: &NodeId) -> Option<NodeSnapshot> {
        self.nodes.read().await.get(id).map(|h| h.snapshot())
    }

    /// Snapshots of every known node, sorted by id.
    pub async fn snapshots(&self) -> Vec<NodeSnapshot> {
        let mut all: Vec<NodeSnapshot> = self
            .nodes
            .read()
            .await
            .values()
            .map(|h| h.snapshot())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn live(&self) -> Vec<NodeHandle> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|h| h.snapshot().state.is_live())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}
