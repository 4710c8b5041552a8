//! Conductor-wide shared state, built once at startup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tandemconf::TandemConfig;
use tandemproto::{Clock, RetryPolicies};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::link::NodeEvent;
use crate::registry::Registry;

/// Capacity of the link -> coordinator event channel.
const EVENT_QUEUE: usize = 1024;

/// Process-wide message id counter. Every id handed out is unique for the
/// life of the conductor, so an ack can only ever match one command.
#[derive(Debug)]
pub struct CommandIds(AtomicU64);

impl CommandIds {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for CommandIds {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConductorContext {
    pub config: TandemConfig,
    pub clock: Arc<dyn Clock>,
    pub registry: Registry,
    pub ids: Arc<CommandIds>,
    pub policies: RetryPolicies,
    /// Link tasks report here; the coordinator owns the receiver.
    pub events: mpsc::Sender<NodeEvent>,
    pub shutdown: CancellationToken,
}

impl ConductorContext {
    pub fn new(
        config: TandemConfig,
        clock: Arc<dyn Clock>,
    ) -> (Arc<Self>, mpsc::Receiver<NodeEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let policies = RetryPolicies::from_config(&config.retry, &config.transfer);
        let ctx = Arc::new(Self {
            config,
            clock,
            registry: Registry::new(),
            ids: Arc::new(CommandIds::new()),
            policies,
            events,
            shutdown: CancellationToken::new(),
        });
        (ctx, events_rx)
    }

    pub fn master_now(&self) -> i64 {
        self.clock.now_ns()
    }
}

impl std::fmt::Debug for ConductorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConductorContext")
            .field("listen", &self.config.bind.listen)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
