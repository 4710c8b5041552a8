//! Real conductor plus real node agents over loopback TCP.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sensornode::{AgentError, NodeAgent};
use tandemconf::TandemConfig;
use tandemproto::{MonotonicClock, Nanos, NodeId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vault::{FileSessionStorage, SessionStorage};

pub const MS: Nanos = 1_000_000;
pub const READY: Duration = Duration::from_secs(5);

pub fn conductor_config(archive: &Path) -> TandemConfig {
    let mut config = TandemConfig::default();
    config.bind.listen = "127.0.0.1:0".to_string();
    config.paths.archive_dir = archive.to_path_buf();
    config.sync.samples_per_round = 3;
    config.sync.exchange_timeout_ms = 150;
    config.sync.resync_interval_ms = 200;
    config.retry.command_timeout_ms = 300;
    config.retry.max_retries = 2;
    config.retry.backoff_base_ms = 10;
    config.retry.backoff_max_ms = 20;
    config.session.min_lead_ms = 150;
    config.session.confirm_timeout_ms = 1_000;
    config.session.stop_timeout_ms = 2_000;
    config.transfer.chunk_size = 4_096;
    config.transfer.chunk_timeout_ms = 500;
    config.transfer.release_after_verify = true;
    config
}

pub async fn start_conductor(archive: &Path) -> conductor::RunningConductor {
    conductor::start(conductor_config(archive), Arc::new(MonotonicClock::new()))
        .await
        .expect("conductor starts")
}

pub fn node_config(id: &str, conductor: SocketAddr, storage: &Path, capabilities: &[&str]) -> TandemConfig {
    let mut config = TandemConfig::default();
    config.bind.conductor = conductor.to_string();
    config.paths.storage_dir = storage.join(id);
    config.node.node_id = id.to_string();
    config.node.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
    config.node.sample_rate_hz = 200;
    config.node.preview_interval_ms = 50;
    config.node.status_interval_ms = 100;
    config.retry.reconnect_base_ms = 20;
    config.retry.reconnect_max_ms = 100;
    config.retry.reconnect_max_attempts = 100;
    config
}

pub struct RunningNode {
    pub id: NodeId,
    pub storage_dir: PathBuf,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<(), AgentError>>>,
}

impl RunningNode {
    pub async fn stop(mut self) -> Result<(), AgentError> {
        self.shutdown.cancel();
        match self.task.take() {
            Some(task) => task.await.expect("agent task"),
            None => Ok(()),
        }
    }
}

impl Drop for RunningNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn spawn_agent(agent: NodeAgent, storage_dir: PathBuf) -> RunningNode {
    let id = agent.node_id().clone();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(agent.run(shutdown.clone()));
    RunningNode {
        id,
        storage_dir,
        shutdown,
        task: Some(task),
    }
}

/// Agent with file storage and synthetic sources on a skewed clock.
pub fn spawn_node(config: TandemConfig, skew_ns: Nanos) -> RunningNode {
    let storage_dir = config.paths.storage_dir.clone();
    let agent = NodeAgent::from_config(config, Arc::new(MonotonicClock::with_skew(skew_ns)))
        .expect("agent builds");
    spawn_agent(agent, storage_dir)
}

/// Agent whose storage is `storage` instead of the default file storage.
pub fn spawn_node_with_storage(
    config: TandemConfig,
    skew_ns: Nanos,
    storage: Arc<dyn SessionStorage>,
) -> RunningNode {
    let storage_dir = config.paths.storage_dir.clone();
    let clock: Arc<dyn tandemproto::Clock> = Arc::new(MonotonicClock::with_skew(skew_ns));
    let sources = config
        .node
        .capabilities
        .iter()
        .map(|c| {
            Box::new(sensornode::SyntheticSource::new(
                c.parse().expect("known sensor kind"),
                Arc::clone(&clock),
                config.node.sample_rate_hz,
            )) as Box<dyn sensornode::SampleSource>
        })
        .collect();
    let agent = NodeAgent::new(config, clock, storage, sources).expect("agent builds");
    spawn_agent(agent, storage_dir)
}

pub fn file_storage(dir: &Path) -> FileSessionStorage {
    FileSessionStorage::new(dir).expect("storage dir")
}
