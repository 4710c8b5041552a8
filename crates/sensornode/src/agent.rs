//! The node side of the Tandem protocol.
//!
//! One [`NodeAgent`] per process. It dials the conductor, answers clock
//! sync requests immediately, executes commands at most once per command
//! id, and runs the capture bridges while a session is recording. A lost
//! link is redialed under the reconnect retry policy; capture already in
//! progress keeps going across reconnects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rtrb::Consumer;
use serde::Serialize;
use tandemconf::{TandemConfig, MAX_CHUNK_SIZE};
use tandemproto::{
    retry, AckStatus, BundleDescriptor, CaptureFault, Clock, EventKind, FrameCodec, FrameError,
    Handshake, Message, MessageKind, Nanos, NodeId, NodeStatus, PreviewFrame, PullChunk,
    PullRequest, RetryPolicy, SensorKind, SessionId, SessionParams, StartConfirmed, StartParams,
    Transient, Verb, PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vault::{FileSessionStorage, SessionStorage, StorageError};

use crate::bridge::{BridgeConfig, BridgeStats, CaptureBridge};
use crate::source::{Sample, SampleSource, SyntheticSource};

/// Pending preview events while the link is slow or down.
const EVENT_QUEUE: usize = 64;
/// The start timer sleeps until this close to the instant, then yields.
const SPIN_WINDOW: Duration = Duration::from_millis(2);

type NodeFramed = Framed<TcpStream, FrameCodec>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("conductor rejected handshake: {0}")]
    Rejected(String),

    #[error("connection closed by conductor")]
    Closed,

    #[error("invalid node configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("gave up reaching conductor: {0}")]
    GaveUp(String),
}

impl Transient for AgentError {
    fn is_transient(&self) -> bool {
        match self {
            AgentError::Connect(_)
            | AgentError::Handshake(_)
            | AgentError::Rejected(_)
            | AgentError::Closed => true,
            AgentError::Frame(e) => e.is_fatal(),
            AgentError::Config(_) | AgentError::Storage(_) | AgentError::GaveUp(_) => false,
        }
    }
}

/// Acks already sent, replayed verbatim when a command id is retried.
#[derive(Debug)]
struct AckCache {
    acks: HashMap<u64, Message>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl AckCache {
    fn new(capacity: usize) -> Self {
        Self {
            acks: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, command_id: u64) -> Option<&Message> {
        self.acks.get(&command_id)
    }

    fn insert(&mut self, command_id: u64, ack: Message) {
        if self.acks.insert(command_id, ack).is_none() {
            self.order.push_back(command_id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.acks.remove(&old);
            }
        }
    }
}

/// Status and params of an ack about to be sent.
struct Reply {
    status: AckStatus,
    params: serde_json::Value,
}

impl Reply {
    fn ok() -> Self {
        Self {
            status: AckStatus::Ok,
            params: serde_json::Value::Null,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::rejected(reason),
            params: serde_json::Value::Null,
        }
    }

    fn with<T: Serialize>(status: AckStatus, params: &T) -> Self {
        match serde_json::to_value(params) {
            Ok(params) => Self { status, params },
            Err(e) => Self::rejected(format!("failed to encode reply: {}", e)),
        }
    }
}

enum Internal {
    StartDue { session: SessionId, command_id: u64 },
}

struct Capture {
    session: SessionId,
    bridges: Vec<CaptureBridge>,
    stats: Vec<Arc<BridgeStats>>,
    /// Bridges that never started.
    start_faults: Vec<String>,
    reported: HashSet<String>,
    preview: CancellationToken,
}

enum Phase {
    Idle,
    Armed(SessionId),
    Scheduled {
        session: SessionId,
        command_id: u64,
        timer: CancellationToken,
    },
    Recording(Capture),
    Stopped {
        session: SessionId,
        status: AckStatus,
        bundle: BundleDescriptor,
    },
}

impl Phase {
    fn session(&self) -> Option<&SessionId> {
        match self {
            Phase::Idle => None,
            Phase::Armed(session)
            | Phase::Scheduled { session, .. }
            | Phase::Stopped { session, .. } => Some(session),
            Phase::Recording(capture) => Some(&capture.session),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Armed(_) => "armed",
            Phase::Scheduled { .. } => "scheduled",
            Phase::Recording(_) => "recording",
            Phase::Stopped { .. } => "stopped",
        }
    }
}

/// Everything needed to dial and handshake, detached from the agent.
struct Dialer {
    conductor: String,
    hello: Handshake,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    ids: Arc<AtomicU64>,
}

impl Dialer {
    async fn connect(&self) -> Result<NodeFramed, AgentError> {
        let stream = TcpStream::connect(&self.conductor)
            .await
            .map_err(AgentError::Connect)?;
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, FrameCodec::new());

        let hello = Message::handshake(self.ids.fetch_add(1, Ordering::Relaxed))
            .with_params(&self.hello)?
            .stamped(self.clock.now_ns());
        let hello_id = hello.id;
        framed.send(hello).await?;

        let reply = match tokio::time::timeout(self.timeout, framed.next()).await {
            Err(_) => return Err(AgentError::Handshake("timed out waiting for ack".into())),
            Ok(None) => return Err(AgentError::Closed),
            Ok(Some(frame)) => Message::decode(&frame?)?,
        };
        if reply.kind != MessageKind::Ack || reply.ack_id != Some(hello_id) {
            return Err(AgentError::Handshake(format!(
                "expected handshake ack, got {:?}",
                reply.kind
            )));
        }
        match reply.status {
            Some(AckStatus::Ok) => Ok(framed),
            Some(AckStatus::Rejected { reason }) => Err(AgentError::Rejected(reason)),
            other => Err(AgentError::Handshake(format!(
                "unexpected handshake status {:?}",
                other
            ))),
        }
    }
}

pub struct NodeAgent {
    config: TandemConfig,
    node_id: NodeId,
    capabilities: Vec<SensorKind>,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn SessionStorage>,
    /// Sources not currently owned by a bridge.
    pool: Vec<Box<dyn SampleSource>>,
    reconnect: RetryPolicy,
    ids: Arc<AtomicU64>,
    acks: AckCache,
    phase: Phase,
    events: mpsc::Sender<Message>,
    internal: mpsc::UnboundedSender<Internal>,
    channels: Option<(mpsc::Receiver<Message>, mpsc::UnboundedReceiver<Internal>)>,
}

impl std::fmt::Debug for NodeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAgent")
            .field("node_id", &self.node_id)
            .field("capabilities", &self.capabilities)
            .field("phase", &self.phase.name())
            .finish_non_exhaustive()
    }
}

impl NodeAgent {
    pub fn new(
        config: TandemConfig,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn SessionStorage>,
        sources: Vec<Box<dyn SampleSource>>,
    ) -> Result<Self, AgentError> {
        config
            .validate()
            .map_err(|e| AgentError::Config(e.to_string()))?;
        let node_id = config.node.node_id.trim().to_string();
        if node_id.is_empty() {
            return Err(AgentError::Config("node.node_id is empty".into()));
        }
        if sources.is_empty() {
            return Err(AgentError::Config("no sample sources".into()));
        }

        let mut capabilities: Vec<SensorKind> = Vec::new();
        for source in &sources {
            if !capabilities.contains(&source.kind()) {
                capabilities.push(source.kind());
            }
        }

        let reconnect =
            tandemproto::RetryPolicies::from_config(&config.retry, &config.transfer).reconnect;
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let acks = AckCache::new(config.link.ack_ledger_size);

        Ok(Self {
            node_id: NodeId::new(node_id),
            capabilities,
            clock,
            storage,
            pool: sources,
            reconnect,
            ids: Arc::new(AtomicU64::new(1)),
            acks,
            phase: Phase::Idle,
            events,
            internal,
            channels: Some((events_rx, internal_rx)),
            config,
        })
    }

    /// File-backed storage under `paths.storage_dir` and one synthetic
    /// source per configured capability.
    pub fn from_config(config: TandemConfig, clock: Arc<dyn Clock>) -> Result<Self, AgentError> {
        let storage = FileSessionStorage::new(&config.paths.storage_dir)?;
        let mut kinds: Vec<&str> = Vec::new();
        for name in &config.node.capabilities {
            if !kinds.contains(&name.as_str()) {
                kinds.push(name.as_str());
            }
        }
        let sources = kinds
            .into_iter()
            .map(|name| {
                let kind: SensorKind = name
                    .parse()
                    .map_err(|e: tandemproto::types::UnknownSensorKind| {
                        AgentError::Config(e.to_string())
                    })?;
                Ok(Box::new(SyntheticSource::new(
                    kind,
                    Arc::clone(&clock),
                    config.node.sample_rate_hz,
                )) as Box<dyn SampleSource>)
            })
            .collect::<Result<Vec<_>, AgentError>>()?;
        Self::new(config, clock, Arc::new(storage), sources)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Dial, serve, redial until `shutdown` or the reconnect policy runs out.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let Some((mut events_rx, mut internal_rx)) = self.channels.take() else {
            return Err(AgentError::Config("agent already ran".into()));
        };
        let policy = self.reconnect.clone();

        let dialer = Dialer {
            conductor: self.config.bind.conductor.clone(),
            hello: Handshake {
                node_id: self.node_id.clone(),
                capabilities: self.capabilities.clone(),
                protocol: PROTOCOL_VERSION.to_string(),
            },
            timeout: self.config.link.handshake_timeout(),
            clock: Arc::clone(&self.clock),
            ids: Arc::clone(&self.ids),
        };

        let result = loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                r = retry(&policy, "connect", |_| dialer.connect()) => r,
            };
            let mut framed = match connected {
                Ok(framed) => framed,
                Err(e) => break Err(AgentError::GaveUp(e.to_string())),
            };
            info!(node = %self.node_id, conductor = %self.config.bind.conductor, "connected");

            let served = self
                .serve(&mut framed, &mut events_rx, &mut internal_rx, &shutdown)
                .await;
            self.link_lost();
            match served {
                Ok(()) => break Ok(()),
                Err(e) => warn!(node = %self.node_id, "link lost: {}", e),
            }
        };

        if let Some(session) = self.phase.session().cloned() {
            info!(%session, "shutting down with session in progress");
        }
        let faults = self.end_capture().await;
        for fault in faults {
            warn!("capture fault at shutdown: {}", fault);
        }
        result
    }

    async fn serve(
        &mut self,
        framed: &mut NodeFramed,
        events: &mut mpsc::Receiver<Message>,
        internal: &mut mpsc::UnboundedReceiver<Internal>,
        shutdown: &CancellationToken,
    ) -> Result<(), AgentError> {
        let mut status_tick = tokio::time::interval(self.config.node.status_interval());
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return Ok(()),

                frame = framed.next() => {
                    // Stamp before anything else; this is t1 of a sync exchange.
                    let received = self.clock.now_ns();
                    let body = match frame {
                        None => return Err(AgentError::Closed),
                        Some(frame) => frame?,
                    };
                    if let Some(reply) = self.on_frame(&body, received).await {
                        framed.send(reply).await?;
                    }
                }

                Some(msg) = internal.recv() => {
                    for out in self.on_internal(msg).await {
                        framed.send(out).await?;
                    }
                }

                Some(event) = events.recv() => framed.send(event).await?,

                _ = status_tick.tick() => {
                    for out in self.status_events() {
                        framed.send(out).await?;
                    }
                }
            }
        }
    }

    async fn on_frame(&mut self, body: &[u8], received: Nanos) -> Option<Message> {
        let msg = match Message::decode(body) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("ignoring malformed message: {}", e);
                return None;
            }
        };
        match msg.kind {
            MessageKind::SyncReq => Some(Message::sync_resp(self.next_id(), msg.id, received)),
            MessageKind::Command => Some(self.on_command(msg).await),
            other => {
                debug!(kind = ?other, id = msg.id, "ignoring unexpected message");
                None
            }
        }
    }

    async fn on_command(&mut self, msg: Message) -> Message {
        if let Some(cached) = self.acks.get(msg.id) {
            debug!(id = msg.id, verb = ?msg.verb, "duplicate command, replaying ack");
            return cached.clone();
        }

        let reply = match msg.verb {
            Some(Verb::ArmSession) => self.arm(&msg).await,
            Some(Verb::StartRecording) => self.schedule_start(&msg),
            Some(Verb::StopRecording) => self.stop(&msg).await,
            Some(Verb::PullBundle) => self.pull(&msg).await,
            Some(Verb::ReleaseBundle) => self.release(&msg).await,
            Some(Verb::AbortSession) => self.abort(&msg).await,
            None => Reply::rejected("command without verb"),
        };
        if let AckStatus::Rejected { reason } = &reply.status {
            warn!(id = msg.id, verb = ?msg.verb, %reason, "command rejected");
        }

        let mut ack = Message::ack(self.next_id(), msg.id, reply.status).stamped(self.clock.now_ns());
        ack.params = reply.params;
        self.acks.insert(msg.id, ack.clone());
        ack
    }

    async fn arm(&mut self, msg: &Message) -> Reply {
        let params: SessionParams = match msg.params_as() {
            Ok(params) => params,
            Err(e) => return Reply::rejected(format!("bad arm params: {}", e)),
        };
        let session = params.session_id;

        match &self.phase {
            Phase::Armed(current) if *current == session => return Reply::ok(),
            Phase::Scheduled { session: current, .. } if *current == session => {
                return Reply::rejected(format!("session {} already scheduled", session));
            }
            Phase::Recording(capture) if capture.session == session => {
                return Reply::rejected(format!("session {} already recording", session));
            }
            _ => {}
        }

        // A new arm supersedes whatever the conductor left behind.
        if let Some(previous) = self.phase.session().cloned() {
            info!(%previous, next = %session, phase = self.phase.name(), "superseding session");
        }
        for fault in self.end_capture().await {
            warn!("capture fault while superseding: {}", fault);
        }

        let storage = Arc::clone(&self.storage);
        let opened = {
            let session = session.clone();
            tokio::task::spawn_blocking(move || storage.open_session(&session)).await
        };
        match opened {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Reply::rejected(format!("storage: {}", e)),
            Err(e) => return Reply::rejected(format!("storage task failed: {}", e)),
        }

        info!(%session, "armed");
        self.phase = Phase::Armed(session);
        Reply::ok()
    }

    fn schedule_start(&mut self, msg: &Message) -> Reply {
        let params: StartParams = match msg.params_as() {
            Ok(params) => params,
            Err(e) => return Reply::rejected(format!("bad start params: {}", e)),
        };
        let Some(t_scheduled) = msg.t_scheduled else {
            return Reply::rejected("start_recording without t_scheduled");
        };
        match &self.phase {
            Phase::Armed(current) if *current == params.session_id => {}
            other => {
                return Reply::rejected(format!(
                    "not armed for {} (phase {})",
                    params.session_id,
                    other.name()
                ));
            }
        }

        let timer = CancellationToken::new();
        let session = params.session_id;
        let command_id = msg.id;
        {
            let timer = timer.clone();
            let clock = Arc::clone(&self.clock);
            let internal = self.internal.clone();
            let session = session.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = wait_until(clock.as_ref(), t_scheduled) => {
                        let _ = internal.send(Internal::StartDue { session, command_id });
                    }
                }
            });
        }

        let lead_ms = (t_scheduled - self.clock.now_ns()) / 1_000_000;
        info!(%session, t_scheduled, lead_ms, "start scheduled");
        self.phase = Phase::Scheduled {
            session,
            command_id,
            timer,
        };
        Reply::ok()
    }

    async fn on_internal(&mut self, msg: Internal) -> Vec<Message> {
        match msg {
            Internal::StartDue {
                session,
                command_id,
            } => self.begin_capture(session, command_id),
        }
    }

    fn begin_capture(&mut self, session: SessionId, command_id: u64) -> Vec<Message> {
        match &self.phase {
            Phase::Scheduled {
                session: current,
                command_id: scheduled,
                ..
            } if *current == session && *scheduled == command_id => {}
            _ => {
                debug!(%session, command_id, "stale start timer ignored");
                return Vec::new();
            }
        }

        let observed = self.clock.now_ns();
        let config = BridgeConfig {
            archive_capacity: self.config.node.archive_queue_capacity,
            preview_capacity: self.config.node.preview_queue_capacity,
        };

        let mut out = Vec::new();
        let mut bridges = Vec::new();
        let mut start_faults = Vec::new();
        for source in std::mem::take(&mut self.pool) {
            let stream = source.stream().to_string();
            match CaptureBridge::start(source, session.clone(), Arc::clone(&self.storage), config) {
                Ok(bridge) => bridges.push(bridge),
                Err(e) => {
                    error!(%session, %stream, "capture failed to start: {}", e);
                    let detail = format!("{}: {}", stream, e);
                    out.extend(self.fault_event(&session, &stream, &e.to_string()));
                    start_faults.push(detail);
                }
            }
        }

        let mut previews: Vec<(String, Consumer<Sample>)> = Vec::new();
        for bridge in &mut bridges {
            if let Some(consumer) = bridge.take_preview() {
                previews.push((bridge.stream().to_string(), consumer));
            }
        }
        let preview = CancellationToken::new();
        tokio::spawn(preview_loop(
            previews,
            self.events.clone(),
            Arc::clone(&self.ids),
            self.config.node.preview_interval(),
            preview.clone(),
        ));

        let stats = bridges.iter().map(|b| b.stats()).collect();
        info!(%session, streams = bridges.len(), t_observed = observed, "recording");
        self.phase = Phase::Recording(Capture {
            session: session.clone(),
            bridges,
            stats,
            start_faults,
            reported: HashSet::new(),
            preview,
        });

        let confirmed = StartConfirmed {
            session_id: session,
            command_id,
            t_observed_local: observed,
        };
        match Message::event(self.next_id(), EventKind::StartConfirmed).with_params(&confirmed) {
            Ok(msg) => out.push(msg.stamped(observed)),
            Err(e) => error!("failed to encode start confirmation: {}", e),
        }
        out
    }

    async fn stop(&mut self, msg: &Message) -> Reply {
        let params: SessionParams = match msg.params_as() {
            Ok(params) => params,
            Err(e) => return Reply::rejected(format!("bad stop params: {}", e)),
        };
        let session = params.session_id;

        match &self.phase {
            Phase::Stopped {
                session: current,
                status,
                bundle,
            } if *current == session => return Reply::with(status.clone(), bundle),
            phase if phase.session() == Some(&session) => {}
            other => {
                return Reply::rejected(format!(
                    "no session {} (phase {})",
                    session,
                    other.name()
                ));
            }
        }

        let faults = self.end_capture().await;
        let storage = Arc::clone(&self.storage);
        let bundled = {
            let session = session.clone();
            let node = self.node_id.clone();
            tokio::task::spawn_blocking(move || storage.bundle(&session, &node)).await
        };

        let (status, bundle) = match bundled {
            Ok(Ok(mut bundle)) => {
                if faults.is_empty() {
                    (AckStatus::Ok, bundle)
                } else {
                    let detail = faults.join("; ");
                    bundle.storage_error = Some(detail.clone());
                    (AckStatus::degraded(detail), bundle)
                }
            }
            Ok(Err(e)) => self.empty_bundle(&session, e.to_string()),
            Err(e) => self.empty_bundle(&session, format!("bundle task failed: {}", e)),
        };

        info!(
            %session,
            files = bundle.files.len(),
            bytes = bundle.total_bytes(),
            status = ?status,
            "stopped"
        );
        self.phase = Phase::Stopped {
            session,
            status: status.clone(),
            bundle: bundle.clone(),
        };
        Reply::with(status, &bundle)
    }

    fn empty_bundle(&self, session: &SessionId, detail: String) -> (AckStatus, BundleDescriptor) {
        error!(%session, "bundling failed: {}", detail);
        let bundle = BundleDescriptor {
            session_id: session.clone(),
            node_id: self.node_id.clone(),
            files: Vec::new(),
            storage_error: Some(detail.clone()),
        };
        (AckStatus::degraded(detail), bundle)
    }

    async fn pull(&mut self, msg: &Message) -> Reply {
        let request: PullRequest = match msg.params_as() {
            Ok(request) => request,
            Err(e) => return Reply::rejected(format!("bad pull params: {}", e)),
        };
        let offset = request.offset;
        // Anything larger would not fit in one ack frame.
        let max_len = request.max_len.min(MAX_CHUNK_SIZE as u64);
        let storage = Arc::clone(&self.storage);
        let read = tokio::task::spawn_blocking(move || {
            storage.read_chunk(&request.session_id, &request.path, request.offset, max_len)
        })
        .await;

        match read {
            Ok(Ok((bytes, total))) => Reply::with(AckStatus::Ok, &PullChunk::new(offset, &bytes, total)),
            Ok(Err(e)) => Reply::rejected(e.to_string()),
            Err(e) => Reply::rejected(format!("read task failed: {}", e)),
        }
    }

    async fn release(&mut self, msg: &Message) -> Reply {
        let params: SessionParams = match msg.params_as() {
            Ok(params) => params,
            Err(e) => return Reply::rejected(format!("bad release params: {}", e)),
        };
        if matches!(self.phase, Phase::Recording(ref c) if c.session == params.session_id) {
            return Reply::rejected(format!("session {} is still recording", params.session_id));
        }

        let storage = Arc::clone(&self.storage);
        let released = {
            let session = params.session_id.clone();
            tokio::task::spawn_blocking(move || storage.release(&session)).await
        };
        match released {
            Ok(Ok(())) => {
                info!(session = %params.session_id, "bundle released");
                if self.phase.session() == Some(&params.session_id) {
                    self.phase = Phase::Idle;
                }
                Reply::ok()
            }
            Ok(Err(e)) => Reply::rejected(e.to_string()),
            Err(e) => Reply::rejected(format!("release task failed: {}", e)),
        }
    }

    async fn abort(&mut self, msg: &Message) -> Reply {
        let params: SessionParams = match msg.params_as() {
            Ok(params) => params,
            Err(e) => return Reply::rejected(format!("bad abort params: {}", e)),
        };
        if self.phase.session() != Some(&params.session_id) {
            debug!(session = %params.session_id, "abort for a session this node is not in");
            return Reply::ok();
        }

        info!(
            session = %params.session_id,
            reason = params.reason.as_deref().unwrap_or(""),
            phase = self.phase.name(),
            "session aborted"
        );
        for fault in self.end_capture().await {
            warn!("capture fault during abort: {}", fault);
        }
        self.phase = Phase::Idle;
        Reply::ok()
    }

    /// Cancel a pending start or stop the bridges. Local files stay. Returns
    /// capture faults; the phase is `Idle` afterwards unless nothing was
    /// running.
    async fn end_capture(&mut self) -> Vec<String> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Scheduled { timer, .. } => {
                timer.cancel();
                Vec::new()
            }
            Phase::Recording(capture) => {
                capture.preview.cancel();
                let mut faults = capture.start_faults;
                let bridges = capture.bridges;
                let stopped = tokio::task::spawn_blocking(move || {
                    bridges.into_iter().map(CaptureBridge::stop).collect::<Vec<_>>()
                })
                .await;

                match stopped {
                    Ok(reports) => {
                        for report in reports {
                            match report {
                                Ok(report) => {
                                    if let Some(fault) = report.fault {
                                        faults.push(format!("{}: {}", report.stream, fault));
                                    }
                                    if let Some(source) = report.source {
                                        self.pool.push(source);
                                    }
                                }
                                Err(e) => faults.push(e.to_string()),
                            }
                        }
                    }
                    Err(e) => faults.push(format!("capture shutdown failed: {}", e)),
                }
                faults
            }
            other => {
                self.phase = other;
                Vec::new()
            }
        }
    }

    /// A start that had not fired yet will never be confirmed; go back to
    /// armed so a later stop or abort still finds the session.
    fn link_lost(&mut self) {
        if let Phase::Scheduled { session, timer, .. } = &self.phase {
            warn!(%session, "link lost before start, cancelling scheduled start");
            timer.cancel();
            self.phase = Phase::Armed(session.clone());
        }
    }

    fn status_events(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        let mut status = NodeStatus {
            session_id: self.phase.session().cloned(),
            recording: false,
            samples_written: 0,
            archive_backlog: 0,
            archive_blocked: 0,
            preview_dropped: 0,
        };

        let mut faults = Vec::new();
        if let Phase::Recording(capture) = &mut self.phase {
            status.recording = true;
            for stats in &capture.stats {
                status.samples_written += stats.written.load(Ordering::Relaxed);
                status.archive_backlog += stats.backlog();
                status.archive_blocked += stats.archive_blocked.load(Ordering::Relaxed);
                status.preview_dropped += stats.preview_dropped.load(Ordering::Relaxed);
            }
            for bridge in &capture.bridges {
                if let Some(detail) = bridge.fault() {
                    if capture.reported.insert(bridge.stream().to_string()) {
                        faults.push((capture.session.clone(), bridge.stream().to_string(), detail));
                    }
                }
            }
        }
        for (session, stream, detail) in faults {
            out.extend(self.fault_event(&session, &stream, &detail));
        }

        match Message::event(self.next_id(), EventKind::Status).with_params(&status) {
            Ok(msg) => out.push(msg.stamped(self.clock.now_ns())),
            Err(e) => warn!("failed to encode status: {}", e),
        }
        out
    }

    fn fault_event(&self, session: &SessionId, stream: &str, detail: &str) -> Option<Message> {
        warn!(%session, %stream, %detail, "reporting capture fault");
        let fault = CaptureFault {
            session_id: session.clone(),
            stream: stream.to_string(),
            detail: detail.to_string(),
        };
        Message::event(self.next_id(), EventKind::CaptureFault)
            .with_params(&fault)
            .map(|msg| msg.stamped(self.clock.now_ns()))
            .ok()
    }
}

/// Sleep until `deadline` on `clock`, finishing with a short yield loop so
/// timer granularity does not add to the start skew.
async fn wait_until(clock: &dyn Clock, deadline: Nanos) {
    let coarse = clock.until(deadline).saturating_sub(SPIN_WINDOW);
    if !coarse.is_zero() {
        tokio::time::sleep(coarse).await;
    }
    while clock.now_ns() < deadline {
        tokio::task::yield_now().await;
    }
}

async fn preview_loop(
    mut previews: Vec<(String, Consumer<Sample>)>,
    events: mpsc::Sender<Message>,
    ids: Arc<AtomicU64>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        for (stream, consumer) in previews.iter_mut() {
            let mut latest = None;
            while let Ok(sample) = consumer.pop() {
                latest = Some(sample);
            }
            let Some(sample) = latest else {
                continue;
            };

            let frame = PreviewFrame::new(stream.as_str(), sample.timestamp_ns, &sample.payload);
            let id = ids.fetch_add(1, Ordering::Relaxed);
            match Message::event(id, EventKind::Preview).with_params(&frame) {
                Ok(msg) => {
                    if events.try_send(msg.stamped(sample.timestamp_ns)).is_err() {
                        debug!(%stream, "preview event dropped, link busy");
                    }
                }
                Err(e) => warn!(%stream, "failed to encode preview: {}", e),
            }
        }
    }
    debug!("preview loop stopped");
}
