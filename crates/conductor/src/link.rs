//! Per-node connection task.
//!
//! Architecture: one task per TCP connection owns the framed socket, the
//! table of requests awaiting a reply, and the node's snapshot. Everyone
//! else talks to it through a [`NodeHandle`]:
//! - requests flow in through an mpsc channel
//! - replies go back on a oneshot keyed by message id
//! - unsolicited node events go out to the coordinator as [`NodeEvent`]s
//!
//! Receive timestamps for replies are taken here, when the frame is read,
//! not when the awaiting caller is scheduled.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tandemproto::{
    retry, AckStatus, Clock, FrameCodec, FrameError, Handshake, Message, MessageKind, Nanos,
    NodeId, RetryError, RetryPolicy, Transient, Verb, PROTOCOL_VERSION,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock_sync::{spawn_resync, ClockSample, ClockStatus, ExchangeProbe};
use crate::context::{CommandIds, ConductorContext};
use crate::registry::{NodeSnapshot, NodeState};

const COMMAND_QUEUE: usize = 256;
const CLEANUP_INTERVAL: Duration = Duration::from_millis(250);

/// Something a link reports to the coordinator.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Connected {
        node: NodeId,
    },
    /// An `async` message from the node.
    Async {
        node: NodeId,
        message: Message,
        received_ns: Nanos,
    },
    ClockUpdate {
        node: NodeId,
        status: ClockStatus,
    },
    ClockDegraded {
        node: NodeId,
        reason: String,
    },
    Disconnected {
        node: NodeId,
        reason: String,
    },
}

#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("no reply to message {id} in time")]
    Timeout { id: u64 },

    #[error("link closed")]
    Disconnected,

    #[error("send failed: {0}")]
    Send(String),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl Transient for LinkError {
    fn is_transient(&self) -> bool {
        matches!(self, LinkError::Timeout { .. })
    }
}

/// A failed command, after retries.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{verb} rejected by {node}: {reason}")]
    Rejected {
        node: NodeId,
        verb: Verb,
        reason: String,
    },

    #[error("{verb} to {node} unanswered after {attempts} attempts")]
    Exhausted {
        node: NodeId,
        verb: Verb,
        attempts: u32,
    },

    #[error("{node} disconnected")]
    Disconnected { node: NodeId },

    #[error("{verb} to {node} cancelled")]
    Cancelled { node: NodeId, verb: Verb },

    #[error("encoding {verb}: {source}")]
    Encode { verb: Verb, source: FrameError },

    #[error("malformed ack for {verb} from {node}: {detail}")]
    MalformedAck {
        node: NodeId,
        verb: Verb,
        detail: String,
    },

    #[error("{verb} to {node}: {source}")]
    Link {
        node: NodeId,
        verb: Verb,
        source: LinkError,
    },
}

/// A reply matched to its request.
#[derive(Debug, Clone)]
pub struct Reply {
    pub message: Message,
    /// Master clock when the request was written.
    pub sent_ns: Nanos,
    /// Master clock when the reply frame was read.
    pub received_ns: Nanos,
}

/// A command's ack, with a non-rejected status.
#[derive(Debug, Clone)]
pub struct CommandAck {
    pub command_id: u64,
    pub status: AckStatus,
    pub reply: Reply,
}

impl CommandAck {
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        self.reply.message.params_as()
    }
}

enum LinkCommand {
    Request {
        message: Message,
        reply_tx: oneshot::Sender<Result<Reply, LinkError>>,
        deadline: Instant,
    },
    UpdateClock(ClockStatus),
    ClockDegraded(String),
    SetState(NodeState),
    Disconnect(String),
}

/// Cloneable handle to a node's link task.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    cmd_tx: mpsc::Sender<LinkCommand>,
    snapshot: watch::Receiver<NodeSnapshot>,
    ids: Arc<CommandIds>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id)
            .field("state", &self.snapshot.borrow().state)
            .finish()
    }
}

impl NodeHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn master_now(&self) -> Nanos {
        self.clock.now_ns()
    }

    pub fn next_id(&self) -> u64 {
        self.ids.next()
    }

    /// Send one message and wait for the reply whose `ack_id` matches its id.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Reply, LinkError> {
        let id = message.id;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(LinkCommand::Request {
                message,
                reply_tx,
                deadline: Instant::now() + timeout,
            })
            .await
            .map_err(|_| LinkError::Disconnected)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => Err(LinkError::Timeout { id }),
        }
    }

    /// Send a command, retrying with the same id until acked or the policy
    /// is exhausted. Exhaustion disconnects the node.
    pub async fn command<P: Serialize>(
        &self,
        verb: Verb,
        params: &P,
        t_scheduled: Option<Nanos>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<CommandAck, CommandError> {
        self.command_with_id(self.next_id(), verb, params, t_scheduled, policy, cancel)
            .await
    }

    /// [`command`](Self::command) with a caller-allocated id, for callers
    /// that must correlate later events with it.
    pub async fn command_with_id<P: Serialize>(
        &self,
        command_id: u64,
        verb: Verb,
        params: &P,
        t_scheduled: Option<Nanos>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<CommandAck, CommandError> {
        let mut message = Message::command(command_id, verb)
            .with_params(params)
            .map_err(|source| CommandError::Encode { verb, source })?;
        if let Some(t) = t_scheduled {
            message = message.with_scheduled(t);
        }

        let this = self;
        let timeout = policy.timeout;
        let attempts = retry(policy, verb.as_str(), |n| {
            let message = message.clone();
            async move {
                if n > 0 {
                    debug!(node = %this.id, %verb, command_id, attempt = n, "resending command");
                }
                this.request(message, timeout).await
            }
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(CommandError::Cancelled { node: self.id.clone(), verb });
            }
            result = attempts => result,
        };

        match result {
            Ok(reply) => self.interpret(command_id, verb, reply),
            Err(RetryError::Exhausted { attempts, .. }) => {
                let reason = format!("{} unanswered after {} attempts", verb, attempts);
                warn!(node = %self.id, %verb, attempts, "command retries exhausted, dropping node");
                let _ = self.disconnect(reason).await;
                Err(CommandError::Exhausted {
                    node: self.id.clone(),
                    verb,
                    attempts,
                })
            }
            Err(RetryError::Permanent {
                error: LinkError::Disconnected,
                ..
            }) => Err(CommandError::Disconnected {
                node: self.id.clone(),
            }),
            Err(RetryError::Permanent { error, .. }) => Err(CommandError::Link {
                node: self.id.clone(),
                verb,
                source: error,
            }),
        }
    }

    fn interpret(&self, command_id: u64, verb: Verb, reply: Reply) -> Result<CommandAck, CommandError> {
        match reply.message.status.clone() {
            None => Err(CommandError::MalformedAck {
                node: self.id.clone(),
                verb,
                detail: format!("{:?} reply without status", reply.message.kind),
            }),
            Some(AckStatus::Rejected { reason }) => Err(CommandError::Rejected {
                node: self.id.clone(),
                verb,
                reason,
            }),
            Some(status) => Ok(CommandAck {
                command_id,
                status,
                reply,
            }),
        }
    }

    pub async fn update_clock(&self, status: ClockStatus) -> Result<(), LinkError> {
        self.send(LinkCommand::UpdateClock(status)).await
    }

    pub async fn mark_clock_degraded(&self, reason: String) -> Result<(), LinkError> {
        self.send(LinkCommand::ClockDegraded(reason)).await
    }

    pub async fn set_state(&self, state: NodeState) -> Result<(), LinkError> {
        self.send(LinkCommand::SetState(state)).await
    }

    pub async fn disconnect(&self, reason: impl Into<String>) -> Result<(), LinkError> {
        self.send(LinkCommand::Disconnect(reason.into())).await
    }

    /// Wait until the snapshot satisfies `pred`, or the timeout passes.
    pub async fn wait_for<F>(&self, timeout: Duration, mut pred: F) -> Option<NodeSnapshot>
    where
        F: FnMut(&NodeSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| pred(s))).await;
        match waited {
            Ok(Ok(snap)) => Some(snap.clone()),
            _ => None,
        }
    }

    async fn send(&self, cmd: LinkCommand) -> Result<(), LinkError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| LinkError::Disconnected)
    }
}

#[async_trait]
impl ExchangeProbe for NodeHandle {
    async fn exchange(&self, timeout: Duration) -> Result<ClockSample, LinkError> {
        let reply = self
            .request(Message::sync_req(self.next_id()), timeout)
            .await?;
        if reply.message.kind != MessageKind::SyncResp {
            return Err(LinkError::Send(format!(
                "sync_req answered with {:?}",
                reply.message.kind
            )));
        }
        Ok(ClockSample {
            t0: reply.sent_ns,
            t1: reply.message.t_local,
            t2: reply.received_ns,
        })
    }
}

/// Remembers recently settled ids so a late or repeated ack can be told
/// apart from one that was never asked for.
#[derive(Debug)]
struct AckLedger {
    order: VecDeque<u64>,
    settled: HashSet<u64>,
    capacity: usize,
}

impl AckLedger {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.max(1)),
            settled: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn settle(&mut self, id: u64) {
        if !self.settled.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.settled.remove(&old);
            }
        }
    }

    fn contains(&self, id: u64) -> bool {
        self.settled.contains(&id)
    }
}

struct Pending {
    reply_tx: oneshot::Sender<Result<Reply, LinkError>>,
    sent_ns: Nanos,
    deadline: Instant,
}

type NodeFramed = Framed<TcpStream, FrameCodec>;

/// Run one node connection to completion: handshake, register, then the
/// reactor loop until the socket closes or the node is dropped.
pub async fn serve_node(
    ctx: Arc<ConductorContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), LinkError> {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, FrameCodec::new());

    let (handshake_id, hs) = read_handshake(&ctx, &mut framed).await?;
    if hs.protocol != PROTOCOL_VERSION {
        let reason = format!("unsupported protocol {}", hs.protocol);
        reject(&ctx, &mut framed, handshake_id, &reason).await;
        return Err(LinkError::Handshake(reason));
    }

    let node = hs.node_id.clone();
    let snapshot = NodeSnapshot::new(node.clone(), hs.capabilities.clone(), ctx.master_now());
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (snap_tx, snap_rx) = watch::channel(snapshot);
    let handle = NodeHandle {
        id: node.clone(),
        cmd_tx,
        snapshot: snap_rx,
        ids: ctx.ids.clone(),
        clock: ctx.clock.clone(),
    };

    if let Err(e) = ctx.registry.register(handle.clone()).await {
        warn!(%node, %peer, "rejecting handshake: {}", e);
        reject(&ctx, &mut framed, handshake_id, &e.to_string()).await;
        return Err(LinkError::Handshake(e.to_string()));
    }
    snap_tx.send_modify(|s| s.state = NodeState::Handshaking);

    let ack = Message::ack(ctx.ids.next(), handshake_id, AckStatus::Ok).stamped(ctx.master_now());
    if let Err(e) = framed.send(ack).await {
        snap_tx.send_modify(|s| s.state = NodeState::Disconnected);
        return Err(LinkError::Send(e.to_string()));
    }
    snap_tx.send_modify(|s| s.state = NodeState::Ready);
    info!(%node, %peer, capabilities = ?hs.capabilities, "node connected");

    let resync_cancel = ctx.shutdown.child_token();
    spawn_resync(handle.clone(), ctx.config.sync.clone(), resync_cancel.clone());
    let _ = ctx.events.send(NodeEvent::Connected { node: node.clone() }).await;

    let task = LinkTask {
        ctx: ctx.clone(),
        node: node.clone(),
        pending: HashMap::new(),
        ledger: AckLedger::new(ctx.config.link.ack_ledger_size),
        violations: 0,
        snapshot: snap_tx,
    };
    let reason = task.run(framed, cmd_rx).await;
    resync_cancel.cancel();

    info!(%node, %reason, "node disconnected");
    let _ = ctx
        .events
        .send(NodeEvent::Disconnected { node, reason })
        .await;
    Ok(())
}

async fn read_handshake(
    ctx: &ConductorContext,
    framed: &mut NodeFramed,
) -> Result<(u64, Handshake), LinkError> {
    let first = match tokio::time::timeout(ctx.config.link.handshake_timeout(), framed.next()).await {
        Err(_) => return Err(LinkError::Handshake("timed out waiting for handshake".into())),
        Ok(None) => return Err(LinkError::Disconnected),
        Ok(Some(Err(e))) => return Err(LinkError::Handshake(e.to_string())),
        Ok(Some(Ok(body))) => body,
    };

    let msg = Message::decode(&first).map_err(|e| LinkError::Handshake(e.to_string()))?;
    if msg.kind != MessageKind::Handshake {
        let reason = format!("expected handshake, got {:?}", msg.kind);
        reject(ctx, framed, msg.id, &reason).await;
        return Err(LinkError::Handshake(reason));
    }
    match msg.params_as::<Handshake>() {
        Ok(hs) => Ok((msg.id, hs)),
        Err(e) => {
            reject(ctx, framed, msg.id, "malformed handshake params").await;
            Err(LinkError::Handshake(e.to_string()))
        }
    }
}

async fn reject(ctx: &ConductorContext, framed: &mut NodeFramed, ack_id: u64, reason: &str) {
    let ack = Message::ack(ctx.ids.next(), ack_id, AckStatus::rejected(reason)).stamped(ctx.master_now());
    if let Err(e) = framed.send(ack).await {
        debug!("failed to send handshake rejection: {}", e);
    }
}

struct LinkTask {
    ctx: Arc<ConductorContext>,
    node: NodeId,
    pending: HashMap<u64, Pending>,
    ledger: AckLedger,
    violations: u32,
    snapshot: watch::Sender<NodeSnapshot>,
}

impl LinkTask {
    /// Returns the reason the link ended.
    async fn run(mut self, mut framed: NodeFramed, mut cmd_rx: mpsc::Receiver<LinkCommand>) -> String {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let shutdown = self.ctx.shutdown.clone();

        let reason = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break "conductor shutting down".to_string(),

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        break "all handles dropped".to_string();
                    };
                    if let Some(reason) = self.handle_command(&mut framed, cmd).await {
                        break reason;
                    }
                }

                frame = framed.next() => {
                    let received_ns = self.ctx.master_now();
                    match frame {
                        None => break "connection closed by node".to_string(),
                        Some(Err(e)) => break format!("fatal framing error: {}", e),
                        Some(Ok(body)) => {
                            if let Some(reason) = self.handle_frame(&body, received_ns).await {
                                break reason;
                            }
                        }
                    }
                }

                _ = cleanup.tick() => self.expire_pending(),
            }
        };

        self.snapshot.send_modify(|s| {
            s.state = NodeState::Disconnected;
            s.disconnect_reason = Some(reason.clone());
        });
        for (id, pending) in self.pending.drain() {
            trace!(node = %self.node, id, "failing pending request on disconnect");
            let _ = pending.reply_tx.send(Err(LinkError::Disconnected));
        }
        reason
    }

    async fn handle_command(&mut self, framed: &mut NodeFramed, cmd: LinkCommand) -> Option<String> {
        match cmd {
            LinkCommand::Request {
                mut message,
                reply_tx,
                deadline,
            } => {
                let id = message.id;
                let sent_ns = self.ctx.master_now();
                message.t_local = sent_ns;
                trace!(node = %self.node, id, kind = ?message.kind, "sending");
                if let Err(e) = framed.send(message).await {
                    let _ = reply_tx.send(Err(LinkError::Send(e.to_string())));
                    if e.is_fatal() {
                        return Some(format!("send failed: {}", e));
                    }
                    return None;
                }
                self.pending.insert(
                    id,
                    Pending {
                        reply_tx,
                        sent_ns,
                        deadline,
                    },
                );
            }
            LinkCommand::UpdateClock(status) => {
                self.snapshot.send_modify(|s| {
                    s.clock = Some(status.clone());
                    s.clock_degraded = None;
                });
                let event = NodeEvent::ClockUpdate {
                    node: self.node.clone(),
                    status,
                };
                if self.ctx.events.try_send(event).is_err() {
                    debug!(node = %self.node, "event queue full, clock update not forwarded");
                }
            }
            LinkCommand::ClockDegraded(reason) => {
                self.snapshot
                    .send_modify(|s| s.clock_degraded = Some(reason.clone()));
                let _ = self
                    .ctx
                    .events
                    .send(NodeEvent::ClockDegraded {
                        node: self.node.clone(),
                        reason,
                    })
                    .await;
            }
            LinkCommand::SetState(state) => {
                self.snapshot.send_modify(|s| {
                    if s.state.is_live() {
                        s.state = state;
                    }
                });
            }
            LinkCommand::Disconnect(reason) => return Some(reason),
        }
        None
    }

    async fn handle_frame(&mut self, body: &[u8], received_ns: Nanos) -> Option<String> {
        let msg = match Message::decode(body) {
            Ok(msg) => msg,
            Err(e) => return self.violation(format!("undecodable frame: {}", e)),
        };

        match msg.kind {
            MessageKind::Ack | MessageKind::SyncResp => {
                let Some(ack_id) = msg.ack_id else {
                    return self.violation("reply without ack_id".to_string());
                };
                if let Some(pending) = self.pending.remove(&ack_id) {
                    self.ledger.settle(ack_id);
                    let reply = Reply {
                        message: msg,
                        sent_ns: pending.sent_ns,
                        received_ns,
                    };
                    if pending.reply_tx.send(Ok(reply)).is_err() {
                        trace!(node = %self.node, ack_id, "reply arrived after caller gave up");
                    }
                } else if self.ledger.contains(ack_id) {
                    debug!(node = %self.node, ack_id, "ignoring late or duplicate reply");
                } else {
                    return self.violation(format!("reply to unknown id {}", ack_id));
                }
            }
            MessageKind::Async => {
                let event = NodeEvent::Async {
                    node: self.node.clone(),
                    message: msg,
                    received_ns,
                };
                if self.ctx.events.send(event).await.is_err() {
                    debug!(node = %self.node, "coordinator gone, dropping event");
                }
            }
            other => return self.violation(format!("unexpected {:?} from node", other)),
        }
        None
    }

    fn violation(&mut self, detail: String) -> Option<String> {
        self.violations += 1;
        let count = self.violations;
        self.snapshot.send_modify(|s| s.violations = count);
        warn!(node = %self.node, violations = count, "protocol violation: {}", detail);
        if count > self.ctx.config.link.max_violations {
            Some(format!("too many protocol violations ({})", count))
        } else {
            None
        }
    }

    fn expire_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now > p.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                self.ledger.settle(id);
                let _ = p.reply_tx.send(Err(LinkError::Timeout { id }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_is_bounded() {
        let mut ledger = AckLedger::new(3);
        for id in 1..=5 {
            ledger.settle(id);
        }
        assert!(!ledger.contains(1));
        assert!(!ledger.contains(2));
        assert!(ledger.contains(3));
        assert!(ledger.contains(5));
    }

    #[test]
    fn ledger_ignores_repeats() {
        let mut ledger = AckLedger::new(2);
        ledger.settle(7);
        ledger.settle(7);
        ledger.settle(8);
        assert!(ledger.contains(7));
        assert!(ledger.contains(8));
    }

    #[test]
    fn only_timeouts_are_transient() {
        assert!(LinkError::Timeout { id: 1 }.is_transient());
        assert!(!LinkError::Disconnected.is_transient());
        assert!(!LinkError::Send("x".into()).is_transient());
    }
}
