//! Session coordinator.
//!
//! One task owns the session. Operator requests arrive through a
//! [`CoordinatorHandle`], link events on the [`NodeEvent`] channel, and the
//! outcomes of spawned command tasks on an internal channel. The loop applies
//! them one at a time, so transitions never race, and it never awaits a node
//! directly: every command runs in its own task and reports back.
//!
//! ```text
//! Idle -> Armed -> Scheduled -> Recording -> Stopping -> Archived
//!   \________\__________\___________\___________\-----> Aborted
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tandemconf::SessionConfig;
use tandemproto::{
    duration_ns, AckStatus, BundleDescriptor, CaptureFault, EventKind, Message, Nanos, NodeId,
    NodeStatus, SessionId, SessionParams, StartConfirmed, StartParams, Verb,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::aggregate::Aggregator;
use crate::clock_sync::{ClockStatus, OffsetPoint};
use crate::context::ConductorContext;
use crate::link::{CommandAck, CommandError, NodeEvent, NodeHandle};
use crate::registry::{NodeState, UnreadyReason};
use crate::session::{Manifest, Outcome, ParticipantRecord, SessionState, TransferRecord};

const OP_QUEUE: usize = 32;
const INTERNAL_QUEUE: usize = 256;

pub const DISCONNECTED_BEFORE_START: &str = "disconnected-before-start";
pub const CONFIRM_TIMEOUT: &str = "confirm-timeout";

#[derive(Debug, Error)]
pub enum ArmError {
    #[error("no nodes selected")]
    NoNodes,

    #[error("session {0} is still active")]
    Busy(SessionId),

    #[error("node {node} cannot be armed: {reason}")]
    Unready { node: NodeId, reason: UnreadyReason },

    #[error("node {node} did not accept arm: {reason}")]
    Refused { node: NodeId, reason: String },

    #[error("arm aborted: {0}")]
    Aborted(String),

    #[error("coordinator is not running")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("no active session")]
    NoSession,

    #[error("cannot {op} session {session} while {state}")]
    InvalidState {
        session: SessionId,
        state: SessionState,
        op: &'static str,
    },

    #[error("session {session} aborted: {reason}")]
    Aborted { session: SessionId, reason: String },

    #[error("coordinator is not running")]
    Stopped,
}

/// Published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub state: SessionState,
}

/// What `start` decided.
#[derive(Debug, Clone, Serialize)]
pub struct StartPlan {
    pub session_id: SessionId,
    pub t_start_master: Nanos,
    pub lead_ns: Nanos,
    /// Node-local instant each participant was told to start at.
    pub scheduled: BTreeMap<NodeId, Nanos>,
}

/// Scheduling lead for a given worst-case round trip.
pub fn schedule_lead(config: &SessionConfig, worst_rtt_ns: Nanos) -> Nanos {
    let from_rtt =
        (worst_rtt_ns as f64 * config.lead_rtt_factor) as Nanos + duration_ns(config.lead_margin());
    duration_ns(config.min_lead()).max(from_rtt)
}

enum Op {
    Arm {
        nodes: Vec<NodeId>,
        reply: oneshot::Sender<Result<SessionId, ArmError>>,
    },
    Start {
        reply: oneshot::Sender<Result<StartPlan, CoordinatorError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<Manifest, CoordinatorError>>,
    },
    Abort {
        reason: String,
        reply: oneshot::Sender<Result<Manifest, CoordinatorError>>,
    },
    Manifest {
        reply: oneshot::Sender<Option<Manifest>>,
    },
}

/// Outcomes of work the coordinator spawned. Each carries its session id so
/// results that outlive their session are dropped.
enum Internal {
    ArmResults {
        session: SessionId,
        results: Vec<(NodeHandle, Result<CommandAck, CommandError>)>,
    },
    StartAck {
        session: SessionId,
        node: NodeId,
        result: Result<CommandAck, CommandError>,
    },
    ConfirmDeadline {
        session: SessionId,
    },
    StopAck {
        session: SessionId,
        node: NodeId,
        result: Result<CommandAck, CommandError>,
    },
    StopDeadline {
        session: SessionId,
    },
    Aggregated {
        session: SessionId,
        transfers: Vec<(NodeId, TransferRecord)>,
    },
}

/// Operator-facing handle to the coordinator task.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    ops: mpsc::Sender<Op>,
    status: watch::Receiver<Option<SessionStatus>>,
}

impl CoordinatorHandle {
    /// Freeze a participant set and arm every node in it.
    pub async fn arm(&self, nodes: Vec<NodeId>) -> Result<SessionId, ArmError> {
        let (reply, rx) = oneshot::channel();
        self.ops
            .send(Op::Arm { nodes, reply })
            .await
            .map_err(|_| ArmError::Stopped)?;
        rx.await.map_err(|_| ArmError::Stopped)?
    }

    /// Schedule the common start instant and send `start_recording`.
    pub async fn start(&self) -> Result<StartPlan, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.call(Op::Start { reply }, rx).await
    }

    /// Stop, archive, and return the written manifest.
    pub async fn stop(&self) -> Result<Manifest, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.call(Op::Stop { reply }, rx).await
    }

    pub async fn abort(&self, reason: impl Into<String>) -> Result<Manifest, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        let op = Op::Abort {
            reason: reason.into(),
            reply,
        };
        self.call(op, rx).await
    }

    /// The active session's manifest so far, or the last finished one.
    pub async fn manifest(&self) -> Option<Manifest> {
        let (reply, rx) = oneshot::channel();
        self.ops.send(Op::Manifest { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.status.borrow().clone()
    }

    /// Wait until the current session reaches `state`.
    pub async fn wait_for_state(
        &self,
        state: SessionState,
        timeout: Duration,
    ) -> Option<SessionStatus> {
        let mut rx = self.status.clone();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.as_ref().is_some_and(|s| s.state == state)),
        )
        .await;
        match waited {
            Ok(Ok(status)) => status.clone(),
            _ => None,
        }
    }

    async fn call<T>(
        &self,
        op: Op,
        rx: oneshot::Receiver<Result<T, CoordinatorError>>,
    ) -> Result<T, CoordinatorError> {
        self.ops
            .send(op)
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        rx.await.map_err(|_| CoordinatorError::Stopped)?
    }
}

struct ActiveSession {
    manifest: Manifest,
    /// Cancels timers and in-flight command retries for this session.
    cancel: CancellationToken,
    arming: bool,
    arm_reply: Option<oneshot::Sender<Result<SessionId, ArmError>>>,
    stop_reply: Option<oneshot::Sender<Result<Manifest, CoordinatorError>>>,
    stop_pending: HashSet<NodeId>,
}

impl ActiveSession {
    fn id(&self) -> &SessionId {
        &self.manifest.session_id
    }

    fn state(&self) -> SessionState {
        self.manifest.state
    }
}

pub struct Coordinator {
    ctx: Arc<ConductorContext>,
    aggregator: Aggregator,
    active: Option<ActiveSession>,
    last: Option<Manifest>,
    internal_tx: mpsc::Sender<Internal>,
    status_tx: watch::Sender<Option<SessionStatus>>,
}

impl Coordinator {
    /// Spawn the coordinator task. It owns `events` from here on.
    pub fn spawn(
        ctx: Arc<ConductorContext>,
        events: mpsc::Receiver<NodeEvent>,
        aggregator: Aggregator,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (ops_tx, ops_rx) = mpsc::channel(OP_QUEUE);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_QUEUE);
        let (status_tx, status_rx) = watch::channel(None);

        let coordinator = Coordinator {
            ctx,
            aggregator,
            active: None,
            last: None,
            internal_tx,
            status_tx,
        };
        let task = tokio::spawn(coordinator.run(ops_rx, events, internal_rx));
        let handle = CoordinatorHandle {
            ops: ops_tx,
            status: status_rx,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut ops: mpsc::Receiver<Op>,
        mut events: mpsc::Receiver<NodeEvent>,
        mut internal: mpsc::Receiver<Internal>,
    ) {
        let shutdown = self.ctx.shutdown.clone();
        info!("session coordinator running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    if self.active.is_some() {
                        self.abort_session("conductor shutting down".to_string()).await;
                    }
                    break;
                }

                Some(result) = internal.recv() => self.on_internal(result).await,

                Some(event) = events.recv() => self.on_event(event).await,

                op = ops.recv() => match op {
                    Some(op) => self.on_op(op).await,
                    None => {
                        debug!("all coordinator handles dropped");
                        break;
                    }
                },
            }
        }

        info!("session coordinator stopped");
    }

    async fn on_op(&mut self, op: Op) {
        match op {
            Op::Arm { nodes, reply } => self.arm(nodes, reply).await,
            Op::Start { reply } => self.start(reply).await,
            Op::Stop { reply } => self.stop(reply).await,
            Op::Abort { reason, reply } => {
                let result = match &self.active {
                    None => Err(CoordinatorError::NoSession),
                    Some(active) if active.state() == SessionState::Archived => {
                        Err(CoordinatorError::InvalidState {
                            session: active.id().clone(),
                            state: active.state(),
                            op: "abort",
                        })
                    }
                    Some(_) => self
                        .abort_session(reason)
                        .await
                        .ok_or(CoordinatorError::NoSession),
                };
                let _ = reply.send(result);
            }
            Op::Manifest { reply } => {
                let manifest = self
                    .active
                    .as_ref()
                    .map(|a| a.manifest.clone())
                    .or_else(|| self.last.clone());
                let _ = reply.send(manifest);
            }
        }
    }

    // --- Arm ---------------------------------------------------------------

    async fn arm(
        &mut self,
        nodes: Vec<NodeId>,
        reply: oneshot::Sender<Result<SessionId, ArmError>>,
    ) {
        if let Some(active) = &self.active {
            let _ = reply.send(Err(ArmError::Busy(active.id().clone())));
            return;
        }

        let mut seen = HashSet::new();
        let nodes: Vec<NodeId> = nodes.into_iter().filter(|n| seen.insert(n.clone())).collect();
        if nodes.is_empty() {
            let _ = reply.send(Err(ArmError::NoNodes));
            return;
        }

        let now = self.ctx.master_now();
        let mut handles = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let Some(handle) = self.ctx.registry.get(node).await else {
                let _ = reply.send(Err(ArmError::Unready {
                    node: node.clone(),
                    reason: UnreadyReason::Unknown,
                }));
                return;
            };
            if let Err(reason) = handle.snapshot().schedulable(now, &self.ctx.config.sync) {
                info!(%node, %reason, "arm refused");
                let _ = reply.send(Err(ArmError::Unready {
                    node: node.clone(),
                    reason,
                }));
                return;
            }
            handles.push(handle);
        }

        let session_id = SessionId::generate();
        let tolerance_ns = self.ctx.config.session.start_tolerance_us as Nanos * 1_000;
        let mut manifest = Manifest::new(session_id.clone(), tolerance_ns);
        for handle in &handles {
            let snap = handle.snapshot();
            manifest
                .participants
                .insert(snap.id.clone(), ParticipantRecord::new(snap.id, snap.capabilities));
        }
        manifest.event(now, None, "arm", format!("arming {} node(s)", handles.len()));
        info!(session = %session_id, nodes = ?nodes, "arming session");

        let cancel = self.ctx.shutdown.child_token();
        let policy = self.ctx.policies.command.clone();
        let tx = self.internal_tx.clone();
        let task_cancel = cancel.clone();
        let session = session_id.clone();
        tokio::spawn(async move {
            let params = SessionParams::new(session.clone());
            let arms = handles.into_iter().map(|handle| {
                let params = &params;
                let policy = &policy;
                let cancel = &task_cancel;
                async move {
                    let result = handle
                        .command(Verb::ArmSession, params, None, policy, cancel)
                        .await;
                    (handle, result)
                }
            });
            let results = futures::future::join_all(arms).await;
            let _ = tx.send(Internal::ArmResults { session, results }).await;
        });

        self.active = Some(ActiveSession {
            manifest,
            cancel,
            arming: true,
            arm_reply: Some(reply),
            stop_reply: None,
            stop_pending: HashSet::new(),
        });
    }

    async fn arm_results(
        &mut self,
        results: Vec<(NodeHandle, Result<CommandAck, CommandError>)>,
    ) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let refused = results.iter().find_map(|(handle, result)| match result {
            Err(e) => Some((handle.id().clone(), e.to_string())),
            Ok(_) => None,
        });

        if let Some((node, reason)) = refused {
            warn!(session = %active.id(), %node, %reason, "arm refused by node, releasing the rest");
            active.cancel.cancel();
            let params = SessionParams::new(active.id().clone()).with_reason("arm failed");
            let timeout = self.ctx.config.retry.command_timeout();
            for (handle, result) in results {
                if result.is_ok() {
                    spawn_abort_notice(handle, params.clone(), timeout);
                }
            }
            if let Some(active) = self.active.take() {
                if let Some(reply) = active.arm_reply {
                    let _ = reply.send(Err(ArmError::Refused { node, reason }));
                }
            }
            return;
        }

        let now = self.ctx.master_now();
        for (handle, result) in results {
            if let Ok(ack) = result {
                if let AckStatus::Degraded { detail } = &ack.status {
                    active
                        .manifest
                        .event(now, Some(handle.id()), "arm-degraded", detail.clone());
                }
            }
            spawn_set_state(handle, NodeState::Armed);
        }

        active.arming = false;
        active.manifest.state = SessionState::Armed;
        active.manifest.event(now, None, "armed", "all participants accepted");
        info!(session = %active.id(), "session armed");
        publish(&self.status_tx, &active.manifest);
        if let Some(reply) = active.arm_reply.take() {
            let _ = reply.send(Ok(active.id().clone()));
        }
    }

    // --- Start -------------------------------------------------------------

    async fn start(&mut self, reply: oneshot::Sender<Result<StartPlan, CoordinatorError>>) {
        let participants = match self.expect_state(SessionState::Armed, "start") {
            Ok(ids) => ids,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let handles = self.live_handles(&participants).await;
        let Some(active) = self.active.as_mut() else {
            let _ = reply.send(Err(CoordinatorError::NoSession));
            return;
        };

        let now = self.ctx.master_now();
        let mut plan = Vec::new();
        let mut failures = Vec::new();
        for (id, record) in active.manifest.participants.iter_mut() {
            if record.is_settled() {
                continue;
            }
            let Some(handle) = handles.get(id) else {
                record.settle(failed(DISCONNECTED_BEFORE_START));
                failures.push((id.clone(), DISCONNECTED_BEFORE_START.to_string()));
                continue;
            };
            match handle.snapshot().clock {
                Some(clock) => plan.push((handle.clone(), clock.scheduling_estimate())),
                None => {
                    record.settle(failed("no-clock-estimate"));
                    failures.push((id.clone(), "no-clock-estimate".to_string()));
                }
            }
        }
        for (node, reason) in failures {
            warn!(session = %active.id(), %node, %reason, "participant dropped before start");
            active.manifest.event(now, Some(&node), "start-failed", reason);
        }

        if plan.is_empty() {
            let session = active.id().clone();
            let reason = "no participant reachable at start".to_string();
            self.abort_session(reason.clone()).await;
            let _ = reply.send(Err(CoordinatorError::Aborted { session, reason }));
            return;
        }

        let config = &self.ctx.config.session;
        let worst_rtt = plan.iter().map(|(_, est)| est.rtt_ns).max().unwrap_or(0);
        let lead = schedule_lead(config, worst_rtt);
        let t_start = self.ctx.master_now() + lead;
        let session_id = active.id().clone();

        active.manifest.t_start_master = Some(t_start);
        active.manifest.lead_ns = Some(lead);
        active.manifest.state = SessionState::Scheduled;
        active.manifest.event(
            now,
            None,
            "scheduled",
            format!("T_start {} ns, lead {} µs, worst rtt {} µs", t_start, lead / 1_000, worst_rtt / 1_000),
        );

        let mut scheduled = BTreeMap::new();
        for (handle, estimate) in plan {
            let command_id = handle.next_id();
            let t_local = estimate.to_local(t_start);
            if let Some(record) = active.manifest.participant_mut(handle.id()) {
                record.schedule_offset = Some(estimate);
                record.start_command_id = Some(command_id);
                record.t_scheduled_local = Some(t_local);
            }
            scheduled.insert(handle.id().clone(), t_local);

            let params = StartParams {
                session_id: session_id.clone(),
                t_start_master: t_start,
            };
            let policy = self.ctx.policies.command.clone();
            let cancel = active.cancel.clone();
            let tx = self.internal_tx.clone();
            let session = session_id.clone();
            tokio::spawn(async move {
                let result = handle
                    .command_with_id(
                        command_id,
                        Verb::StartRecording,
                        &params,
                        Some(t_local),
                        &policy,
                        &cancel,
                    )
                    .await;
                let node = handle.id().clone();
                let _ = tx.send(Internal::StartAck { session, node, result }).await;
            });
        }

        let deadline = t_start + duration_ns(config.confirm_timeout());
        spawn_timer(
            self.internal_tx.clone(),
            active.cancel.clone(),
            self.ctx.clock.until(deadline),
            Internal::ConfirmDeadline {
                session: session_id.clone(),
            },
        );

        info!(session = %session_id, t_start, lead_us = lead / 1_000, nodes = scheduled.len(), "start scheduled");
        publish(&self.status_tx, &active.manifest);
        let _ = reply.send(Ok(StartPlan {
            session_id,
            t_start_master: t_start,
            lead_ns: lead,
            scheduled,
        }));
    }


    async fn start_ack(&mut self, node: NodeId, result: Result<CommandAck, CommandError>) {
        let now = self.ctx.master_now();
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let reason = match result {
            Ok(ack) => {
                if let AckStatus::Degraded { detail } = &ack.status {
                    active
                        .manifest
                        .event(now, Some(&node), "start-ack-degraded", detail.clone());
                }
                trace!(session = %active.id(), %node, "start_recording acked");
                return;
            }
            Err(CommandError::Cancelled { .. }) => return,
            Err(CommandError::Disconnected { .. }) => DISCONNECTED_BEFORE_START.to_string(),
            Err(e) => format!("start-not-acknowledged: {}", e),
        };

        let Some(record) = active.manifest.participant_mut(&node) else {
            return;
        };
        if record.settle(failed(&reason)) {
            warn!(session = %active.id(), %node, %reason, "start failed");
            active.manifest.event(now, Some(&node), "start-failed", reason);
        }
        self.check_viable().await;
    }

    async fn start_confirmed(&mut self, node: NodeId, message: Message) {
        let now = self.ctx.master_now();
        let confirmed: StartConfirmed = match message.params_as() {
            Ok(c) => c,
            Err(e) => {
                warn!(%node, "malformed start_confirmed: {}", e);
                if let Some(active) = self.active.as_mut() {
                    active
                        .manifest
                        .event(now, Some(&node), "malformed-event", e.to_string());
                }
                return;
            }
        };

        let Some(active) = self.active.as_mut() else {
            debug!(%node, "start_confirmed with no active session");
            return;
        };
        if &confirmed.session_id != active.id() {
            debug!(%node, session = %confirmed.session_id, "start_confirmed for another session");
            return;
        }
        let Some(t_start) = active.manifest.t_start_master else {
            return;
        };
        let tolerance = active.manifest.start_tolerance_ns;
        let session_id = active.id().clone();

        let Some(record) = active.manifest.participant_mut(&node) else {
            return;
        };
        if record.start_command_id != Some(confirmed.command_id) {
            let detail = format!("confirmation for unknown command {}", confirmed.command_id);
            warn!(session = %session_id, %node, "{}", detail);
            active
                .manifest
                .event(now, Some(&node), "unmatched-confirmation", detail);
            return;
        }
        if record.observed_start_local.is_some() {
            debug!(session = %session_id, %node, "duplicate start confirmation");
            return;
        }
        let Some(estimate) = record.schedule_offset else {
            return;
        };

        let observed_master = estimate.to_master(confirmed.t_observed_local);
        let skew = observed_master - t_start;
        record.observed_start_local = Some(confirmed.t_observed_local);
        record.observed_start_master = Some(observed_master);
        record.start_skew_ns = Some(skew);

        if record.is_settled() {
            let detail = format!("late confirmation, skew {} µs", skew / 1_000);
            active
                .manifest
                .event(now, Some(&node), "late-confirmation", detail);
            return;
        }

        let outcome = if skew.abs() > tolerance {
            Outcome::Degraded {
                detail: format!(
                    "start skew {} µs exceeds ±{} µs",
                    skew / 1_000,
                    tolerance / 1_000
                ),
            }
        } else {
            Outcome::Confirmed
        };
        let label = outcome.label();
        record.settle(outcome);
        info!(session = %session_id, %node, skew_us = skew / 1_000, outcome = %label, "start confirmed");
        active
            .manifest
            .event(now, Some(&node), "start-confirmed", label);

        if active.manifest.state == SessionState::Scheduled {
            active.manifest.state = SessionState::Recording;
            info!(session = %session_id, "session recording");
            publish(&self.status_tx, &active.manifest);
        }

        if let Some(handle) = self.ctx.registry.get(&node).await {
            spawn_set_state(handle, NodeState::Recording);
        }
    }

    async fn confirm_deadline(&mut self) {
        let now = self.ctx.master_now();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !matches!(
            active.state(),
            SessionState::Scheduled | SessionState::Recording
        ) {
            return;
        }

        let mut late = Vec::new();
        for (id, record) in active.manifest.participants.iter_mut() {
            if record.settle(failed(CONFIRM_TIMEOUT)) {
                late.push(id.clone());
            }
        }
        for node in late {
            warn!(session = %active.id(), %node, "no start confirmation before deadline");
            active
                .manifest
                .event(now, Some(&node), "start-failed", CONFIRM_TIMEOUT);
        }
        self.check_viable().await;
    }

    /// Abort once every participant has settled and none of them started.
    async fn check_viable(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let reason = match active.state() {
            SessionState::Armed => "all participants lost before start",
            SessionState::Scheduled | SessionState::Recording => "no participant confirmed start",
            _ => return,
        };
        if active.manifest.is_complete() && active.manifest.started_count() == 0 {
            self.abort_session(reason.to_string()).await;
        }
    }

    // --- Stop and archive --------------------------------------------------

    async fn stop(&mut self, reply: oneshot::Sender<Result<Manifest, CoordinatorError>>) {
        let participants = match self.expect_state(SessionState::Recording, "stop") {
            Ok(ids) => ids,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let handles = self.live_handles(&participants).await;
        let now = self.ctx.master_now();
        let Some(active) = self.active.as_mut() else {
            let _ = reply.send(Err(CoordinatorError::NoSession));
            return;
        };

        let session_id = active.id().clone();
        active.manifest.state = SessionState::Stopping;
        active.manifest.event(now, None, "stop", "stop requested");
        info!(session = %session_id, "stopping session");

        let mut notes = Vec::new();
        for (id, record) in active.manifest.participants.iter_mut() {
            if record.settle(failed("not-confirmed-before-stop")) {
                notes.push((id.clone(), "start-failed", "not-confirmed-before-stop".to_string()));
            }
            let Some(handle) = handles.get(id) else {
                if record.started() {
                    record.degrade("unreachable at stop");
                    notes.push((id.clone(), "stop-unreachable", "node not connected at stop".to_string()));
                }
                continue;
            };

            active.stop_pending.insert(id.clone());
            spawn_set_state(handle.clone(), NodeState::Stopping);

            let handle = handle.clone();
            let params = SessionParams::new(session_id.clone());
            let policy = self.ctx.policies.command.clone();
            let cancel = active.cancel.clone();
            let tx = self.internal_tx.clone();
            let session = session_id.clone();
            tokio::spawn(async move {
                let result = handle
                    .command(Verb::StopRecording, &params, None, &policy, &cancel)
                    .await;
                let node = handle.id().clone();
                let _ = tx.send(Internal::StopAck { session, node, result }).await;
            });
        }
        for (node, kind, detail) in notes {
            active.manifest.event(now, Some(&node), kind, detail);
        }

        active.stop_reply = Some(reply);
        spawn_timer(
            self.internal_tx.clone(),
            active.cancel.clone(),
            self.ctx.config.session.stop_timeout(),
            Internal::StopDeadline {
                session: session_id,
            },
        );
        publish(&self.status_tx, &active.manifest);

        if active.stop_pending.is_empty() {
            self.begin_archive().await;
        }
    }

    async fn stop_ack(&mut self, node: NodeId, result: Result<CommandAck, CommandError>) {
        let now = self.ctx.master_now();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.state() != SessionState::Stopping || !active.stop_pending.remove(&node) {
            debug!(session = %active.id(), %node, "late stop ack ignored");
            return;
        }

        let mut notes = Vec::new();
        if let Some(record) = active.manifest.participant_mut(&node) {
            match result {
                Ok(ack) => {
                    match ack.params_as::<BundleDescriptor>() {
                        Ok(bundle) => record.bundle = Some(bundle),
                        Err(e) => {
                            record.degrade(format!("malformed bundle descriptor: {}", e));
                            notes.push(("stop-malformed", e.to_string()));
                        }
                    }
                    if let AckStatus::Degraded { detail } = &ack.status {
                        record.degrade(format!("storage: {}", detail));
                        notes.push(("storage-degraded", detail.clone()));
                    }
                    record.stop_status = Some(ack.status);
                }
                Err(e) => {
                    let detail = format!("stop-not-acknowledged: {}", e);
                    record.degrade(detail.clone());
                    notes.push(("stop-failed", detail));
                }
            }
        }
        for (kind, detail) in notes {
            warn!(session = %active.id(), %node, kind, %detail, "stop reported a problem");
            active.manifest.event(now, Some(&node), kind, detail);
        }

        if active.stop_pending.is_empty() {
            self.begin_archive().await;
        }
    }

    async fn stop_deadline(&mut self) {
        let now = self.ctx.master_now();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.state() != SessionState::Stopping || active.stop_pending.is_empty() {
            return;
        }
        let unanswered: Vec<NodeId> = active.stop_pending.drain().collect();
        for node in unanswered {
            warn!(session = %active.id(), %node, "no stop confirmation before deadline");
            if let Some(record) = active.manifest.participant_mut(&node) {
                record.degrade("stop-timeout");
            }
            active.manifest.event(now, Some(&node), "stop-failed", "stop-timeout");
        }
        self.begin_archive().await;
    }

    /// Stop has settled: mark Archived and pull every reported bundle.
    async fn begin_archive(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let bundles: Vec<(NodeId, BundleDescriptor)> = active
            .manifest
            .participants
            .iter()
            .filter_map(|(id, p)| p.bundle.clone().map(|b| (id.clone(), b)))
            .collect();
        let ids: Vec<NodeId> = bundles.iter().map(|(id, _)| id.clone()).collect();
        let handles = self.live_handles(&ids).await;

        let now = self.ctx.master_now();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.manifest.state = SessionState::Archived;

        let mut jobs = Vec::new();
        for (id, bundle) in bundles {
            match handles.get(&id) {
                Some(handle) => jobs.push((handle.clone(), bundle)),
                None => {
                    if let Some(record) = active.manifest.participant_mut(&id) {
                        record.transfer = Some(TransferRecord::not_attempted(&bundle, "node unreachable"));
                    }
                    active
                        .manifest
                        .event(now, Some(&id), "transfer-failed", "node unreachable");
                }
            }
        }
        active.manifest.event(
            now,
            None,
            "stopped",
            format!("aggregating {} bundle(s)", jobs.len()),
        );
        info!(session = %active.id(), bundles = jobs.len(), "session stopped, aggregating");
        publish(&self.status_tx, &active.manifest);

        let aggregator = self.aggregator.clone();
        let cancel = active.cancel.clone();
        let tx = self.internal_tx.clone();
        let session = active.id().clone();
        tokio::spawn(async move {
            let pulls = jobs.into_iter().map(|(handle, bundle)| {
                let aggregator = &aggregator;
                let cancel = &cancel;
                async move {
                    let record = aggregator.pull(&handle, &bundle, cancel).await;
                    (handle.id().clone(), record)
                }
            });
            let transfers = futures::future::join_all(pulls).await;
            let _ = tx.send(Internal::Aggregated { session, transfers }).await;
        });
    }

    async fn aggregated(&mut self, transfers: Vec<(NodeId, TransferRecord)>) {
        let now = self.ctx.master_now();
        let Some(mut active) = self.active.take() else {
            return;
        };

        for (node, transfer) in transfers {
            let Some(record) = active.manifest.participant_mut(&node) else {
                continue;
            };
            let failures = transfer.failures();
            record.transfer = Some(transfer);
            if !failures.is_empty() {
                let detail = failures.join(", ");
                warn!(session = %active.id(), %node, %detail, "bundle not fully archived");
                active
                    .manifest
                    .event(now, Some(&node), "transfer-failed", detail);
            }
        }

        active.manifest.event(now, None, "archived", "manifest finalized");
        self.write_manifest(&active.manifest).await;

        let participants: Vec<NodeId> = active.manifest.participants.keys().cloned().collect();
        for handle in self.live_handles(&participants).await.into_values() {
            spawn_set_state(handle, NodeState::Ready);
        }

        info!(
            session = %active.id(),
            started = active.manifest.started_count(),
            participants = participants.len(),
            "session archived"
        );
        publish(&self.status_tx, &active.manifest);
        if let Some(reply) = active.stop_reply.take() {
            let _ = reply.send(Ok(active.manifest.clone()));
        }
        self.last = Some(active.manifest);
    }

    // --- Abort -------------------------------------------------------------

    /// Cancel everything in flight for the session, tell nodes best-effort,
    /// fail every unsettled participant and write the manifest.
    async fn abort_session(&mut self, reason: String) -> Option<Manifest> {
        let mut active = self.active.take()?;
        active.cancel.cancel();
        let now = self.ctx.master_now();
        let session_id = active.id().clone();
        warn!(session = %session_id, %reason, "aborting session");

        let participants: Vec<NodeId> = active.manifest.participants.keys().cloned().collect();
        let params = SessionParams::new(session_id.clone()).with_reason(reason.clone());
        let timeout = self.ctx.config.retry.command_timeout();
        for handle in self.live_handles(&participants).await.into_values() {
            spawn_abort_notice(handle, params.clone(), timeout);
        }

        let detail = format!("aborted: {}", reason);
        let mut unsettled = Vec::new();
        for (id, record) in active.manifest.participants.iter_mut() {
            if record.settle(failed(&detail)) {
                unsettled.push(id.clone());
            }
        }
        for node in unsettled {
            active
                .manifest
                .event(now, Some(&node), "participant-aborted", detail.clone());
        }
        active.manifest.state = SessionState::Aborted;
        active.manifest.abort_reason = Some(reason.clone());
        active.manifest.event(now, None, "aborted", reason.clone());
        self.write_manifest(&active.manifest).await;

        if let Some(reply) = active.arm_reply.take() {
            let _ = reply.send(Err(ArmError::Aborted(reason.clone())));
        }
        if let Some(reply) = active.stop_reply.take() {
            let _ = reply.send(Err(CoordinatorError::Aborted {
                session: session_id,
                reason,
            }));
        }
        publish(&self.status_tx, &active.manifest);
        self.last = Some(active.manifest.clone());
        Some(active.manifest)
    }

    // --- Events --------------------------------------------------------------

    async fn on_internal(&mut self, internal: Internal) {
        let current = self.active.as_ref().map(|a| a.id().clone());
        if current.as_ref() != Some(internal.session()) {
            trace!(session = %internal.session(), "dropping result for a finished session");
            return;
        }

        match internal {
            Internal::ArmResults { results, .. } => self.arm_results(results).await,
            Internal::StartAck { node, result, .. } => self.start_ack(node, result).await,
            Internal::ConfirmDeadline { .. } => self.confirm_deadline().await,
            Internal::StopAck { node, result, .. } => self.stop_ack(node, result).await,
            Internal::StopDeadline { .. } => self.stop_deadline().await,
            Internal::Aggregated { transfers, .. } => self.aggregated(transfers).await,
        }
    }

    async fn on_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Connected { node } => debug!(%node, "node joined"),
            NodeEvent::Async { node, message, .. } => self.node_event(node, message).await,
            NodeEvent::ClockUpdate { node, status } => self.clock_update(node, status),
            NodeEvent::ClockDegraded { node, reason } => {
                let now = self.ctx.master_now();
                if let Some(active) = self.active.as_mut() {
                    if active.manifest.participants.contains_key(&node) {
                        active
                            .manifest
                            .event(now, Some(&node), "clock-degraded", reason);
                    }
                }
            }
            NodeEvent::Disconnected { node, reason } => self.node_disconnected(node, reason).await,
        }
    }

    async fn node_event(&mut self, node: NodeId, message: Message) {
        match message.event {
            Some(EventKind::StartConfirmed) => self.start_confirmed(node, message).await,
            Some(EventKind::Status) => match message.params_as::<NodeStatus>() {
                Ok(status) => {
                    if let Some(record) = self.participant_mut(&node) {
                        record.last_status = Some(status);
                    }
                }
                Err(e) => debug!(%node, "malformed status event: {}", e),
            },
            Some(EventKind::Preview) => {
                if let Some(record) = self.participant_mut(&node) {
                    record.preview_frames += 1;
                }
            }
            Some(EventKind::CaptureFault) => self.capture_fault(node, message),
            None => debug!(%node, id = message.id, "async message without event"),
        }
    }

    fn capture_fault(&mut self, node: NodeId, message: Message) {
        let now = self.ctx.master_now();
        let fault: CaptureFault = match message.params_as() {
            Ok(f) => f,
            Err(e) => {
                warn!(%node, "malformed capture_fault: {}", e);
                return;
            }
        };
        let Some(active) = self.active.as_mut() else {
            warn!(%node, stream = %fault.stream, "capture fault outside a session: {}", fault.detail);
            return;
        };
        if &fault.session_id != active.id() {
            return;
        }

        let detail = format!("{}: {}", fault.stream, fault.detail);
        warn!(session = %active.id(), %node, %detail, "capture fault");
        if let Some(record) = active.manifest.participant_mut(&node) {
            record.degrade(format!("capture fault on {}", detail));
        }
        active
            .manifest
            .event(now, Some(&node), "capture-fault", detail);
    }

    fn clock_update(&mut self, node: NodeId, status: ClockStatus) {
        let max_drift = self.ctx.config.sync.max_drift_ppm;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(record) = active.manifest.participant_mut(&node) else {
            return;
        };

        record.offset_trace.push(OffsetPoint {
            at_master: status.measured_at,
            offset_ns: status.estimate.offset_ns,
            confidence_ns: status.estimate.confidence_ns,
        });

        let Some(ppm) = status.drift_ppm else {
            return;
        };
        if ppm.abs() > max_drift && !record.drift_warned {
            record.drift_warned = true;
            let detail = format!("drift {:.1} ppm exceeds {:.1} ppm", ppm, max_drift);
            active
                .manifest
                .event(status.measured_at, Some(&node), "clock-drift", detail);
        }
    }

    async fn node_disconnected(&mut self, node: NodeId, reason: String) {
        let now = self.ctx.master_now();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let state = active.state();
        let Some(record) = active.manifest.participant_mut(&node) else {
            return;
        };

        let (kind, detail) = if record.settle(failed(DISCONNECTED_BEFORE_START)) {
            ("start-failed", format!("{} ({})", DISCONNECTED_BEFORE_START, reason))
        } else if record.started()
            && matches!(state, SessionState::Recording | SessionState::Stopping)
        {
            record.degrade(format!("disconnected during recording: {}", reason));
            ("disconnected", reason)
        } else {
            ("disconnected", reason)
        };
        warn!(session = %active.id(), %node, %detail, "participant disconnected");
        active.manifest.event(now, Some(&node), kind, detail);

        self.check_viable().await;
    }

    // --- Helpers -------------------------------------------------------------

    fn expect_state(
        &self,
        state: SessionState,
        op: &'static str,
    ) -> Result<Vec<NodeId>, CoordinatorError> {
        let active = self.active.as_ref().ok_or(CoordinatorError::NoSession)?;
        if active.arming || active.state() != state {
            return Err(CoordinatorError::InvalidState {
                session: active.id().clone(),
                state: active.state(),
                op,
            });
        }
        Ok(active.manifest.participants.keys().cloned().collect())
    }

    async fn live_handles(&self, ids: &[NodeId]) -> BTreeMap<NodeId, NodeHandle> {
        let mut live = BTreeMap::new();
        for id in ids {
            if let Some(handle) = self.ctx.registry.get(id).await {
                if handle.snapshot().state.is_live() {
                    live.insert(id.clone(), handle);
                }
            }
        }
        live
    }

    fn participant_mut(&mut self, node: &NodeId) -> Option<&mut ParticipantRecord> {
        self.active.as_mut()?.manifest.participant_mut(node)
    }

    async fn write_manifest(&self, manifest: &Manifest) {
        let aggregator = self.aggregator.clone();
        let manifest = manifest.clone();
        let session = manifest.session_id.clone();
        match tokio::task::spawn_blocking(move || aggregator.finalize(&manifest)).await {
            Ok(Ok(path)) => info!(%session, path = %path.display(), "manifest written"),
            Ok(Err(e)) => warn!(%session, "failed to write manifest: {}", e),
            Err(e) => warn!(%session, "manifest task failed: {}", e),
        }
    }
}

impl Internal {
    fn session(&self) -> &SessionId {
        match self {
            Internal::ArmResults { session, .. }
            | Internal::StartAck { session, .. }
            | Internal::ConfirmDeadline { session }
            | Internal::StopAck { session, .. }
            | Internal::StopDeadline { session }
            | Internal::Aggregated { session, .. } => session,
        }
    }
}

fn failed(reason: &str) -> Outcome {
    Outcome::Failed {
        reason: reason.to_string(),
    }
}

fn publish(tx: &watch::Sender<Option<SessionStatus>>, manifest: &Manifest) {
    tx.send_replace(Some(SessionStatus {
        session_id: manifest.session_id.clone(),
        state: manifest.state,
    }));
}

/// Node state changes go through the link's command queue; never block the
/// coordinator on it.
fn spawn_set_state(handle: NodeHandle, state: NodeState) {
    tokio::spawn(async move {
        if let Err(e) = handle.set_state(state).await {
            trace!(node = %handle.id(), ?state, "state change not delivered: {}", e);
        }
    });
}

/// One unretried `abort_session`. A node that misses it is not dropped.
fn spawn_abort_notice(handle: NodeHandle, params: SessionParams, timeout: Duration) {
    tokio::spawn(async move {
        let message = match Message::command(handle.next_id(), Verb::AbortSession).with_params(&params) {
            Ok(message) => message,
            Err(e) => {
                warn!(node = %handle.id(), "failed to encode abort_session: {}", e);
                return;
            }
        };
        match handle.request(message, timeout).await {
            Ok(_) => debug!(node = %handle.id(), "abort_session acknowledged"),
            Err(e) => debug!(node = %handle.id(), "abort_session not acknowledged: {}", e),
        }
        let _ = handle.set_state(NodeState::Ready).await;
    });
}

fn spawn_timer(
    tx: mpsc::Sender<Internal>,
    cancel: CancellationToken,
    wait: Duration,
    fire: Internal,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => {
                let _ = tx.send(fire).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Nanos = 1_000_000;

    #[test]
    fn lead_has_a_floor() {
        let config = SessionConfig::default();
        assert_eq!(schedule_lead(&config, MS), 300 * MS);
    }

    #[test]
    fn lead_grows_with_worst_rtt() {
        let config = SessionConfig::default();
        // 4 * 100ms + 50ms margin
        assert_eq!(schedule_lead(&config, 100 * MS), 450 * MS);
    }

    #[test]
    fn failure_reasons_read_as_labels() {
        assert_eq!(
            failed(DISCONNECTED_BEFORE_START).label(),
            "failed: disconnected-before-start"
        );
    }
}
