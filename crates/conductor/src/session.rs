//! Session records and the manifest written at the end of every session.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tandemproto::{AckStatus, BundleDescriptor, Nanos, NodeId, NodeStatus, SensorKind, SessionId};

use crate::clock_sync::{OffsetEstimate, OffsetPoint};

/// Session state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Armed,
    Scheduled,
    Recording,
    Stopping,
    Archived,
    Aborted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Armed => "armed",
            SessionState::Scheduled => "scheduled",
            SessionState::Recording => "recording",
            SessionState::Stopping => "stopping",
            SessionState::Archived => "archived",
            SessionState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// The one terminal record each armed node gets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Confirmed,
    Degraded { detail: String },
    Failed { reason: String },
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    pub fn label(&self) -> String {
        match self {
            Outcome::Confirmed => "confirmed".to_string(),
            Outcome::Degraded { detail } => format!("degraded: {}", detail),
            Outcome::Failed { reason } => format!("failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileTransferStatus {
    Verified,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    pub path: String,
    pub size: u64,
    pub checksum: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub status: FileTransferStatus,
}

/// Appended once aggregation has handled a node's bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub files: Vec<FileTransfer>,
    pub released: bool,
    pub completed_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Every file of `bundle` failed without a pull attempt.
    pub fn not_attempted(bundle: &BundleDescriptor, reason: &str) -> Self {
        Self {
            files: bundle
                .files
                .iter()
                .map(|f| FileTransfer {
                    path: f.path.clone(),
                    size: f.size,
                    checksum: f.checksum.clone(),
                    attempts: 0,
                    status: FileTransferStatus::Failed {
                        reason: reason.to_string(),
                    },
                })
                .collect(),
            released: false,
            completed_at: Utc::now(),
        }
    }

    pub fn all_verified(&self) -> bool {
        self.files
            .iter()
            .all(|f| f.status == FileTransferStatus::Verified)
    }

    pub fn failures(&self) -> Vec<String> {
        self.files
            .iter()
            .filter_map(|f| match &f.status {
                FileTransferStatus::Failed { reason } => Some(format!("{}: {}", f.path, reason)),
                FileTransferStatus::Verified => None,
            })
            .collect()
    }
}

/// Everything the coordinator knows about one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub node_id: NodeId,
    pub capabilities: Vec<SensorKind>,
    /// Estimate used to translate `T_start` onto the node's clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_offset: Option<OffsetEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_scheduled_local: Option<Nanos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_start_local: Option<Nanos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_start_master: Option<Nanos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_skew_ns: Option<Nanos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_status: Option<AckStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<NodeStatus>,
    #[serde(default)]
    pub preview_frames: u64,
    /// Offset estimates taken while the session was live, for read-time
    /// translation during merging.
    #[serde(default)]
    pub offset_trace: Vec<OffsetPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip)]
    pub drift_warned: bool,
}

impl ParticipantRecord {
    pub fn new(node_id: NodeId, capabilities: Vec<SensorKind>) -> Self {
        Self {
            node_id,
            capabilities,
            schedule_offset: None,
            start_command_id: None,
            t_scheduled_local: None,
            observed_start_local: None,
            observed_start_master: None,
            start_skew_ns: None,
            stop_status: None,
            bundle: None,
            transfer: None,
            last_status: None,
            preview_frames: 0,
            offset_trace: Vec::new(),
            outcome: None,
            drift_warned: false,
        }
    }

    /// Record the terminal outcome. A second call is ignored; returns
    /// whether this call set it.
    pub fn settle(&mut self, outcome: Outcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    /// Downgrade a confirmed or degraded record. Failed stays failed; an
    /// unsettled record is left for the start path to settle.
    pub fn degrade(&mut self, detail: impl Into<String>) {
        let detail = detail.into();
        self.outcome = match self.outcome.take() {
            Some(Outcome::Confirmed) => Some(Outcome::Degraded { detail }),
            Some(Outcome::Degraded { detail: prev }) => Some(Outcome::Degraded {
                detail: format!("{}; {}", prev, detail),
            }),
            other => other,
        };
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    /// Confirmed or degraded, i.e. actually recording.
    pub fn started(&self) -> bool {
        matches!(
            self.outcome,
            Some(Outcome::Confirmed) | Some(Outcome::Degraded { .. })
        )
    }
}

/// A timestamped note in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEvent {
    pub at: DateTime<Utc>,
    pub at_master: Nanos,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    pub kind: String,
    pub detail: String,
}

/// Session manifest, written to `<archive>/<session>/manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub session_id: SessionId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_start_master: Option<Nanos>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_ns: Option<Nanos>,
    pub start_tolerance_ns: Nanos,
    pub participants: BTreeMap<NodeId, ParticipantRecord>,
    pub events: Vec<ManifestEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl Manifest {
    pub fn new(session_id: SessionId, start_tolerance_ns: Nanos) -> Self {
        Self {
            session_id,
            state: SessionState::Idle,
            created_at: Utc::now(),
            t_start_master: None,
            lead_ns: None,
            start_tolerance_ns,
            participants: BTreeMap::new(),
            events: Vec::new(),
            abort_reason: None,
        }
    }

    pub fn event(
        &mut self,
        at_master: Nanos,
        node: Option<&NodeId>,
        kind: &str,
        detail: impl Into<String>,
    ) {
        self.events.push(ManifestEvent {
            at: Utc::now(),
            at_master,
            node: node.cloned(),
            kind: kind.to_string(),
            detail: detail.into(),
        });
    }

    pub fn participant_mut(&mut self, node: &NodeId) -> Option<&mut ParticipantRecord> {
        self.participants.get_mut(node)
    }

    /// Every participant has exactly one terminal record.
    pub fn is_complete(&self) -> bool {
        self.participants.values().all(|p| p.outcome.is_some())
    }

    pub fn started_count(&self) -> usize {
        self.participants.values().filter(|p| p.started()).count()
    }

    pub fn outcome_of(&self, node: &NodeId) -> Option<&Outcome> {
        self.participants.get(node).and_then(|p| p.outcome.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tandemproto::BundleFile;

    #[test]
    fn unreachable_bundle_fails_every_file_without_attempts() {
        let bundle = BundleDescriptor {
            session_id: SessionId::new("s"),
            node_id: NodeId::new("n"),
            files: vec![
                BundleFile {
                    path: "gsr.log".into(),
                    size: 10,
                    checksum: "aa".into(),
                },
                BundleFile {
                    path: "ppg.log".into(),
                    size: 20,
                    checksum: "bb".into(),
                },
            ],
            storage_error: None,
        };
        let record = TransferRecord::not_attempted(&bundle, "node unreachable");
        assert!(!record.all_verified());
        assert!(!record.released);
        assert!(record.files.iter().all(|f| f.attempts == 0));
        assert_eq!(
            record.failures(),
            vec![
                "gsr.log: node unreachable".to_string(),
                "ppg.log: node unreachable".to_string()
            ]
        );
    }

    #[test]
    fn settle_is_once() {
        let mut p = ParticipantRecord::new(NodeId::new("a"), vec![]);
        assert!(p.settle(Outcome::Confirmed));
        assert!(!p.settle(Outcome::Failed {
            reason: "late".into()
        }));
        assert_eq!(p.outcome, Some(Outcome::Confirmed));
    }

    #[test]
    fn degrade_accumulates_but_never_revives() {
        let mut p = ParticipantRecord::new(NodeId::new("a"), vec![]);
        p.settle(Outcome::Confirmed);
        p.degrade("storage failed");
        p.degrade("transfer failed");
        assert_eq!(
            p.outcome,
            Some(Outcome::Degraded {
                detail: "storage failed; transfer failed".into()
            })
        );

        let mut q = ParticipantRecord::new(NodeId::new("b"), vec![]);
        q.settle(Outcome::Failed {
            reason: "confirm-timeout".into(),
        });
        q.degrade("anything");
        assert!(q.outcome.as_ref().unwrap().is_failed());

        let mut r = ParticipantRecord::new(NodeId::new("c"), vec![]);
        r.degrade("early");
        assert!(r.outcome.is_none());
    }

    #[test]
    fn manifest_serializes_outcomes_tagged() {
        let mut m = Manifest::new(SessionId::new("s"), 5_000_000);
        let mut p = ParticipantRecord::new(NodeId::new("a"), vec![SensorKind::Gsr]);
        p.settle(Outcome::Failed {
            reason: "disconnected-before-start".into(),
        });
        m.participants.insert(p.node_id.clone(), p);
        m.event(10, Some(&NodeId::new("a")), "disconnect", "socket closed");

        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["participants"]["a"]["outcome"]["outcome"], "failed");
        assert_eq!(
            json["participants"]["a"]["outcome"]["reason"],
            "disconnected-before-start"
        );
        assert_eq!(json["state"], "idle");
        assert!(m.is_complete());

        let back: Manifest = serde_json::from_value(json).unwrap();
        assert_eq!(back.participants.len(), 1);
    }
}
