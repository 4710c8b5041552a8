//! Typed payloads carried in a message's `params` field.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::clock::Nanos;
use crate::types::{NodeId, SensorKind, SessionId};

/// Protocol identifier a node announces in its handshake.
pub const PROTOCOL_VERSION: &str = "TANDEM1";

/// First message a node sends on a new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: NodeId,
    pub capabilities: Vec<SensorKind>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    PROTOCOL_VERSION.to_string()
}

/// Params for `arm_session`, `stop_recording`, `release_bundle` and `abort_session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SessionParams {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Params for `start_recording`. The message's `t_scheduled` holds the
/// same instant translated onto the node's own clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartParams {
    pub session_id: SessionId,
    pub t_start_master: Nanos,
}

/// `start_confirmed` event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartConfirmed {
    pub session_id: SessionId,
    /// Id of the `start_recording` command being confirmed.
    pub command_id: u64,
    /// Node-local instant capture actually began.
    pub t_observed_local: Nanos,
}

/// Params for `pull_bundle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub session_id: SessionId,
    pub path: String,
    pub offset: u64,
    pub max_len: u64,
}

/// Ack params for `pull_bundle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullChunk {
    pub offset: u64,
    /// Base64 (standard alphabet) of the chunk bytes.
    pub data: String,
    pub total_size: u64,
    pub eof: bool,
}

impl PullChunk {
    pub fn new(offset: u64, bytes: &[u8], total_size: u64) -> Self {
        let eof = offset + bytes.len() as u64 >= total_size;
        Self {
            offset,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            total_size,
            eof,
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.data)
    }
}

/// One file in a node's per-session bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    /// Path relative to the session directory.
    pub path: String,
    pub size: u64,
    /// Hex blake3 digest of the full file.
    pub checksum: String,
}

/// What a node reports in its `stop_recording` ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleDescriptor {
    pub session_id: SessionId,
    pub node_id: NodeId,
    pub files: Vec<BundleFile>,
    /// Set when local storage failed during the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_error: Option<String>,
}

impl BundleDescriptor {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Periodic `status` event payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub recording: bool,
    pub samples_written: u64,
    pub archive_backlog: u64,
    pub archive_blocked: u64,
    pub preview_dropped: u64,
}

/// `preview` event payload. Best-effort, never retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewFrame {
    pub stream: String,
    pub t_local: Nanos,
    /// Base64 of the sample payload.
    pub data: String,
}

impl PreviewFrame {
    pub fn new(stream: impl Into<String>, t_local: Nanos, bytes: &[u8]) -> Self {
        Self {
            stream: stream.into(),
            t_local,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

/// `capture_fault` event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureFault {
    pub session_id: SessionId,
    pub stream: String,
    pub detail: String,
}
