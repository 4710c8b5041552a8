//! The message envelope.
//!
//! Every frame body is one JSON object with a fixed set of top-level fields.
//! Which optional fields must be present depends on `type`; [`Message::validate`]
//! enforces that so a structurally broken message can be counted as a protocol
//! violation instead of being half-handled.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::Nanos;
use crate::frame::FrameError;

/// Top-level message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Handshake,
    Command,
    Ack,
    /// Unsolicited node-to-master event.
    Async,
    SyncReq,
    SyncResp,
}

/// Command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    ArmSession,
    StartRecording,
    StopRecording,
    PullBundle,
    ReleaseBundle,
    AbortSession,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::ArmSession => "arm_session",
            Verb::StartRecording => "start_recording",
            Verb::StopRecording => "stop_recording",
            Verb::PullBundle => "pull_bundle",
            Verb::ReleaseBundle => "release_bundle",
            Verb::AbortSession => "abort_session",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Async event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StartConfirmed,
    Status,
    Preview,
    CaptureFault,
}

/// Outcome carried by an ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Rejected { reason: String },
    /// Command took effect but something is wrong (e.g. storage failed).
    Degraded { detail: String },
}

impl AckStatus {
    pub fn rejected(reason: impl Into<String>) -> Self {
        AckStatus::Rejected {
            reason: reason.into(),
        }
    }

    pub fn degraded(detail: impl Into<String>) -> Self {
        AckStatus::Degraded {
            detail: detail.into(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, AckStatus::Rejected { .. })
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<Verb>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AckStatus>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    /// Sender's local clock at the moment of sending.
    #[serde(default)]
    pub t_local: Nanos,
    /// Execution instant on the receiver's clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_scheduled: Option<Nanos>,
}

impl Message {
    fn bare(id: u64, kind: MessageKind) -> Self {
        Self {
            id,
            kind,
            verb: None,
            event: None,
            ack_id: None,
            status: None,
            params: serde_json::Value::Null,
            t_local: 0,
            t_scheduled: None,
        }
    }

    pub fn handshake(id: u64) -> Self {
        Self::bare(id, MessageKind::Handshake)
    }

    pub fn command(id: u64, verb: Verb) -> Self {
        Self {
            verb: Some(verb),
            ..Self::bare(id, MessageKind::Command)
        }
    }

    pub fn ack(id: u64, ack_id: u64, status: AckStatus) -> Self {
        Self {
            ack_id: Some(ack_id),
            status: Some(status),
            ..Self::bare(id, MessageKind::Ack)
        }
    }

    pub fn event(id: u64, event: EventKind) -> Self {
        Self {
            event: Some(event),
            ..Self::bare(id, MessageKind::Async)
        }
    }

    pub fn sync_req(id: u64) -> Self {
        Self::bare(id, MessageKind::SyncReq)
    }

    /// Reply to a `sync_req`; `t_local` is stamped by the responder.
    pub fn sync_resp(id: u64, request_id: u64, t_local: Nanos) -> Self {
        Self {
            ack_id: Some(request_id),
            t_local,
            ..Self::bare(id, MessageKind::SyncResp)
        }
    }

    pub fn with_params<T: Serialize>(mut self, params: &T) -> Result<Self, FrameError> {
        self.params = serde_json::to_value(params)?;
        Ok(self)
    }

    pub fn with_scheduled(mut self, t_scheduled: Nanos) -> Self {
        self.t_scheduled = Some(t_scheduled);
        self
    }

    pub fn stamped(mut self, t_local: Nanos) -> Self {
        self.t_local = t_local;
        self
    }

    /// Deserialize `params` into a typed payload.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_value(self.params.clone()).map_err(FrameError::from)
    }

    /// Parse a frame body and check the per-type required fields.
    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        let msg: Message = serde_json::from_slice(body)?;
        msg.validate()?;
        Ok(msg)
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        let missing = match self.kind {
            MessageKind::Command if self.verb.is_none() => Some("verb"),
            MessageKind::Ack if self.ack_id.is_none() => Some("ack_id"),
            MessageKind::Ack if self.status.is_none() => Some("status"),
            MessageKind::Async if self.event.is_none() => Some("event"),
            MessageKind::SyncResp if self.ack_id.is_none() => Some("ack_id"),
            _ => None,
        };
        match missing {
            Some(field) => Err(FrameError::MissingField {
                kind: self.kind,
                field,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::StartParams;
    use crate::types::SessionId;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_wire_shape() {
        let msg = Message::command(7, Verb::StartRecording)
            .with_params(&StartParams {
                session_id: SessionId::new("s1"),
                t_start_master: 1_000,
            })
            .unwrap()
            .with_scheduled(1_500)
            .stamped(900);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["verb"], "start_recording");
        assert_eq!(json["t_scheduled"], 1_500);
        assert_eq!(json["params"]["t_start_master"], 1_000);
        assert!(json.get("ack_id").is_none());
    }

    #[test]
    fn ack_status_is_tagged() {
        let msg = Message::ack(3, 7, AckStatus::rejected("busy"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["status"]["code"], "rejected");
        assert_eq!(json["status"]["reason"], "busy");

        let ok = serde_json::to_value(Message::ack(4, 7, AckStatus::Ok)).unwrap();
        assert_eq!(ok["status"], serde_json::json!({"code": "ok"}));
    }

    #[test]
    fn decode_rejects_missing_fields() {
        let body = br#"{"id":1,"type":"ack","t_local":5}"#;
        let err = Message::decode(body).unwrap_err();
        assert!(matches!(
            err,
            FrameError::MissingField {
                kind: MessageKind::Ack,
                field: "ack_id"
            }
        ));

        let body = br#"{"id":1,"type":"command"}"#;
        assert!(Message::decode(body).is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Message::decode(b"not json"),
            Err(FrameError::Json(_))
        ));
        assert!(Message::decode(br#"{"id":1,"type":"teleport"}"#).is_err());
    }

    #[test]
    fn sync_resp_roundtrip() {
        let msg = Message::sync_resp(9, 4, 123_456);
        let body = serde_json::to_vec(&msg).unwrap();
        let back = Message::decode(&body).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.ack_id, Some(4));
    }
}
