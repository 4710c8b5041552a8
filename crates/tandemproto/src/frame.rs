//! Length-prefixed framing over a byte stream.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| body (UTF-8 JSON, length) |
//! +----------------+---------------------------+
//! ```
//!
//! The codec splits frames without looking inside them. Parsing the body is
//! a separate step ([`Message::decode`]) so that a frame with a bad body can
//! be counted and skipped while the stream itself stays aligned. A length
//! prefix above [`MAX_FRAME_SIZE`] means the stream can no longer be trusted
//! and is fatal.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Message, MessageKind};

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Maximum body size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors from framing and message parsing.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed message body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind:?} message missing required field `{field}`")]
    MissingField {
        kind: MessageKind,
        field: &'static str,
    },
}

impl FrameError {
    /// Whether the connection must be torn down. Anything else is a
    /// per-message protocol violation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Io(_) | FrameError::FrameTooLarge { .. })
    }
}

/// Splits a byte stream into frame bodies; encodes messages as frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let needed = LENGTH_PREFIX_LEN + len;
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = serde_json::to_vec(&msg)?;
        if body.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(LENGTH_PREFIX_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Encode one message into a standalone frame.
pub fn encode_frame(msg: Message) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(msg, &mut buf)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckStatus, Verb};
    use crate::params::PullChunk;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_frames_wait_for_more() {
        let frame = encode_frame(Message::command(1, Verb::ArmSession)).unwrap();
        let mut codec = FrameCodec::new();

        let mut buf = BytesMut::from(&frame[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[2..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        let body = codec.decode(&mut buf).unwrap().unwrap();
        let msg = Message::decode(&body).unwrap();
        assert_eq!(msg.verb, Some(Verb::ArmSession));
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames() {
        let mut buf = BytesMut::new();
        let mut codec = FrameCodec::new();
        codec.encode(Message::sync_req(1), &mut buf).unwrap();
        codec.encode(Message::sync_req(2), &mut buf).unwrap();

        let first = Message::decode(&codec.decode(&mut buf).unwrap().unwrap()).unwrap();
        let second = Message::decode(&codec.decode(&mut buf).unwrap().unwrap()).unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversize_prefix_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
    }

    #[test]
    fn bad_body_keeps_stream_aligned() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.extend_from_slice(b"{bad}");
        let mut codec = FrameCodec::new();
        codec.encode(Message::sync_req(3), &mut buf).unwrap();

        let junk = codec.decode(&mut buf).unwrap().unwrap();
        let err = Message::decode(&junk).unwrap_err();
        assert!(!err.is_fatal());

        let next = Message::decode(&codec.decode(&mut buf).unwrap().unwrap()).unwrap();
        assert_eq!(next.id, 3);
    }

    #[test]
    fn largest_pull_chunk_fits_one_frame() {
        let bytes = vec![0xa5u8; tandemconf::MAX_CHUNK_SIZE];
        let chunk = PullChunk::new(0, &bytes, u64::MAX);
        let ack = Message::ack(7, 3, AckStatus::Ok)
            .with_params(&chunk)
            .unwrap()
            .stamped(1);
        let frame = encode_frame(ack).unwrap();
        assert!(frame.len() <= LENGTH_PREFIX_LEN + MAX_FRAME_SIZE);

        let past_limit = vec![0xa5u8; 13 * 1024 * 1024];
        let too_big = Message::ack(8, 4, AckStatus::Ok)
            .with_params(&PullChunk::new(0, &past_limit, u64::MAX))
            .unwrap();
        assert!(encode_frame(too_big).unwrap_err().is_fatal());
    }

    #[test]
    fn small_limit_rejects_encode() {
        let mut codec = FrameCodec::with_max_frame_size(8);
        let mut buf = BytesMut::new();
        assert!(codec.encode(Message::sync_req(1), &mut buf).is_err());
    }
}
