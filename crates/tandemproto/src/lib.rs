//! Tandem wire protocol.
//!
//! Shared by the conductor and sensor nodes: the length-prefixed JSON
//! framing, the message envelope and its typed payloads, local monotonic
//! clocks, and bounded retry policies.

pub mod clock;
pub mod frame;
pub mod message;
pub mod params;
pub mod retry;
pub mod types;

pub use clock::{duration_ns, Clock, ManualClock, MonotonicClock, Nanos};
pub use frame::{encode_frame, FrameCodec, FrameError, MAX_FRAME_SIZE};
pub use message::{AckStatus, EventKind, Message, MessageKind, Verb};
pub use params::{
    BundleDescriptor, BundleFile, CaptureFault, Handshake, NodeStatus, PreviewFrame, PullChunk,
    PullRequest, SessionParams, StartConfirmed, StartParams, PROTOCOL_VERSION,
};
pub use retry::{retry, FailureClass, RetryError, RetryPolicies, RetryPolicy, Transient};
pub use types::{NodeId, SensorKind, SessionId};
