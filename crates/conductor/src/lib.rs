//! Conductor: the master side of a Tandem recording rig.
//!
//! Accepts sensor node connections, keeps every node's clock offset
//! estimate fresh, runs the session state machine, and pulls finished
//! bundles into the central archive.

pub mod aggregate;
pub mod clock_sync;
pub mod context;
pub mod coordinator;
pub mod link;
pub mod registry;
pub mod server;
pub mod session;
pub mod telemetry;

pub use aggregate::Aggregator;
pub use clock_sync::{
    estimate_round, run_round, ClockSample, ClockStatus, ClockTrack, ExchangeProbe, OffsetEstimate,
    OffsetPoint, RoundOutcome,
};
pub use context::ConductorContext;
pub use coordinator::{
    schedule_lead, ArmError, Coordinator, CoordinatorError, CoordinatorHandle, SessionStatus,
    StartPlan, CONFIRM_TIMEOUT, DISCONNECTED_BEFORE_START,
};
pub use link::{CommandAck, CommandError, LinkError, NodeEvent, NodeHandle};
pub use registry::{NodeSnapshot, NodeState, Registry, UnreadyReason};
pub use server::{start, RunningConductor};
pub use session::{
    FileTransfer, FileTransferStatus, Manifest, ManifestEvent, Outcome, ParticipantRecord,
    SessionState, TransferRecord,
};
