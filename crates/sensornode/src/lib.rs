//! Sensor node: capture bridge, local session storage and the node side of
//! the Tandem protocol.

pub mod agent;
pub mod bridge;
pub mod source;

pub use agent::{AgentError, NodeAgent};
pub use bridge::{BridgeConfig, BridgeError, BridgeReport, BridgeStats, CaptureBridge};
pub use source::{Sample, SampleSource, SyntheticSource};
