//! Timing knobs for clock sync, sessions, retries, transfers, links and nodes.
//!
//! Durations are stored as integer milliseconds (or microseconds where the
//! field name says so) so they read naturally in TOML. Each section has
//! accessors returning `Duration`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Clock sync engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Exchanges per estimation round (K). Values below 3 are raised to 3.
    pub samples_per_round: u32,
    /// How long to wait for a single `sync_resp`.
    pub exchange_timeout_ms: u64,
    /// Samples with a round-trip above this ceiling are discarded.
    pub max_rtt_ms: u64,
    /// Interval between estimation rounds per node.
    pub resync_interval_ms: u64,
    /// An estimate older than this marks the node stale.
    pub staleness_ms: u64,
    /// An estimate with a wider confidence band than this is unusable.
    pub max_confidence_us: u64,
    /// Number of round estimates kept per node for drift tracking.
    pub window: usize,
    /// Smoothing factor for the exponentially weighted offset.
    pub ewma_alpha: f64,
    /// Drift beyond this is reported as a warning.
    pub max_drift_ppm: f64,
}

impl SyncConfig {
    pub fn samples(&self) -> u32 {
        self.samples_per_round.max(3)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn max_rtt(&self) -> Duration {
        Duration::from_millis(self.max_rtt_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            samples_per_round: 5,
            exchange_timeout_ms: 2_000,
            max_rtt_ms: 100,
            resync_interval_ms: 5_000,
            staleness_ms: 15_000,
            max_confidence_us: 2_000,
            window: 32,
            ewma_alpha: 0.3,
            max_drift_ppm: 200.0,
        }
    }
}

/// Session coordinator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lower bound on the scheduling lead time.
    pub min_lead_ms: u64,
    /// Lead time is at least the worst observed RTT times this factor.
    pub lead_rtt_factor: f64,
    /// Added on top of the RTT-derived lead.
    pub lead_margin_ms: u64,
    /// How long after the scheduled start a node may take to confirm.
    pub confirm_timeout_ms: u64,
    /// How long to wait for stop confirmations before archiving anyway.
    pub stop_timeout_ms: u64,
    /// Observed start instants further than this from `T_start` are degraded.
    pub start_tolerance_us: u64,
}

impl SessionConfig {
    pub fn min_lead(&self) -> Duration {
        Duration::from_millis(self.min_lead_ms)
    }

    pub fn lead_margin(&self) -> Duration {
        Duration::from_millis(self.lead_margin_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_lead_ms: 300,
            lead_rtt_factor: 4.0,
            lead_margin_ms: 50,
            confirm_timeout_ms: 2_000,
            stop_timeout_ms: 5_000,
            start_tolerance_us: 5_000,
        }
    }
}

/// Retry policy parameters, one set per failure class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Per-attempt ack timeout for commands.
    pub command_timeout_ms: u64,
    /// Resends after the first attempt before the node is dropped.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Node-side reconnect backoff.
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Reconnect attempts before the node agent gives up.
    pub reconnect_max_attempts: u32,
}

impl RetryConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 1_000,
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 2_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 10_000,
            reconnect_max_attempts: 20,
        }
    }
}

/// Largest `transfer.chunk_size` whose base64 `pull_bundle` ack still fits in
/// one 16 MiB frame, with 64 KiB left for the message envelope.
pub const MAX_CHUNK_SIZE: usize = (16 * 1024 * 1024 - 64 * 1024) / 4 * 3;

/// Bundle aggregation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes requested per `pull_bundle` chunk.
    pub chunk_size: usize,
    /// Whole-file attempts before a checksum mismatch is recorded as failed.
    pub max_attempts: u32,
    /// Per-chunk ack timeout.
    pub chunk_timeout_ms: u64,
    /// Tell the node to delete a bundle once every file verified.
    pub release_after_verify: bool,
}

impl TransferConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            max_attempts: 3,
            chunk_timeout_ms: 5_000,
            release_after_verify: false,
        }
    }
}

/// Per-connection protocol settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// How long a fresh connection may take to send its handshake.
    pub handshake_timeout_ms: u64,
    /// Protocol violations tolerated before the connection is torn down.
    pub max_violations: u32,
    /// Resolved command-ids remembered to tell late acks from unknown ones.
    pub ack_ledger_size: usize,
}

impl LinkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            max_violations: 8,
            ack_ledger_size: 1_024,
        }
    }
}

/// Sensor node settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node identity announced in the handshake.
    pub node_id: String,
    /// Declared sensor kinds (e.g. "camera", "thermal", "gsr", "ppg").
    pub capabilities: Vec<String>,
    /// Archival ring capacity in samples.
    pub archive_queue_capacity: usize,
    /// Preview ring capacity in samples.
    pub preview_queue_capacity: usize,
    /// Rate of the built-in synthetic sources.
    pub sample_rate_hz: u32,
    /// How often the preview ring is sampled for `preview` events.
    pub preview_interval_ms: u64,
    /// How often `status` events are sent.
    pub status_interval_ms: u64,
}

impl NodeConfig {
    pub fn preview_interval(&self) -> Duration {
        Duration::from_millis(self.preview_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node".to_string(),
            capabilities: vec!["gsr".to_string()],
            archive_queue_capacity: 4_096,
            preview_queue_capacity: 64,
            sample_rate_hz: 100,
            preview_interval_ms: 250,
            status_interval_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_at_least_three() {
        let config = SyncConfig {
            samples_per_round: 1,
            ..Default::default()
        };
        assert_eq!(config.samples(), 3);
        assert_eq!(SyncConfig::default().samples(), 5);
    }

    #[test]
    fn duration_accessors() {
        let session = SessionConfig::default();
        assert_eq!(session.min_lead(), Duration::from_millis(300));
        assert_eq!(session.stop_timeout(), Duration::from_secs(5));
        assert_eq!(RetryConfig::default().command_timeout(), Duration::from_secs(1));
    }
}
