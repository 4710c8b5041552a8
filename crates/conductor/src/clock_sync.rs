//! Clock sync engine.
//!
//! Offsets are estimated with a two-timestamp exchange. The master stamps
//! `t0` when a `sync_req` leaves the link task, the node echoes its own clock
//! `t1` as soon as the request arrives, and the link task stamps `t2` when
//! the `sync_resp` frame is read. Assuming a symmetric path:
//!
//! ```text
//! rtt    = t2 - t0
//! offset = t1 - (t0 + rtt / 2)        // node_clock - master_clock
//! ```
//!
//! The true offset lies within `rtt / 2` of each sample's estimate, so the
//! minimum-RTT sample of a round is the tightest one.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tandemconf::SyncConfig;
use tandemproto::{duration_ns, Nanos};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::link::{LinkError, NodeHandle};

/// One request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    /// Master clock when the request was sent
    pub t0: Nanos,
    /// Node clock when the request was answered
    pub t1: Nanos,
    /// Master clock when the response was received
    pub t2: Nanos,
}

impl ClockSample {
    pub fn rtt(&self) -> Nanos {
        self.t2 - self.t0
    }

    pub fn offset(&self) -> Nanos {
        self.t1 - (self.t0 + self.rtt() / 2)
    }
}

/// Result of one estimation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetEstimate {
    /// node_clock - master_clock
    pub offset_ns: Nanos,
    /// RTT of the selected sample
    pub rtt_ns: Nanos,
    /// Half-width of the interval the true offset is believed to lie in.
    pub confidence_ns: Nanos,
    /// Samples retained after filtering.
    pub samples: u32,
}

impl OffsetEstimate {
    /// Translate a node-local instant to master time.
    pub fn to_master(&self, local: Nanos) -> Nanos {
        local - self.offset_ns
    }

    /// Translate a master instant to the node's clock.
    pub fn to_local(&self, master: Nanos) -> Nanos {
        master + self.offset_ns
    }
}

/// Pick the minimum-RTT sample among those under the ceiling.
///
/// Returns `None` when nothing survives filtering.
pub fn estimate_round(samples: &[ClockSample], max_rtt_ns: Nanos) -> Option<OffsetEstimate> {
    let retained: Vec<&ClockSample> = samples
        .iter()
        .filter(|s| s.rtt() >= 0 && s.rtt() <= max_rtt_ns)
        .collect();

    let best = retained.iter().min_by_key(|s| s.rtt())?;

    let (lo, hi) = retained
        .iter()
        .map(|s| s.offset())
        .fold((Nanos::MAX, Nanos::MIN), |(lo, hi), o| (lo.min(o), hi.max(o)));
    let spread = hi - lo;

    Some(OffsetEstimate {
        offset_ns: best.offset(),
        rtt_ns: best.rtt(),
        confidence_ns: (best.rtt() / 2).max(spread / 2),
        samples: retained.len() as u32,
    })
}

/// An estimate stamped with when it was taken (master clock).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffsetPoint {
    pub at_master: Nanos,
    pub offset_ns: Nanos,
    pub confidence_ns: Nanos,
}

/// Sliding window of estimates for one node.
#[derive(Debug, Clone)]
pub struct ClockTrack {
    window: VecDeque<OffsetPoint>,
    capacity: usize,
    alpha: f64,
    smoothed: Option<f64>,
}

impl ClockTrack {
    pub fn new(capacity: usize, alpha: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            alpha,
            smoothed: None,
        }
    }

    pub fn push(&mut self, at_master: Nanos, estimate: &OffsetEstimate) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(OffsetPoint {
            at_master,
            offset_ns: estimate.offset_ns,
            confidence_ns: estimate.confidence_ns,
        });

        let x = estimate.offset_ns as f64;
        self.smoothed = Some(match self.smoothed {
            Some(prev) => self.alpha * x + (1.0 - self.alpha) * prev,
            None => x,
        });
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn latest(&self) -> Option<&OffsetPoint> {
        self.window.back()
    }

    pub fn smoothed_offset_ns(&self) -> Option<f64> {
        self.smoothed
    }

    /// Least-squares slope of offset over time, in parts per million.
    ///
    /// Needs at least three points spread over a non-zero interval.
    pub fn drift_ppm(&self) -> Option<f64> {
        if self.window.len() < 3 {
            return None;
        }
        let n = self.window.len() as f64;
        let t_ref = self.window.front()?.at_master;
        let o_ref = self.window.front()?.offset_ns;

        let (mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0);
        for p in &self.window {
            let x = (p.at_master - t_ref) as f64;
            let y = (p.offset_ns - o_ref) as f64;
            sx += x;
            sy += y;
            sxx += x * x;
            sxy += x * y;
        }
        let denom = n * sxx - sx * sx;
        if denom.abs() < f64::EPSILON {
            return None;
        }
        Some((n * sxy - sx * sy) / denom * 1e6)
    }

    pub fn trace(&self) -> Vec<OffsetPoint> {
        self.window.iter().copied().collect()
    }

    /// Record a round's estimate and summarize the track for the registry.
    pub fn observe(&mut self, at_master: Nanos, estimate: OffsetEstimate) -> ClockStatus {
        self.push(at_master, &estimate);
        ClockStatus {
            estimate,
            measured_at: at_master,
            smoothed_offset_ns: self.smoothed.unwrap_or(estimate.offset_ns as f64),
            drift_ppm: self.drift_ppm(),
        }
    }
}

/// Anything that can perform a single sync exchange.
#[async_trait]
pub trait ExchangeProbe: Send + Sync {
    async fn exchange(&self, timeout: Duration) -> Result<ClockSample, LinkError>;
}

/// Outcome of one round of K exchanges.
#[derive(Debug, Clone, Default)]
pub struct RoundOutcome {
    pub samples: Vec<ClockSample>,
    pub missing: u32,
    pub over_ceiling: u32,
    pub estimate: Option<OffsetEstimate>,
}

/// Timeouts in a row, with nothing answered yet, after which a round gives up.
pub const MUTE_AFTER: u32 = 2;

/// Run one estimation round. Stops early if the link goes away or the node
/// has not answered any of the first [`MUTE_AFTER`] exchanges.
pub async fn run_round<P: ExchangeProbe + ?Sized>(probe: &P, config: &SyncConfig) -> RoundOutcome {
    let mut outcome = RoundOutcome::default();
    let max_rtt = duration_ns(config.max_rtt());

    for _ in 0..config.samples() {
        if outcome.samples.is_empty() && outcome.missing >= MUTE_AFTER {
            debug!(missing = outcome.missing, "sync round abandoned, node silent");
            break;
        }
        match probe.exchange(config.exchange_timeout()).await {
            Ok(sample) => {
                trace!(rtt = sample.rtt(), offset = sample.offset(), "sync sample");
                if sample.rtt() > max_rtt || sample.rtt() < 0 {
                    outcome.over_ceiling += 1;
                }
                outcome.samples.push(sample);
            }
            Err(LinkError::Timeout { .. }) => outcome.missing += 1,
            Err(e) => {
                debug!(error = %e, "sync round cut short");
                outcome.missing += 1;
                break;
            }
        }
    }

    outcome.estimate = estimate_round(&outcome.samples, max_rtt);
    outcome
}

/// What a node's resync task reports after each round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockStatus {
    pub estimate: OffsetEstimate,
    /// Master clock when the round finished.
    pub measured_at: Nanos,
    pub smoothed_offset_ns: f64,
    pub drift_ppm: Option<f64>,
}

impl ClockStatus {
    /// The estimate start times are translated with: the smoothed offset,
    /// bounded by the latest round's rtt and confidence.
    pub fn scheduling_estimate(&self) -> OffsetEstimate {
        OffsetEstimate {
            offset_ns: self.smoothed_offset_ns.round() as Nanos,
            ..self.estimate
        }
    }
}

/// Re-estimate a node's offset every `resync_interval` until cancelled.
///
/// The first round starts immediately. Results go to the node's link task,
/// which owns the node snapshot.
pub fn spawn_resync(
    handle: NodeHandle,
    config: SyncConfig,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut track = ClockTrack::new(config.window, config.ewma_alpha);
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = run_round(&handle, &config) => outcome,
            };

            match outcome.estimate {
                Some(estimate) => {
                    let status = track.observe(handle.master_now(), estimate);
                    if let Some(ppm) = status.drift_ppm {
                        if ppm.abs() > config.max_drift_ppm {
                            warn!(node = %handle.id(), drift_ppm = ppm, "clock drift above limit");
                        }
                    }
                    debug!(
                        node = %handle.id(),
                        offset_ns = estimate.offset_ns,
                        rtt_ns = estimate.rtt_ns,
                        confidence_ns = estimate.confidence_ns,
                        smoothed_offset_ns = status.smoothed_offset_ns,
                        "clock estimate updated"
                    );
                    if handle.update_clock(status).await.is_err() {
                        break;
                    }
                }
                None => {
                    let reason = format!(
                        "no usable sync samples ({} missing, {} over rtt ceiling)",
                        outcome.missing, outcome.over_ceiling
                    );
                    warn!(node = %handle.id(), %reason, "clock degraded");
                    if handle.mark_clock_degraded(reason).await.is_err() {
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.resync_interval()) => {}
            }
        }
        debug!(node = %handle.id(), "resync task exiting");
    })
}
