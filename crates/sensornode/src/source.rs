//! Sample sources feeding a capture bridge.

use std::sync::Arc;
use std::time::Duration;

use tandemproto::{Clock, Nanos, SensorKind};

/// One captured unit, stamped with the node's local monotonic clock.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp_ns: Nanos,
    pub payload: Vec<u8>,
}

/// A latency-sensitive producer of samples. Runs on its own OS thread.
pub trait SampleSource: Send + 'static {
    /// Stream name, used as the storage log name.
    fn stream(&self) -> &str;

    fn kind(&self) -> SensorKind;

    /// Block until the next sample. `None` ends the stream.
    fn next_sample(&mut self) -> Option<Sample>;

    /// Reset per-session state before a new capture.
    fn restart(&mut self);
}

/// Fixed-rate generator standing in for a real sensor driver.
pub struct SyntheticSource {
    kind: SensorKind,
    stream: String,
    clock: Arc<dyn Clock>,
    period_ns: Nanos,
    next_due: Nanos,
    seq: u64,
    limit: Option<u64>,
}

impl SyntheticSource {
    pub fn new(kind: SensorKind, clock: Arc<dyn Clock>, rate_hz: u32) -> Self {
        let period_ns = 1_000_000_000 / rate_hz.max(1) as Nanos;
        let next_due = clock.now_ns();
        Self {
            kind,
            stream: kind.as_str().to_string(),
            clock,
            period_ns,
            next_due,
            seq: 0,
            limit: None,
        }
    }

    /// End the stream after `samples` samples per session.
    pub fn with_limit(mut self, samples: u64) -> Self {
        self.limit = Some(samples);
        self
    }

    fn value(&self) -> f32 {
        let phase = self.seq as f32 * 0.05;
        match self.kind {
            SensorKind::Gsr => 2.0 + 0.1 * phase.sin(),
            SensorKind::Ppg => (phase * 4.0).sin(),
            SensorKind::Thermal => 33.5 + 0.01 * phase.cos(),
            _ => phase.sin(),
        }
    }
}

impl SampleSource for SyntheticSource {
    fn stream(&self) -> &str {
        &self.stream
    }

    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn next_sample(&mut self) -> Option<Sample> {
        if self.limit.is_some_and(|limit| self.seq >= limit) {
            return None;
        }

        let wait = self.clock.until(self.next_due);
        if wait > Duration::ZERO {
            std::thread::sleep(wait);
        }

        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&self.seq.to_be_bytes());
        payload.extend_from_slice(&self.value().to_be_bytes());

        let sample = Sample {
            timestamp_ns: self.clock.now_ns(),
            payload,
        };
        self.seq += 1;
        self.next_due += self.period_ns;
        Some(sample)
    }

    fn restart(&mut self) {
        self.seq = 0;
        self.next_due = self.clock.now_ns();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandemproto::ManualClock;

    #[test]
    fn stamps_with_local_clock_and_stops_at_limit() {
        let clock = ManualClock::starting_at(5_000);
        let mut source = SyntheticSource::new(SensorKind::Gsr, Arc::new(clock.clone()), 1_000)
            .with_limit(2);

        let first = source.next_sample().unwrap();
        assert_eq!(first.timestamp_ns, 5_000);
        assert_eq!(&first.payload[..8], &0u64.to_be_bytes());

        clock.advance(Duration::from_millis(1));
        let second = source.next_sample().unwrap();
        assert_eq!(second.timestamp_ns, 1_005_000);
        assert!(source.next_sample().is_none());

        source.restart();
        assert!(source.next_sample().is_some());
        assert_eq!(source.stream(), "gsr");
    }
}
