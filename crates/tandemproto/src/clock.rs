//! Local monotonic clocks.
//!
//! Every timestamp on the wire is an `i64` nanosecond reading of the
//! sender's own monotonic clock. Clocks never jump backwards and have an
//! arbitrary epoch, so readings from two machines are only comparable
//! through an estimated offset.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Nanoseconds on some monotonic timeline.
pub type Nanos = i64;

/// A monotonic time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current reading in nanoseconds.
    fn now_ns(&self) -> Nanos;

    /// How long until this clock reads `target`. Zero if already past.
    fn until(&self, target: Nanos) -> Duration {
        let delta = target.saturating_sub(self.now_ns());
        if delta <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(delta as u64)
        }
    }
}

fn process_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// `std::time::Instant`-backed clock.
///
/// All instances in a process share one anchor, so two clocks built with
/// different skews differ by exactly that skew. That makes simulated nodes
/// with known offsets trivial to set up.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock {
    skew_ns: Nanos,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { skew_ns: 0 }
    }

    /// A clock that reads `skew_ns` ahead of the process clock.
    pub fn with_skew(skew_ns: Nanos) -> Self {
        Self { skew_ns }
    }

    pub fn skew_ns(&self) -> Nanos {
        self.skew_ns
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> Nanos {
        process_anchor().elapsed().as_nanos() as Nanos + self.skew_ns
    }
}

/// Hand-driven clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn starting_at(ns: Nanos) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(ns)),
        }
    }

    pub fn set(&self, ns: Nanos) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as Nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> Nanos {
        self.now.load(Ordering::SeqCst)
    }
}

/// Convert a duration to signed nanoseconds, saturating.
pub fn duration_ns(d: Duration) -> Nanos {
    d.as_nanos().min(Nanos::MAX as u128) as Nanos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skewed_clocks_differ_by_skew() {
        let base = MonotonicClock::new();
        let ahead = MonotonicClock::with_skew(5_000_000_000);

        let a = base.now_ns();
        let b = ahead.now_ns();
        let c = base.now_ns();

        // b was read between a and c
        assert!(b - 5_000_000_000 >= a);
        assert!(b - 5_000_000_000 <= c);
    }

    #[test]
    fn monotonic_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let mut last = clock.now_ns();
        for _ in 0..1000 {
            let now = clock.now_ns();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn manual_clock_until() {
        let clock = ManualClock::starting_at(1_000);
        assert_eq!(clock.until(1_500), Duration::from_nanos(500));
        clock.advance(Duration::from_nanos(600));
        assert_eq!(clock.now_ns(), 1_600);
        assert_eq!(clock.until(1_500), Duration::ZERO);
    }
}
