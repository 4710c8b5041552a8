//! Capture bridge: moves samples from a latency-sensitive source thread to
//! durable storage and to a best-effort preview consumer.
//!
//! ```text
//! acquisition thread ──push──▶ archive ring ──pop──▶ writer thread ──▶ SessionStorage
//!          │
//!          └──────push──▶ preview ring ──pop──▶ preview task (async)
//! ```
//!
//! The archive ring never drops: a full ring makes the acquisition thread
//! wait (counted in `archive_blocked`). The preview ring drops new samples
//! when full (counted in `preview_dropped`). A storage error halts the
//! bridge and is reported as a fault.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rtrb::{Consumer, Producer, PushError, RingBuffer};
use tandemproto::SessionId;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use vault::SessionStorage;

use crate::source::{Sample, SampleSource};

const WRITER_IDLE: Duration = Duration::from_micros(500);
const BLOCKED_BACKOFF: Duration = Duration::from_micros(100);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn {role} thread: {source}")]
    ThreadSpawn {
        role: &'static str,
        source: std::io::Error,
    },

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

/// Counters shared between the bridge threads and status reporting.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub captured: AtomicU64,
    pub written: AtomicU64,
    /// Pushes that found the archive ring full and had to wait.
    pub archive_blocked: AtomicU64,
    pub preview_dropped: AtomicU64,
}

impl BridgeStats {
    /// Samples captured but not yet written.
    pub fn backlog(&self) -> u64 {
        self.captured
            .load(Ordering::Relaxed)
            .saturating_sub(self.written.load(Ordering::Relaxed))
    }
}

/// Ring sizes for one bridge.
#[derive(Debug, Clone, Copy)]
pub struct BridgeConfig {
    pub archive_capacity: usize,
    pub preview_capacity: usize,
}

/// What a stopped bridge hands back.
pub struct BridgeReport {
    pub stream: String,
    pub source: Option<Box<dyn SampleSource>>,
    pub written: u64,
    pub fault: Option<String>,
}

impl std::fmt::Debug for BridgeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeReport")
            .field("stream", &self.stream)
            .field("written", &self.written)
            .field("fault", &self.fault)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Shared {
    running: AtomicBool,
    halted: AtomicBool,
    fault: Mutex<Option<String>>,
}

impl Shared {
    fn halt(&self, detail: String) {
        if let Ok(mut fault) = self.fault.lock() {
            fault.get_or_insert(detail);
        }
        self.halted.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }

    fn fault(&self) -> Option<String> {
        self.fault.lock().ok().and_then(|f| f.clone())
    }
}

/// One running source, bridged into storage for one session.
pub struct CaptureBridge {
    stream: String,
    shared: Arc<Shared>,
    stats: Arc<BridgeStats>,
    preview: Option<Consumer<Sample>>,
    acquisition: Option<JoinHandle<Box<dyn SampleSource>>>,
    writer: Option<JoinHandle<()>>,
}

impl CaptureBridge {
    /// Restart `source` and begin capturing into `session`.
    pub fn start(
        mut source: Box<dyn SampleSource>,
        session: SessionId,
        storage: Arc<dyn SessionStorage>,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let stream = source.stream().to_string();
        let shared = Arc::new(Shared::default());
        shared.running.store(true, Ordering::Release);
        let stats = Arc::new(BridgeStats::default());

        let (archive_tx, archive_rx) = RingBuffer::<Sample>::new(config.archive_capacity.max(1));
        let (preview_tx, preview_rx) = RingBuffer::<Sample>::new(config.preview_capacity.max(1));

        let writer = {
            let shared = Arc::clone(&shared);
            let stats = Arc::clone(&stats);
            let stream = stream.clone();
            thread::Builder::new()
                .name(format!("capture-writer-{}", stream))
                .spawn(move || run_writer(archive_rx, storage, session, stream, shared, stats))
                .map_err(|source| BridgeError::ThreadSpawn {
                    role: "writer",
                    source,
                })?
        };

        let acquisition = {
            let shared_acq = Arc::clone(&shared);
            let stats = Arc::clone(&stats);
            let spawned = thread::Builder::new()
                .name(format!("capture-{}", stream))
                .spawn(move || {
                    source.restart();
                    run_acquisition(source.as_mut(), archive_tx, preview_tx, &shared_acq, &stats);
                    source
                });
            match spawned {
                Ok(handle) => handle,
                Err(source) => {
                    // Writer exits once it sees the producer side gone.
                    shared.running.store(false, Ordering::Release);
                    let _ = writer.join();
                    return Err(BridgeError::ThreadSpawn {
                        role: "acquisition",
                        source,
                    });
                }
            }
        };

        info!(%stream, "capture bridge started");
        Ok(Self {
            stream,
            shared,
            stats,
            preview: Some(preview_rx),
            acquisition: Some(acquisition),
            writer: Some(writer),
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    /// The preview consumer. Can be taken once.
    pub fn take_preview(&mut self) -> Option<Consumer<Sample>> {
        self.preview.take()
    }

    /// Storage failure that halted this bridge, if any.
    pub fn fault(&self) -> Option<String> {
        self.shared.fault()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop acquisition, drain the archive ring into storage and join both
    /// threads. Blocks; call from a blocking context.
    pub fn stop(mut self) -> Result<BridgeReport, BridgeError> {
        self.shared.running.store(false, Ordering::Release);

        let source = match self.acquisition.take() {
            Some(handle) => Some(
                handle
                    .join()
                    .map_err(|_| BridgeError::Panicked("acquisition"))?,
            ),
            None => None,
        };
        if let Some(handle) = self.writer.take() {
            handle.join().map_err(|_| BridgeError::Panicked("writer"))?;
        }

        let report = BridgeReport {
            stream: self.stream.clone(),
            source,
            written: self.stats.written.load(Ordering::Relaxed),
            fault: self.shared.fault(),
        };
        info!(
            stream = %report.stream,
            written = report.written,
            blocked = self.stats.archive_blocked.load(Ordering::Relaxed),
            preview_dropped = self.stats.preview_dropped.load(Ordering::Relaxed),
            "capture bridge stopped"
        );
        Ok(report)
    }
}

impl Drop for CaptureBridge {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

fn run_acquisition(
    source: &mut dyn SampleSource,
    mut archive: Producer<Sample>,
    mut preview: Producer<Sample>,
    shared: &Shared,
    stats: &BridgeStats,
) {
    while shared.running.load(Ordering::Acquire) {
        let Some(sample) = source.next_sample() else {
            debug!(stream = source.stream(), "source ended");
            break;
        };
        stats.captured.fetch_add(1, Ordering::Relaxed);

        if let Err(PushError::Full(_)) = preview.push(sample.clone()) {
            stats.preview_dropped.fetch_add(1, Ordering::Relaxed);
        }

        let mut pending = sample;
        let mut blocked = false;
        loop {
            match archive.push(pending) {
                Ok(()) => break,
                Err(PushError::Full(back)) => {
                    pending = back;
                    if !blocked {
                        blocked = true;
                        stats.archive_blocked.fetch_add(1, Ordering::Relaxed);
                    }
                    if shared.halted.load(Ordering::Acquire) || archive.is_abandoned() {
                        return;
                    }
                    thread::sleep(BLOCKED_BACKOFF);
                }
            }
        }
    }
}

fn run_writer(
    mut archive: Consumer<Sample>,
    storage: Arc<dyn SessionStorage>,
    session: SessionId,
    stream: String,
    shared: Arc<Shared>,
    stats: Arc<BridgeStats>,
) {
    loop {
        match archive.pop() {
            Ok(sample) => {
                if let Err(e) =
                    storage.append(&session, &stream, sample.timestamp_ns, &sample.payload)
                {
                    error!(%stream, "storage append failed, halting capture: {}", e);
                    shared.halt(e.to_string());
                    return;
                }
                stats.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                if archive.is_abandoned() {
                    // The producer may have pushed once more before going away.
                    if archive.is_empty() {
                        break;
                    }
                    continue;
                }
                thread::sleep(WRITER_IDLE);
            }
        }
    }

    if let Err(e) = storage.flush(&session) {
        warn!(%stream, "storage flush failed: {}", e);
        shared.halt(e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SyntheticSource;
    use std::sync::atomic::AtomicUsize;
    use tandemproto::{BundleDescriptor, MonotonicClock, NodeId, SensorKind};
    use vault::{read_records, FileSessionStorage, StorageError};

    fn synthetic(limit: u64) -> Box<dyn SampleSource> {
        Box::new(
            SyntheticSource::new(SensorKind::Gsr, Arc::new(MonotonicClock::new()), 10_000)
                .with_limit(limit),
        )
    }

    fn wait_until(pred: impl Fn() -> bool) {
        for _ in 0..2_000 {
            if pred() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached");
    }

    #[test]
    fn archive_ring_never_drops_even_when_tiny() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileSessionStorage::new(dir.path()).unwrap());
        let session = SessionId::new("s-tiny");
        storage.open_session(&session).unwrap();

        let bridge = CaptureBridge::start(
            synthetic(500),
            session.clone(),
            storage.clone(),
            BridgeConfig {
                archive_capacity: 2,
                preview_capacity: 1,
            },
        )
        .unwrap();
        let stats = bridge.stats();
        wait_until(|| stats.captured.load(Ordering::Relaxed) == 500);

        let report = bridge.stop().unwrap();
        assert_eq!(report.written, 500);
        assert!(report.fault.is_none());
        assert!(report.source.is_some());
        // Nobody consumed the preview ring.
        assert!(stats.preview_dropped.load(Ordering::Relaxed) >= 498);

        storage.flush(&session).unwrap();
        let bundle = storage.bundle(&session, &NodeId::new("n")).unwrap();
        let (bytes, _) = storage
            .read_chunk(&session, &bundle.files[0].path, 0, u64::MAX)
            .unwrap();
        let records = read_records(&bytes).unwrap();
        assert_eq!(records.len(), 500);
        assert!(records.windows(2).all(|w| w[0].t_local <= w[1].t_local));
    }

    #[derive(Debug)]
    struct FailingStorage {
        appends_before_failure: usize,
        appends: AtomicUsize,
    }

    impl SessionStorage for FailingStorage {
        fn open_session(&self, _: &SessionId) -> Result<(), StorageError> {
            Ok(())
        }

        fn append(&self, session: &SessionId, _: &str, _: i64, _: &[u8]) -> Result<(), StorageError> {
            if self.appends.fetch_add(1, Ordering::SeqCst) >= self.appends_before_failure {
                return Err(StorageError::NotOpen(session.clone()));
            }
            Ok(())
        }

        fn flush(&self, _: &SessionId) -> Result<(), StorageError> {
            Ok(())
        }

        fn bundle(&self, session: &SessionId, node: &NodeId) -> Result<BundleDescriptor, StorageError> {
            Ok(BundleDescriptor {
                session_id: session.clone(),
                node_id: node.clone(),
                files: Vec::new(),
                storage_error: None,
            })
        }

        fn read_chunk(&self, session: &SessionId, _: &str, _: u64, _: u64) -> Result<(Vec<u8>, u64), StorageError> {
            Err(StorageError::UnknownSession(session.clone()))
        }

        fn release(&self, _: &SessionId) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn storage_failure_halts_and_reports_fault() {
        let storage = Arc::new(FailingStorage {
            appends_before_failure: 10,
            appends: AtomicUsize::new(0),
        });
        let bridge = CaptureBridge::start(
            synthetic(10_000),
            SessionId::new("s-fail"),
            storage,
            BridgeConfig {
                archive_capacity: 16,
                preview_capacity: 4,
            },
        )
        .unwrap();

        wait_until(|| !bridge.is_running());
        assert!(bridge.fault().is_some());

        let report = bridge.stop().unwrap();
        assert_eq!(report.written, 10);
        assert!(report.fault.unwrap().contains("s-fail"));
    }

    #[test]
    fn preview_consumer_sees_samples() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileSessionStorage::new(dir.path()).unwrap());
        let session = SessionId::new("s-preview");
        storage.open_session(&session).unwrap();

        let mut bridge = CaptureBridge::start(
            synthetic(50),
            session,
            storage,
            BridgeConfig {
                archive_capacity: 64,
                preview_capacity: 64,
            },
        )
        .unwrap();
        let mut preview = bridge.take_preview().unwrap();
        assert!(bridge.take_preview().is_none());

        let stats = bridge.stats();
        wait_until(|| stats.captured.load(Ordering::Relaxed) == 50);
        let mut seen = 0;
        while preview.pop().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 50);
        assert_eq!(stats.preview_dropped.load(Ordering::Relaxed), 0);
        bridge.stop().unwrap();
    }
}
