//! A scripted sensor node speaking the wire protocol over loopback TCP.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tandemconf::TandemConfig;
use tandemproto::{
    AckStatus, Clock, EventKind, FrameCodec, Handshake, Message, MessageKind, MonotonicClock,
    Nanos, NodeId, PullChunk, PullRequest, SensorKind, SessionParams, StartConfirmed, StartParams,
    Verb, PROTOCOL_VERSION,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use vault::{FileSessionStorage, SessionStorage};

pub const MS: Nanos = 1_000_000;

/// Config tuned for fast loopback tests.
pub fn test_config(archive: &Path) -> TandemConfig {
    let mut config = TandemConfig::default();
    config.bind.listen = "127.0.0.1:0".to_string();
    config.paths.archive_dir = archive.to_path_buf();
    config.sync.samples_per_round = 3;
    config.sync.exchange_timeout_ms = 150;
    config.sync.resync_interval_ms = 200;
    config.retry.command_timeout_ms = 200;
    config.retry.max_retries = 2;
    config.retry.backoff_base_ms = 10;
    config.retry.backoff_max_ms = 20;
    config.session.min_lead_ms = 150;
    config.session.confirm_timeout_ms = 500;
    config.session.stop_timeout_ms = 1_000;
    config.transfer.chunk_size = 64;
    config.transfer.chunk_timeout_ms = 500;
    config.transfer.release_after_verify = true;
    config
}

pub async fn start_conductor(archive: &Path) -> conductor::RunningConductor {
    conductor::start(test_config(archive), Arc::new(MonotonicClock::new()))
        .await
        .expect("conductor starts")
}

#[derive(Debug, Clone)]
pub struct FakeNodeOptions {
    pub id: String,
    /// Offset of the node clock from the master clock.
    pub skew_ns: Nanos,
    pub answer_sync: bool,
    pub answer_commands: bool,
    pub duplicate_acks: bool,
    /// Close the socket on `start_recording` instead of acking it.
    pub drop_on_start: bool,
    /// Flip a byte in the first this-many pull_bundle replies.
    pub corrupt_pulls: u64,
    /// Send `start_confirmed` once the scheduled instant arrives.
    pub confirm_start: bool,
    /// Extra wait after the scheduled instant before confirming.
    pub confirm_delay: Duration,
    pub answer_stop: bool,
    /// Rate at which the node clock runs ahead of the master clock.
    pub drift_ppm: f64,
    pub storage_root: PathBuf,
}

impl FakeNodeOptions {
    pub fn new(id: &str, storage_root: &Path) -> Self {
        Self {
            id: id.to_string(),
            skew_ns: 0,
            answer_sync: true,
            answer_commands: true,
            duplicate_acks: false,
            drop_on_start: false,
            corrupt_pulls: 0,
            confirm_start: true,
            confirm_delay: Duration::ZERO,
            answer_stop: true,
            drift_ppm: 0.0,
            storage_root: storage_root.join(id),
        }
    }

    pub fn skew(mut self, skew_ns: Nanos) -> Self {
        self.skew_ns = skew_ns;
        self
    }
}

/// A node clock that gains `ppm` parts per million on the master clock.
#[derive(Debug)]
struct DriftingClock {
    base: MonotonicClock,
    origin: Nanos,
    ppm: f64,
}

impl Clock for DriftingClock {
    fn now_ns(&self) -> Nanos {
        let t = self.base.now_ns();
        t + ((t - self.origin) as f64 * self.ppm / 1e6) as Nanos
    }
}

fn node_clock(opts: &FakeNodeOptions) -> Arc<dyn Clock> {
    let base = MonotonicClock::with_skew(opts.skew_ns);
    if opts.drift_ppm == 0.0 {
        return Arc::new(base);
    }
    Arc::new(DriftingClock {
        base,
        origin: base.now_ns(),
        ppm: opts.drift_ppm,
    })
}

pub struct FakeNode {
    pub id: NodeId,
    received: Arc<Mutex<Vec<Message>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl FakeNode {
    pub async fn connect(addr: SocketAddr, opts: FakeNodeOptions) -> FakeNode {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let framed = Framed::new(stream, FrameCodec::new());
        let (mut sink, mut frames) = framed.split();
        let clock = node_clock(&opts);
        let node_id = NodeId::new(opts.id.clone());

        let hello = Message::handshake(1)
            .with_params(&Handshake {
                node_id: node_id.clone(),
                capabilities: vec![SensorKind::Gsr],
                protocol: PROTOCOL_VERSION.to_string(),
            })
            .unwrap()
            .stamped(clock.now_ns());
        sink.send(hello).await.expect("send handshake");
        let body = frames.next().await.expect("handshake reply").expect("frame");
        let reply = Message::decode(&body).expect("decode handshake reply");
        assert_eq!(reply.status, Some(AckStatus::Ok), "handshake accepted");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let storage = Arc::new(FileSessionStorage::new(&opts.storage_root).expect("storage"));
        let script = Script {
            opts,
            node_id: node_id.clone(),
            clock,
            out: out_tx,
            storage,
            ids: Arc::new(AtomicU64::new(1_000)),
            corrupted: AtomicU64::new(0),
        };
        let log = received.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(body)) = frames.next().await {
                let msg = Message::decode(&body).expect("conductor sends valid frames");
                log.lock().unwrap().push(msg.clone());
                if !script.handle(msg) {
                    break;
                }
            }
        });

        FakeNode {
            id: node_id,
            received,
            reader,
            writer,
        }
    }

    /// Ids of every received command with this verb, in arrival order.
    pub fn command_ids(&self, verb: Verb) -> Vec<u64> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind == MessageKind::Command && m.verb == Some(verb))
            .map(|m| m.id)
            .collect()
    }

    pub fn received_verb(&self, verb: Verb) -> bool {
        !self.command_ids(verb).is_empty()
    }

    /// Drop the connection.
    pub fn kill(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.kill();
    }
}

struct Script {
    opts: FakeNodeOptions,
    node_id: NodeId,
    clock: Arc<dyn Clock>,
    out: mpsc::UnboundedSender<Message>,
    storage: Arc<FileSessionStorage>,
    ids: Arc<AtomicU64>,
    corrupted: AtomicU64,
}

impl Script {
    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns false to drop the connection.
    fn handle(&self, msg: Message) -> bool {
        match msg.kind {
            MessageKind::SyncReq if self.opts.answer_sync => {
                let t1 = self.clock.now_ns();
                self.send(Message::sync_resp(self.next_id(), msg.id, t1));
            }
            MessageKind::Command if self.opts.answer_commands => {
                let Some(verb) = msg.verb else { return true };
                if verb == Verb::StartRecording && self.opts.drop_on_start {
                    return false;
                }
                self.command(verb, &msg);
            }
            _ => {}
        }
        true
    }

    fn command(&self, verb: Verb, msg: &Message) {
        match verb {
            Verb::ArmSession => {
                let params: SessionParams = msg.params_as().unwrap();
                self.storage.open_session(&params.session_id).unwrap();
                self.ack(msg.id, AckStatus::Ok, &serde_json::json!({}));
            }
            Verb::StartRecording => {
                let params: StartParams = msg.params_as().unwrap();
                let t_scheduled = msg.t_scheduled.expect("start carries t_scheduled");
                self.ack(msg.id, AckStatus::Ok, &serde_json::json!({}));
                if !self.opts.confirm_start {
                    return;
                }

                let delay = self.opts.confirm_delay;
                let clock = self.clock.clone();
                let out = self.out.clone();
                let storage = self.storage.clone();
                let command_id = msg.id;
                let event_id = self.next_id();
                tokio::spawn(async move {
                    tokio::time::sleep(clock.until(t_scheduled)).await;
                    let observed = clock.now_ns();
                    for i in 0..20u32 {
                        let payload = format!("sample-{}", i);
                        storage
                            .append(&params.session_id, "gsr", observed + i as i64 * MS, payload.as_bytes())
                            .unwrap();
                    }
                    tokio::time::sleep(delay).await;
                    let confirmed = StartConfirmed {
                        session_id: params.session_id,
                        command_id,
                        t_observed_local: observed,
                    };
                    let event = Message::event(event_id, EventKind::StartConfirmed)
                        .with_params(&confirmed)
                        .unwrap()
                        .stamped(clock.now_ns());
                    let _ = out.send(event);
                });
            }
            Verb::StopRecording if !self.opts.answer_stop => {}
            Verb::StopRecording => {
                let params: SessionParams = msg.params_as().unwrap();
                let bundle = self.storage.bundle(&params.session_id, &self.node_id).unwrap();
                self.ack(msg.id, AckStatus::Ok, &bundle);
            }
            Verb::PullBundle => {
                let req: PullRequest = msg.params_as().unwrap();
                let (mut bytes, total) = self
                    .storage
                    .read_chunk(&req.session_id, &req.path, req.offset, req.max_len)
                    .unwrap();
                if !bytes.is_empty() && self.corrupted.fetch_add(1, Ordering::Relaxed) < self.opts.corrupt_pulls {
                    bytes[0] ^= 0xff;
                }
                self.ack(msg.id, AckStatus::Ok, &PullChunk::new(req.offset, &bytes, total));
            }
            Verb::ReleaseBundle => {
                let params: SessionParams = msg.params_as().unwrap();
                self.storage.release(&params.session_id).unwrap();
                self.ack(msg.id, AckStatus::Ok, &serde_json::json!({}));
            }
            Verb::AbortSession => {
                self.ack(msg.id, AckStatus::Ok, &serde_json::json!({}));
            }
        }
    }

    fn ack<P: serde::Serialize>(&self, ack_id: u64, status: AckStatus, params: &P) {
        let copies = if self.opts.duplicate_acks { 2 } else { 1 };
        for _ in 0..copies {
            let ack = Message::ack(self.next_id(), ack_id, status.clone())
                .with_params(params)
                .unwrap()
                .stamped(self.clock.now_ns());
            self.send(ack);
        }
    }

    fn send(&self, msg: Message) {
        let _ = self.out.send(msg);
    }
}

/// Poll until `pred` holds or `timeout` passes.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut pred: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
