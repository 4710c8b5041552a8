mod common;

use std::time::Duration;

use common::{start_conductor, FakeNode, FakeNodeOptions};
use conductor::{NodeState, Outcome, SessionState};
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tandemproto::{
    AckStatus, FrameCodec, Handshake, Message, NodeId, SensorKind, PROTOCOL_VERSION,
};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

#[tokio::test]
async fn duplicate_acks_are_ignored() {
    let archive = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    let running = start_conductor(archive.path()).await;

    let mut opts = FakeNodeOptions::new("echo", storage.path());
    opts.duplicate_acks = true;
    let _node = FakeNode::connect(running.local_addr, opts).await;
    let id = vec![NodeId::new("echo")];
    running
        .wait_until_schedulable(&id, Duration::from_secs(5))
        .await
        .expect("sync");

    let coordinator = &running.coordinator;
    coordinator.arm(id.clone()).await.unwrap();
    coordinator.start().await.unwrap();
    coordinator
        .wait_for_state(SessionState::Recording, Duration::from_secs(2))
        .await
        .expect("recording");
    let manifest = coordinator.stop().await.unwrap();

    assert_eq!(manifest.outcome_of(&id[0]), Some(&Outcome::Confirmed));
    let snap = running.ctx.registry.snapshot(&id[0]).await.unwrap();
    assert_eq!(snap.violations, 0);
    assert!(snap.state.is_live());

    running.shutdown().await;
}

async fn raw_handshake(addr: std::net::SocketAddr, node: &str, protocol: &str) -> Message {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());
    let hello = Message::handshake(1)
        .with_params(&Handshake {
            node_id: NodeId::new(node),
            capabilities: vec![SensorKind::Thermal],
            protocol: protocol.to_string(),
        })
        .unwrap();
    framed.send(hello).await.unwrap();
    let body = framed.next().await.unwrap().unwrap();
    Message::decode(&body).unwrap()
}

#[tokio::test]
async fn second_live_handshake_for_same_id_is_rejected() {
    let archive = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    let running = start_conductor(archive.path()).await;

    let first = FakeNode::connect(running.local_addr, FakeNodeOptions::new("twin", storage.path())).await;
    let reply = raw_handshake(running.local_addr, "twin", PROTOCOL_VERSION).await;
    assert!(matches!(reply.status, Some(AckStatus::Rejected { .. })));
    assert_eq!(running.ctx.registry.len().await, 1);

    // Once the first link is gone the id may come back.
    first.kill();
    let handle = running.ctx.registry.get(&NodeId::new("twin")).await.unwrap();
    handle
        .wait_for(Duration::from_secs(2), |s| s.state == NodeState::Disconnected)
        .await
        .expect("first link closed");
    let reply = raw_handshake(running.local_addr, "twin", PROTOCOL_VERSION).await;
    assert_eq!(reply.status, Some(AckStatus::Ok));

    running.shutdown().await;
}

#[tokio::test]
async fn unknown_protocol_is_rejected() {
    let archive = tempfile::tempdir().unwrap();
    let running = start_conductor(archive.path()).await;

    let reply = raw_handshake(running.local_addr, "old", "TANDEM0").await;
    match reply.status {
        Some(AckStatus::Rejected { reason }) => assert!(reason.contains("TANDEM0"), "{}", reason),
        other => panic!("unexpected {:?}", other),
    }
    assert!(running.ctx.registry.is_empty().await);

    running.shutdown().await;
}
