mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{conductor_config, node_config, spawn_node, start_conductor, READY};
use sensornode::{AgentError, NodeAgent};
use tandemproto::{MonotonicClock, NodeId};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_reconnects_to_a_restarted_conductor() {
    let archive = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    let first = start_conductor(archive.path()).await;
    let addr = first.local_addr;

    let node = spawn_node(node_config("roamer", addr, storage.path(), &["gsr"]), 0);
    let participants = vec![NodeId::new("roamer")];
    first
        .wait_until_schedulable(&participants, READY)
        .await
        .expect("first conductor sees the node");
    first.shutdown().await;

    let mut config = conductor_config(archive.path());
    config.bind.listen = addr.to_string();
    let second = conductor::start(config, Arc::new(MonotonicClock::new()))
        .await
        .expect("rebind on the same address");
    second
        .wait_until_schedulable(&participants, READY)
        .await
        .expect("node redials the new conductor");

    node.stop().await.unwrap();
    second.shutdown().await;
}

#[tokio::test]
async fn agent_gives_up_when_no_conductor_answers() {
    let storage = tempfile::tempdir().unwrap();
    let addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let mut config = node_config("lonely", addr, storage.path(), &["gsr"]);
    config.retry.reconnect_max_attempts = 3;
    config.retry.reconnect_base_ms = 5;
    config.retry.reconnect_max_ms = 10;
    let agent = NodeAgent::from_config(config, Arc::new(MonotonicClock::new())).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), agent.run(CancellationToken::new()))
        .await
        .expect("agent gives up in time");
    match result {
        Err(AgentError::GaveUp(detail)) => assert!(detail.contains("3 attempts"), "{}", detail),
        other => panic!("expected GaveUp, got {:?}", other),
    }
}

#[tokio::test]
async fn shutdown_while_dialing_returns_cleanly() {
    let storage = tempfile::tempdir().unwrap();
    let addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };
    let agent = NodeAgent::from_config(
        node_config("patient", addr, storage.path(), &["gsr"]),
        Arc::new(MonotonicClock::new()),
    )
    .unwrap();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(agent.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("agent stops")
        .expect("agent task");
    assert!(result.is_ok(), "{:?}", result);
}
