//! Framing over a real byte stream

use futures::{SinkExt, StreamExt};
use tandemproto::{AckStatus, FrameCodec, FrameError, Message, MessageKind, Verb};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, FramedWrite};

#[tokio::test]
async fn messages_survive_a_duplex_pipe() {
    let (client, server) = tokio::io::duplex(64);
    let mut tx = FramedWrite::new(client, FrameCodec::new());
    let mut rx = FramedRead::new(server, FrameCodec::new());

    let writer = tokio::spawn(async move {
        for id in 0..20u64 {
            let msg = Message::ack(id + 100, id, AckStatus::Ok).stamped(id as i64 * 10);
            tx.send(msg).await.unwrap();
        }
    });

    for id in 0..20u64 {
        let body = rx.next().await.unwrap().unwrap();
        let msg = Message::decode(&body).unwrap();
        assert_eq!(msg.kind, MessageKind::Ack);
        assert_eq!(msg.ack_id, Some(id));
        assert_eq!(msg.t_local, id as i64 * 10);
    }

    writer.await.unwrap();
}

#[tokio::test]
async fn oversize_prefix_ends_the_stream() {
    let (mut client, server) = tokio::io::duplex(64);
    let mut rx = FramedRead::new(server, FrameCodec::with_max_frame_size(1024));

    client.write_all(&4096u32.to_be_bytes()).await.unwrap();
    client.write_all(b"xxxx").await.unwrap();

    match rx.next().await {
        Some(Err(FrameError::FrameTooLarge { size, max })) => {
            assert_eq!(size, 4096);
            assert_eq!(max, 1024);
        }
        other => panic!("expected FrameTooLarge, got {:?}", other),
    }
}

#[tokio::test]
async fn eof_mid_frame_is_reported() {
    let (mut client, server) = tokio::io::duplex(64);
    let mut rx = FramedRead::new(server, FrameCodec::new());

    client.write_all(&10u32.to_be_bytes()).await.unwrap();
    client.write_all(b"abc").await.unwrap();
    drop(client);

    // tokio-util surfaces leftover bytes at EOF as an io error
    assert!(matches!(rx.next().await, Some(Err(FrameError::Io(_)))));
}

#[tokio::test]
async fn command_params_roundtrip_through_stream() {
    let (client, server) = tokio::io::duplex(1024);
    let mut tx = FramedWrite::new(client, FrameCodec::new());
    let mut rx = FramedRead::new(server, FrameCodec::new());

    let params = tandemproto::PullRequest {
        session_id: tandemproto::SessionId::new("session-x"),
        path: "gsr.log".into(),
        offset: 4096,
        max_len: 1024,
    };
    tx.send(Message::command(5, Verb::PullBundle).with_params(&params).unwrap())
        .await
        .unwrap();

    let msg = Message::decode(&rx.next().await.unwrap().unwrap()).unwrap();
    let back: tandemproto::PullRequest = msg.params_as().unwrap();
    assert_eq!(back, params);
}
