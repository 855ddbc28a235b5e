mod common;
use common::*;

use envertech_bridge::envertech::client::{InverterClient, StreamEvent};
use envertech_bridge::envertech::frame::{build_break_command, build_data_request};
use envertech_bridge::prelude::*;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn serial() -> Serial {
    DEVICE_ID.parse().unwrap()
}

fn is_break_frame(data: &[u8]) -> bool {
    data.len() >= 6 && data[4] == 0x10 && data[5] == 0x41
}

#[tokio::test]
async fn one_shot_exchange_round_trips() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut telemetry = Factory::telemetry_reply(1, 0);
    let base = panel_base(0);
    telemetry[base..base + 4].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];

        let n = sock.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], build_data_request(&serial()).as_slice());
        sock.write_all(&telemetry).await.unwrap();

        let n = sock.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], build_break_command(&serial()).as_slice());
    });

    let mut client = InverterClient::new("127.0.0.1", port, serial());
    let reply = client.get_inverter_data(Duration::from_secs(2)).await.unwrap();

    assert_eq!(reply.control_code, Some(4177));
    assert_eq!(reply.panel_count, Some(1));
    assert_eq!(reply.snapshot.get_str("0_mi_sn"), Some("aabbccdd"));
    assert_eq!(reply.snapshot.get_str("firmware_version"), Some("5/7"));
    assert!(!client.is_connected());

    server.await.unwrap();
}

#[tokio::test]
async fn one_shot_retries_past_an_ack() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];

        // first request gets an ack, which is not usable data
        let n = sock.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], build_data_request(&serial()).as_slice());
        sock.write_all(&Factory::ack_reply()).await.unwrap();

        // the client backs off, re-sends, and this time gets telemetry
        let n = sock.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], build_data_request(&serial()).as_slice());
        sock.write_all(&Factory::telemetry_reply(1, 0)).await.unwrap();

        let n = sock.read(&mut buf).await.unwrap();
        assert!(is_break_frame(&buf[..n]));
    });

    let mut client = InverterClient::new("127.0.0.1", port, serial());
    let reply = client.get_inverter_data(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.panel_count, Some(1));

    server.await.unwrap();
}

#[tokio::test]
async fn one_shot_gives_up_after_five_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        collected
    });

    let mut client = InverterClient::new("127.0.0.1", port, serial());
    let reply = client
        .get_inverter_data(Duration::from_millis(50))
        .await
        .unwrap();
    assert!(!reply.is_usable());
    assert_eq!(reply.snapshot.len(), 0);

    let collected = server.await.unwrap();
    let request = build_data_request(&serial());
    let break_frame = build_break_command(&serial());
    assert_eq!(collected.len(), 5 * request.len() + break_frame.len());
    assert!(collected.ends_with(&break_frame));
}

#[tokio::test]
async fn send_refuses_empty_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut client = InverterClient::new("127.0.0.1", port, serial());
    // a build failure upstream produces an empty frame; sending it is a
    // no-op and must not even open a connection
    client.send(&[]).await.unwrap();
    assert!(!client.is_connected());
}

#[tokio::test]
async fn streaming_yields_replies_then_parts_with_a_break() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            if n == 0 {
                return false;
            }
            if is_break_frame(&buf[..n]) {
                return true;
            }
            sock.write_all(&Factory::telemetry_reply(1, 0)).await.unwrap();
        }
    });

    let client = InverterClient::new("127.0.0.1", port, serial());
    let mut stream = client
        .stream(Duration::from_millis(200), Duration::from_secs(5))
        .await
        .unwrap();

    for _ in 0..2 {
        match stream.next().await {
            Some(StreamEvent::Reply(reply)) => {
                assert_eq!(reply.panel_count, Some(1));
            }
            other => panic!("expected a telemetry reply, got {:?}", other),
        }
    }

    stream.close().await;
    assert!(server.await.unwrap(), "gateway never saw the break command");
}

#[tokio::test]
async fn streaming_idles_without_tearing_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        // accept the requests but never answer them
        let mut buf = [0u8; 1024];
        while sock.read(&mut buf).await.unwrap() > 0 {}
    });

    let client = InverterClient::new("127.0.0.1", port, serial());
    let mut stream = client
        .stream(Duration::from_secs(30), Duration::from_millis(100))
        .await
        .unwrap();

    assert_eq!(stream.next().await, Some(StreamEvent::Idle));
    assert_eq!(stream.next().await, Some(StreamEvent::Idle));

    stream.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn streaming_surfaces_a_terminal_error_and_ends() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        // accept and immediately hang up
        let (sock, _) = listener.accept().await.unwrap();
        drop(sock);
    });

    let client = InverterClient::new("127.0.0.1", port, serial());
    let mut stream = client
        .stream(Duration::from_secs(30), Duration::from_secs(5))
        .await
        .unwrap();

    match stream.next().await {
        Some(StreamEvent::Failed(_)) => {}
        other => panic!("expected a terminal failure, got {:?}", other),
    }
    assert!(stream.next().await.is_none());

    server.await.unwrap();
}
