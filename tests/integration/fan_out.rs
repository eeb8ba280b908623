// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Integration tests for fan-out through a live relay.
//!
//! These tests validate:
//! - A message from one client reaches every other client exactly once
//! - The sender never receives its own message
//! - A failing recipient does not stop delivery to the others
//! - A recipient that stops reading blocks neither other peers nor shutdown
//! - Per-link FIFO ordering
//! - The ping scenario end to end, including server shutdown

use std::time::Duration;

use collab_client::{Message, RelayClient};
use collab_proto::codec;
use collab_relay::RelayServer;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

async fn start_relay() -> RelayServer {
    RelayServer::start("127.0.0.1:0").await.unwrap()
}

async fn connect(server: &RelayServer) -> (RelayClient, mpsc::UnboundedReceiver<Message>) {
    let (client, rx) = RelayClient::channel();
    assert!(client.connect("127.0.0.1", server.local_addr().port()).await);
    (client, rx)
}

/// Waits until the relay has registered `expected` sessions.
async fn wait_for_sessions(server: &RelayServer, expected: usize) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if server.session_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {expected} sessions, relay has {}",
        server.session_count()
    );
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("recv timed out")
        .expect("handler channel closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Message>) {
    let result = tokio::time::timeout(QUIET_PERIOD, rx.recv()).await;
    assert!(result.is_err(), "unexpected message: {result:?}");
}

async fn wait_until_disconnected(client: &RelayClient) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if !client.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("client did not observe disconnection");
}

fn msg(value: serde_json::Value) -> Message {
    Message::from_value(value).unwrap()
}

#[tokio::test]
async fn ping_scenario_end_to_end() {
    let server = start_relay().await;
    let (c1, mut rx1) = connect(&server).await;
    let (c2, mut rx2) = connect(&server).await;
    wait_for_sessions(&server, 2).await;

    let ping = msg(json!({"type": "ping", "n": 1}));
    assert!(c1.send(&ping).await);

    assert_eq!(recv(&mut rx2).await, ping);
    assert_quiet(&mut rx2).await;
    assert_quiet(&mut rx1).await;

    server.stop().await;
    wait_until_disconnected(&c1).await;
    wait_until_disconnected(&c2).await;
    assert!(!c1.send(&ping).await);
    assert!(!c2.send(&ping).await);
}

#[tokio::test]
async fn every_other_client_receives_exactly_one_copy() {
    let server = start_relay().await;
    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(connect(&server).await);
    }
    wait_for_sessions(&server, 5).await;

    let delta = msg(json!({"type": "delta", "path": "README.md", "insert": "hi", "at": 0}));
    assert!(clients[0].0.send(&delta).await);

    for (_, rx) in clients.iter_mut().skip(1) {
        assert_eq!(recv(rx).await, delta);
    }
    for (_, rx) in &mut clients {
        assert_quiet(rx).await;
    }
}

#[tokio::test]
async fn concurrent_senders_each_reach_all_others() {
    let server = start_relay().await;
    let (a, mut rx_a) = connect(&server).await;
    let (b, mut rx_b) = connect(&server).await;
    let (_c, mut rx_c) = connect(&server).await;
    wait_for_sessions(&server, 3).await;

    let from_a = msg(json!({"type": "presence", "who": "a"}));
    let from_b = msg(json!({"type": "presence", "who": "b"}));
    let (sent_a, sent_b) = tokio::join!(a.send(&from_a), b.send(&from_b));
    assert!(sent_a && sent_b);

    assert_eq!(recv(&mut rx_a).await, from_b);
    assert_eq!(recv(&mut rx_b).await, from_a);

    // The third peer may observe the two in either order.
    let mut seen = vec![recv(&mut rx_c).await, recv(&mut rx_c).await];
    seen.sort_by_key(|m| m.get("who").and_then(|v| v.as_str()).map(str::to_owned));
    assert_eq!(seen, vec![from_a, from_b]);
}

#[tokio::test]
async fn per_link_order_is_preserved() {
    let server = start_relay().await;
    let (sender, _rx_sender) = connect(&server).await;
    let (_receiver, mut rx) = connect(&server).await;
    wait_for_sessions(&server, 2).await;

    for n in 0..50u64 {
        assert!(sender.send(&msg(json!({"type": "seq", "n": n}))).await);
    }
    for n in 0..50u64 {
        let received = recv(&mut rx).await;
        assert_eq!(received.get("n"), Some(&json!(n)), "order violated at {n}");
    }
}

#[tokio::test]
async fn departed_peer_does_not_block_fan_out() {
    let server = start_relay().await;
    let (sender, _rx_sender) = connect(&server).await;
    let (leaver, _rx_leaver) = connect(&server).await;
    let (_stayer, mut rx_stayer) = connect(&server).await;
    wait_for_sessions(&server, 3).await;

    leaver.disconnect().await;

    for n in 0..5u64 {
        assert!(sender.send(&msg(json!({"type": "tick", "n": n}))).await);
    }
    for n in 0..5u64 {
        assert_eq!(recv(&mut rx_stayer).await.get("n"), Some(&json!(n)));
    }
    wait_for_sessions(&server, 2).await;
}

#[tokio::test]
async fn direct_broadcast_reports_delivery() {
    let server = start_relay().await;
    let (_a, mut rx_a) = connect(&server).await;
    let (_b, mut rx_b) = connect(&server).await;
    wait_for_sessions(&server, 2).await;

    let notice = msg(json!({"type": "notice", "text": "saving"}));
    let report = server.broadcast(&notice, None);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.dropped, 0);
    assert_eq!(recv(&mut rx_a).await, notice);
    assert_eq!(recv(&mut rx_b).await, notice);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_reader_does_not_block_others_or_shutdown() {
    let server = start_relay().await;
    let (sender, _rx_sender) = connect(&server).await;
    let (receiver, mut rx) = connect(&server).await;

    // A peer that takes the key and then never reads again.
    let mut stalled = TcpStream::connect(server.local_addr()).await.unwrap();
    codec::read_key(&mut stalled).await.unwrap();
    wait_for_sessions(&server, 3).await;

    // Enough data to fill the stalled peer's socket buffers several times.
    let blob = "x".repeat(40 * 1024);
    for n in 0..400u64 {
        assert!(sender.send(&msg(json!({"type": "bulk", "n": n, "blob": blob.as_str()}))).await);
        let received = recv(&mut rx).await;
        assert_eq!(received.get("n"), Some(&json!(n)), "healthy peer stalled at {n}");
    }

    tokio::time::timeout(RECV_TIMEOUT, server.stop())
        .await
        .expect("stop() hung behind a stalled reader");
    wait_until_disconnected(&sender).await;
    wait_until_disconnected(&receiver).await;
}
