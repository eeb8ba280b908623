// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Integration tests for peers that do not speak with the relay's key.
//!
//! A peer whose frames fail authentication is desynchronized: the relay
//! drops it without forwarding anything, and honest peers carry on.

use std::time::Duration;

use collab_client::{Message, RelayClient};
use collab_proto::{CryptoContext, codec};
use collab_relay::RelayServer;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// A hand-driven peer that speaks the wire format directly.
struct RawPeer {
    stream: TcpStream,
    relay_key: [u8; 32],
}

impl RawPeer {
    async fn connect(server: &RelayServer) -> Self {
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let relay_key = tokio::time::timeout(TIMEOUT, codec::read_key(&mut stream))
            .await
            .expect("key timed out")
            .unwrap();
        Self { stream, relay_key }
    }

    async fn send_sealed(&mut self, message: &Message, crypto: &CryptoContext) {
        let token = message.seal(crypto).unwrap();
        codec::write_frame(&mut self.stream, &token).await.unwrap();
    }

    /// Returns once the relay has closed this connection.
    async fn expect_closed(&mut self) {
        let result = tokio::time::timeout(
            TIMEOUT,
            codec::read_frame(&mut self.stream, codec::DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        .expect("relay did not close the connection");
        match result {
            Ok(None) | Err(_) => {}
            Ok(Some(frame)) => panic!("relay sent {} bytes to a dropped peer", frame.len()),
        }
    }
}

async fn connect_client(server: &RelayServer) -> (RelayClient, mpsc::UnboundedReceiver<Message>) {
    let (client, rx) = RelayClient::channel();
    assert!(client.connect("127.0.0.1", server.local_addr().port()).await);
    (client, rx)
}

async fn wait_for_sessions(server: &RelayServer, expected: usize) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
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

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Message>) {
    let result = tokio::time::timeout(QUIET_PERIOD, rx.recv()).await;
    assert!(result.is_err(), "unexpected message: {result:?}");
}

fn msg(value: serde_json::Value) -> Message {
    Message::from_value(value).unwrap()
}

#[tokio::test]
async fn foreign_key_peer_is_dropped_and_not_forwarded() {
    let server = RelayServer::start("127.0.0.1:0").await.unwrap();
    let (_honest, mut honest_rx) = connect_client(&server).await;
    let mut intruder = RawPeer::connect(&server).await;
    wait_for_sessions(&server, 2).await;

    let foreign = CryptoContext::generate();
    intruder
        .send_sealed(&msg(json!({"type": "delta", "text": "spoofed"})), &foreign)
        .await;

    intruder.expect_closed().await;
    wait_for_sessions(&server, 1).await;
    assert_quiet(&mut honest_rx).await;
}

#[tokio::test]
async fn relay_keeps_serving_after_dropping_intruder() {
    let server = RelayServer::start("127.0.0.1:0").await.unwrap();
    let (alice, _alice_rx) = connect_client(&server).await;
    let (_bob, mut bob_rx) = connect_client(&server).await;
    let mut intruder = RawPeer::connect(&server).await;
    wait_for_sessions(&server, 3).await;

    intruder
        .send_sealed(&msg(json!({"type": "noise"})), &CryptoContext::generate())
        .await;
    intruder.expect_closed().await;
    wait_for_sessions(&server, 2).await;

    let hello = msg(json!({"type": "hello", "from": "alice"}));
    assert!(alice.send(&hello).await);
    let received = tokio::time::timeout(TIMEOUT, bob_rx.recv())
        .await
        .expect("recv timed out")
        .unwrap();
    assert_eq!(received, hello);
}

#[tokio::test]
async fn raw_peer_with_relay_key_is_forwarded() {
    let server = RelayServer::start("127.0.0.1:0").await.unwrap();
    let (_listener, mut listener_rx) = connect_client(&server).await;
    let mut peer = RawPeer::connect(&server).await;
    wait_for_sessions(&server, 2).await;

    let crypto = CryptoContext::from_key(&peer.relay_key).unwrap();
    let edit = msg(json!({"type": "edit", "line": 3}));
    peer.send_sealed(&edit, &crypto).await;

    let received = tokio::time::timeout(TIMEOUT, listener_rx.recv())
        .await
        .expect("recv timed out")
        .unwrap();
    assert_eq!(received, edit);
}

#[tokio::test]
async fn truncated_token_drops_peer() {
    let server = RelayServer::start("127.0.0.1:0").await.unwrap();
    let (_honest, mut honest_rx) = connect_client(&server).await;
    let mut peer = RawPeer::connect(&server).await;
    wait_for_sessions(&server, 2).await;

    // Shorter than nonce plus tag: cannot be a valid token.
    codec::write_frame(&mut peer.stream, &[0u8; 8]).await.unwrap();

    peer.expect_closed().await;
    wait_for_sessions(&server, 1).await;
    assert_quiet(&mut honest_rx).await;
}

#[tokio::test]
async fn oversized_length_prefix_drops_peer() {
    let server = RelayServer::start("127.0.0.1:0").await.unwrap();
    let mut peer = RawPeer::connect(&server).await;
    wait_for_sessions(&server, 1).await;

    peer.stream.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
    peer.stream.flush().await.unwrap();

    peer.expect_closed().await;
    wait_for_sessions(&server, 0).await;
}
