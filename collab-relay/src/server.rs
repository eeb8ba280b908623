//! Relay server core: shared state, accept loop, fan-out broadcast.
//!
//! The server generates one [`CryptoContext`] per run. Every accepted
//! connection first receives that key in the clear, then is registered and
//! served by its own task (see [`crate::session`]). Any message a peer sends
//! is decrypted once and re-encrypted for each of the other peers. Broadcast
//! only enqueues; each peer's own write task does the socket I/O.
//!
//! The key exchange offers no confidentiality against anyone who can observe
//! the network path. Run the relay only on trusted networks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use collab_proto::codec::DEFAULT_MAX_FRAME_SIZE;
use collab_proto::{CryptoContext, Message, RelayError};
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::config::RelayConfig;
use crate::registry::SessionRegistry;
use crate::session::{self, DEFAULT_OUTBOUND_CAPACITY, PeerId, Session};

/// Default time allowed for writing the key to a new peer.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients the message was queued for.
    pub delivered: usize,
    /// Recipients that could not take the message and were removed.
    pub dropped: usize,
}

/// State shared between the accept loop and every session task.
pub struct RelayState {
    crypto: CryptoContext,
    /// Live sessions keyed by remote endpoint.
    pub(crate) registry: SessionRegistry,
    running: AtomicBool,
    max_frame_size: usize,
    handshake_timeout: Duration,
    outbound_capacity: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a state with a freshly generated key and default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_FRAME_SIZE, DEFAULT_HANDSHAKE_TIMEOUT)
    }

    /// Creates a state with a freshly generated key and the given limits.
    #[must_use]
    pub fn with_limits(max_frame_size: usize, handshake_timeout: Duration) -> Self {
        Self {
            crypto: CryptoContext::generate(),
            registry: SessionRegistry::new(),
            running: AtomicBool::new(true),
            max_frame_size,
            handshake_timeout,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }

    /// Sets how many frames may queue for one peer before it is dropped.
    #[must_use]
    pub const fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Creates a state from a resolved [`RelayConfig`].
    #[must_use]
    pub fn with_config(config: &RelayConfig) -> Self {
        Self::with_limits(
            config.max_frame_size,
            Duration::from_secs(config.handshake_timeout_secs),
        )
        .with_outbound_capacity(config.outbound_queue)
    }

    /// The key shared by every session of this run.
    #[must_use]
    pub const fn crypto(&self) -> &CryptoContext {
        &self.crypto
    }

    /// Largest frame body a peer may send.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Time allowed for writing the key to a new peer.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Frames that may queue for one peer.
    #[must_use]
    pub const fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    /// Returns `false` once the server has been stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sends `message` to every registered session except `exclude`.
    ///
    /// Never waits on a peer: each token goes onto the recipient's outbound
    /// queue. A recipient whose queue is full or whose write task has ended
    /// is removed and terminated; delivery to the rest continues. The
    /// registry is locked only to take a snapshot and to remove failures.
    pub fn broadcast(&self, message: &Message, exclude: Option<PeerId>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let plaintext = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode broadcast message");
                return report;
            }
        };

        let recipients = self.registry.snapshot();
        let mut failed: Vec<Arc<Session>> = Vec::new();

        for session in recipients {
            if Some(session.peer_id()) == exclude {
                continue;
            }
            let result = self
                .crypto
                .encrypt(&plaintext)
                .map_err(RelayError::from)
                .and_then(|token| session.send_frame(token));
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        peer_id = %session.peer_id(),
                        error = %e,
                        "cannot queue broadcast, dropping peer"
                    );
                    failed.push(session);
                }
            }
        }

        if !failed.is_empty() {
            self.registry.remove_all(&failed);
            for session in &failed {
                session.terminate();
            }
        }
        report.dropped = failed.len();
        report
    }
}

/// A running relay: listener task plus shared state.
pub struct RelayServer {
    state: Arc<RelayState>,
    local_addr: SocketAddr,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RelayServer {
    /// Binds `addr` and starts accepting peers with a fresh key.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Connection`] if the listener cannot bind.
    pub async fn start(addr: &str) -> Result<Self, RelayError> {
        Self::start_with_state(addr, Arc::new(RelayState::new())).await
    }

    /// Binds the address from `config` and applies its limits.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Connection`] if the listener cannot bind.
    pub async fn start_with_config(config: &RelayConfig) -> Result<Self, RelayError> {
        Self::start_with_state(&config.bind_addr, Arc::new(RelayState::with_config(config))).await
    }

    /// Binds `addr` and serves peers using a pre-built [`RelayState`].
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Connection`] if the listener cannot bind.
    pub async fn start_with_state(addr: &str, state: Arc<RelayState>) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "collaboration relay listening");

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        Ok(Self {
            state,
            local_addr,
            accept_task: parking_lot::Mutex::new(Some(accept_task)),
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared state, for embedding and diagnostics.
    #[must_use]
    pub const fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Sends `message` to every connected peer except `exclude`.
    pub fn broadcast(&self, message: &Message, exclude: Option<PeerId>) -> BroadcastReport {
        self.state.broadcast(message, exclude)
    }

    /// Connected peers and when each joined.
    #[must_use]
    pub fn peers(&self) -> Vec<(PeerId, Instant)> {
        self.state.registry.peers()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.registry.len()
    }

    /// Returns `false` once [`RelayServer::stop`] has been called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Stops accepting, then closes every registered connection.
    ///
    /// Sessions are closed concurrently, so a peer that stopped reading delays
    /// shutdown by at most its close grace period. Closing the sockets wakes
    /// every session task so it can exit. Calling `stop` again is a no-op.
    pub async fn stop(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let accept_task = self.accept_task.lock().take();
        if let Some(handle) = accept_task {
            handle.abort();
            // Wait for the task to drop the listener.
            let _ = handle.await;
        }

        let sessions = self.state.registry.drain();
        let count = sessions.len();
        let mut closing = JoinSet::new();
        for session in sessions {
            closing.spawn(async move { session.close().await });
        }
        while closing.join_next().await.is_some() {}
        tracing::info!(addr = %self.local_addr, closed = count, "collaboration relay stopped");
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if let Some(handle) = self.accept_task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Accepts connections until the server stops, spawning one session task each.
async fn accept_loop(listener: TcpListener, state: Arc<RelayState>) {
    while state.is_running() {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if !state.is_running() {
                    break;
                }
                tracing::info!(peer_id = %addr, "new peer connected");
                tokio::spawn(session::run(Arc::clone(&state), stream, PeerId::from(addr)));
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    tracing::debug!("accept loop exiting");
}
