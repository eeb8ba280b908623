//! Server-side session handle and its per-connection receive loop.
//!
//! A [`Session`] is created for every accepted connection and moves through
//! `Connecting -> Active -> Closing -> Closed`. The key is written directly
//! while the session is `Connecting`; only then is the write half handed to a
//! dedicated write task fed by a bounded queue, so the key is always the first
//! thing a peer reads and a peer that stops reading only ever fills its own
//! queue.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use collab_proto::codec;
use collab_proto::crypto::KEY_LEN;
use collab_proto::{Message, RelayError};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::server::RelayState;

/// Frames that may wait for a slow peer before it is dropped.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// How long `close` lets the write task flush queued frames.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Write half of a peer connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Registry key for a session: the peer's remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(SocketAddr);

impl PeerId {
    /// Wrap a remote endpoint address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// The remote endpoint address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a server-side session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted; the key has not been transmitted yet.
    Connecting,
    /// Key transmitted; receives and broadcasts are permitted.
    Active,
    /// Shutting down after a failure or server stop.
    Closing,
    /// Terminal.
    Closed,
}

/// Why a session's receive loop ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed its end on a frame boundary.
    RemoteClosed,
    /// The session was closed locally (server stop or failed broadcast).
    Closed,
    /// A transport, authentication or protocol failure.
    Failed(RelayError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed => write!(f, "remote closed"),
            Self::Closed => write!(f, "closed locally"),
            Self::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// One connected peer as seen by the server.
pub struct Session {
    peer_id: PeerId,
    connected_at: Instant,
    state: Mutex<SessionState>,
    /// Held only until the key has been written.
    handshake_writer: Mutex<Option<BoxedWriter>>,
    outbound_capacity: usize,
    /// Feeds the write task; `None` before activation and after close.
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    write_task: Mutex<Option<JoinHandle<()>>>,
    closed: Notify,
}

impl Session {
    /// Creates a session in the `Connecting` state around a write half.
    #[must_use]
    pub fn new(peer_id: PeerId, writer: BoxedWriter) -> Self {
        Self::with_capacity(peer_id, writer, DEFAULT_OUTBOUND_CAPACITY)
    }

    /// Like [`Session::new`] with an explicit outbound queue length.
    #[must_use]
    pub fn with_capacity(peer_id: PeerId, writer: BoxedWriter, outbound_capacity: usize) -> Self {
        Self {
            peer_id,
            connected_at: Instant::now(),
            state: Mutex::new(SessionState::Connecting),
            handshake_writer: Mutex::new(Some(writer)),
            outbound_capacity: outbound_capacity.max(1),
            outbound: Mutex::new(None),
            write_task: Mutex::new(None),
            closed: Notify::new(),
        }
    }

    /// The peer this session belongs to.
    #[must_use]
    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// When the connection was accepted.
    #[must_use]
    pub const fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Transmits the shared key, starts the write task and moves the session
    /// to `Active`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ClosedSession`] unless the session is still
    /// `Connecting`, or [`RelayError::Connection`] if the write fails.
    pub async fn send_key(&self, key: &[u8; KEY_LEN]) -> Result<(), RelayError> {
        if self.state() != SessionState::Connecting {
            return Err(RelayError::ClosedSession);
        }
        let mut writer = self
            .handshake_writer
            .lock()
            .take()
            .ok_or(RelayError::ClosedSession)?;
        codec::write_key(&mut writer, key).await?;

        if self.activate(writer) {
            Ok(())
        } else {
            Err(RelayError::ClosedSession)
        }
    }

    /// Hands `writer` to a new write task. Returns `false`, dropping the
    /// writer, if the session was closed while the key was in flight.
    fn activate(&self, writer: BoxedWriter) -> bool {
        let mut state = self.state.lock();
        if *state != SessionState::Connecting {
            return false;
        }
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        *self.outbound.lock() = Some(tx);
        *self.write_task.lock() = Some(tokio::spawn(write_loop(self.peer_id, writer, rx)));
        *state = SessionState::Active;
        true
    }

    /// Queues one encrypted token for the write task. Never waits.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ClosedSession`] if the session is not `Active`
    /// or its write task has ended, or [`RelayError::Connection`] with
    /// [`io::ErrorKind::WouldBlock`] if the peer has stopped draining its
    /// queue.
    pub fn send_frame(&self, token: Vec<u8>) -> Result<(), RelayError> {
        if self.state() != SessionState::Active {
            return Err(RelayError::ClosedSession);
        }
        let outbound = self.outbound.lock();
        let sender = outbound.as_ref().ok_or(RelayError::ClosedSession)?;
        sender.try_send(token).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::Connection(io::Error::new(
                io::ErrorKind::WouldBlock,
                "outbound queue full",
            )),
            TrySendError::Closed(_) => RelayError::ClosedSession,
        })
    }

    /// Moves the session to `Closing` and wakes its receive loop.
    ///
    /// Returns `false` if the session was already closing or closed.
    pub fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SessionState::Connecting | SessionState::Active => {
                *state = SessionState::Closing;
                drop(state);
                self.closed.notify_one();
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    /// Flushes queued frames, shuts the connection down and marks the session
    /// `Closed`.
    ///
    /// A peer that does not drain its frames within a short grace period is
    /// cut off. Safe to call any number of times.
    pub async fn close(&self) {
        self.begin_close();
        // Dropping the sender ends the write task once the queue is empty.
        self.outbound.lock().take();

        let handshake_writer = self.handshake_writer.lock().take();
        if let Some(mut writer) = handshake_writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(peer_id = %self.peer_id, error = %e, "shutdown on closed socket");
            }
        }

        let write_task = self.write_task.lock().take();
        if let Some(mut task) = write_task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
                tracing::warn!(peer_id = %self.peer_id, "peer not reading, discarding queued frames");
            }
        }
        *self.state.lock() = SessionState::Closed;
    }

    /// Closes the session immediately, discarding anything still queued.
    pub fn terminate(&self) {
        self.begin_close();
        self.outbound.lock().take();
        self.handshake_writer.lock().take();
        if let Some(task) = self.write_task.lock().take() {
            task.abort();
        }
        *self.state.lock() = SessionState::Closed;
    }

    /// Resolves once [`Session::begin_close`] has been called.
    async fn closing(&self) {
        self.closed.notified().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Drains a session's outbound queue onto its socket.
///
/// Ends when the queue is closed (then shuts the socket down) or on the first
/// write error. Either way the receiver is dropped, so later sends fail.
async fn write_loop(peer_id: PeerId, mut writer: BoxedWriter, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(token) = rx.recv().await {
        if let Err(e) = codec::write_frame(&mut writer, &token).await {
            tracing::warn!(peer_id = %peer_id, error = %e, "peer write failed");
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!(peer_id = %peer_id, error = %e, "shutdown on closed socket");
    }
}

/// Drives one accepted connection from key exchange to close.
///
/// The connection lifecycle:
/// 1. Write the shared key (bounded by the handshake timeout).
/// 2. Register the session.
/// 3. Receive frames and broadcast each decoded message to every other peer.
/// 4. On any terminal condition, deregister and close.
pub async fn run(state: Arc<RelayState>, stream: TcpStream, peer_id: PeerId) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer_id = %peer_id, error = %e, "failed to set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();
    let session = Arc::new(Session::with_capacity(
        peer_id,
        Box::new(writer),
        state.outbound_capacity(),
    ));
    serve(state, session, reader).await;
}

/// Key exchange, registration and receive loop for an already-split stream.
pub(crate) async fn serve<R>(state: Arc<RelayState>, session: Arc<Session>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let peer_id = session.peer_id();

    let handshake = tokio::time::timeout(
        state.handshake_timeout(),
        session.send_key(state.crypto().key_bytes()),
    )
    .await;
    match handshake {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(peer_id = %peer_id, error = %e, "failed to transmit key");
            session.close().await;
            return;
        }
        Err(_) => {
            tracing::warn!(peer_id = %peer_id, "timed out transmitting key");
            session.close().await;
            return;
        }
    }

    if let Some(previous) = state.registry.insert(Arc::clone(&session)) {
        tracing::info!(peer_id = %peer_id, "replaced stale session with same endpoint");
        previous.close().await;
    }
    // stop() may have drained the registry between accept and insert.
    if !state.is_running() {
        state.registry.remove(&session);
        session.close().await;
        return;
    }
    tracing::info!(peer_id = %peer_id, sessions = state.registry.len(), "peer session active");

    let reason = receive_loop(&state, &session, &mut reader).await;

    state.registry.remove(&session);
    session.close().await;
    match &reason {
        CloseReason::Failed(e) if e.is_desync() => {
            tracing::warn!(peer_id = %peer_id, reason = %reason, "dropping desynchronized peer");
        }
        _ => tracing::info!(peer_id = %peer_id, reason = %reason, "peer session closed"),
    }
}

/// Reads frames until the peer leaves, the stream desynchronizes, or the
/// session is closed locally.
async fn receive_loop<R>(state: &RelayState, session: &Session, reader: &mut R) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    let peer_id = session.peer_id();
    loop {
        if session.state() != SessionState::Active {
            return CloseReason::Closed;
        }

        let frame = tokio::select! {
            () = session.closing() => return CloseReason::Closed,
            frame = codec::read_frame(reader, state.max_frame_size()) => frame,
        };

        let token = match frame {
            Ok(Some(token)) => token,
            Ok(None) => return CloseReason::RemoteClosed,
            Err(e) => return CloseReason::Failed(e.into()),
        };

        let message = match Message::open(&token, state.crypto()) {
            Ok(m) => m,
            Err(e) => return CloseReason::Failed(e),
        };

        tracing::debug!(peer_id = %peer_id, bytes = token.len(), "relaying message");
        let report = state.broadcast(&message, Some(peer_id));
        if report.dropped > 0 {
            tracing::debug!(
                peer_id = %peer_id,
                delivered = report.delivered,
                dropped = report.dropped,
                "broadcast dropped failed recipients"
            );
        }
    }
}
