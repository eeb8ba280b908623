//! Outbound connection to a collaboration relay.
//!
//! [`RelayClient::connect`] opens a TCP connection, reads the relay's shared
//! key, and spawns a background task that decrypts incoming frames and hands
//! each decoded [`Message`] to the handler supplied at construction.
//!
//! The public surface never returns errors: `connect` and `send` report
//! success as a `bool`, and a lost connection is observed through
//! [`RelayClient::is_connected`] / [`RelayClient::state`]. Handlers run on the
//! receive task and must return promptly; a slow handler delays every later
//! message on the same connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use collab_proto::codec::{self, DEFAULT_MAX_FRAME_SIZE};
use collab_proto::{CryptoContext, Message, RelayError};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default timeout for connecting and receiving the key.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback invoked with every message received from the relay.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Tunables for a [`RelayClient`].
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Upper bound for opening the connection and again for reading the key.
    pub connect_timeout: Duration,
    /// Largest frame body accepted from the relay.
    pub max_frame_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Client lifecycle. Each call to `connect` starts a fresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No usable connection.
    Disconnected,
    /// A `connect` call is in progress.
    Connecting,
    /// Key received; `send` is possible.
    Connected,
}

/// State shared between a link's owner and its receive task.
struct LinkShared {
    connected: AtomicBool,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

impl LinkShared {
    /// Marks the link dead and shuts the write half down.
    async fn close_writer(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "shutdown on closed relay socket");
            }
        }
    }
}

/// Clears the connected flag however the receive task ends, including abort.
struct ConnectedGuard(Arc<LinkShared>);

impl Drop for ConnectedGuard {
    fn drop(&mut self) {
        self.0.connected.store(false, Ordering::SeqCst);
    }
}

/// One connection cycle.
struct Link {
    peer_addr: SocketAddr,
    crypto: CryptoContext,
    shared: Arc<LinkShared>,
    reader: JoinHandle<()>,
}

impl Link {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &Message) -> Result<(), RelayError> {
        let token = message.seal(&self.crypto)?;
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(RelayError::ClosedSession)?;
        codec::write_frame(writer, &token).await?;
        Ok(())
    }

    async fn close(&self) {
        self.reader.abort();
        self.shared.close_writer().await;
    }
}

/// Connection to a relay server plus the handler for inbound messages.
pub struct RelayClient {
    handler: MessageHandler,
    options: ClientOptions,
    link: Mutex<Option<Arc<Link>>>,
    connecting: AtomicBool,
}

impl RelayClient {
    /// Creates a disconnected client that delivers messages to `handler`.
    pub fn new(handler: impl Fn(Message) + Send + Sync + 'static) -> Self {
        Self::with_options(handler, ClientOptions::default())
    }

    /// Creates a disconnected client with custom [`ClientOptions`].
    pub fn with_options(
        handler: impl Fn(Message) + Send + Sync + 'static,
        options: ClientOptions,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            options,
            link: Mutex::new(None),
            connecting: AtomicBool::new(false),
        }
    }

    /// Creates a client whose handler forwards every message into a channel.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        Self::channel_with_options(ClientOptions::default())
    }

    /// Like [`RelayClient::channel`], with custom [`ClientOptions`].
    #[must_use]
    pub fn channel_with_options(
        options: ClientOptions,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self::with_options(
            move |message| {
                // Receiver dropped: the application stopped listening.
                let _ = tx.send(message);
            },
            options,
        );
        (client, rx)
    }

    /// Connects to the relay at `host:port` and waits for the shared key.
    ///
    /// Any existing connection is closed first; a new cycle never resumes
    /// the previous one. Returns `false` if the relay is unreachable, the
    /// key does not arrive in time, or the key is malformed.
    pub async fn connect(&self, host: &str, port: u16) -> bool {
        self.disconnect().await;

        self.connecting.store(true, Ordering::SeqCst);
        let result = self.establish(host, port).await;
        self.connecting.store(false, Ordering::SeqCst);

        match result {
            Ok(link) => {
                tracing::info!(host, port, "connected to collaboration relay");
                let previous = self.link.lock().replace(Arc::new(link));
                if let Some(previous) = previous {
                    previous.close().await;
                }
                true
            }
            Err(e) => {
                tracing::warn!(host, port, error = %e, "failed to connect to relay");
                false
            }
        }
    }

    /// Encrypts and sends `message` to the relay.
    ///
    /// Returns `false` without touching the network when not connected. A
    /// transport failure marks the client disconnected and returns `false`.
    pub async fn send(&self, message: &Message) -> bool {
        let Some(link) = self.current_link() else {
            tracing::debug!("send while disconnected");
            return false;
        };
        if !link.is_connected() {
            tracing::debug!("send on dead connection");
            return false;
        }

        match link.send(message).await {
            Ok(()) => true,
            Err(e @ (RelayError::Connection(_) | RelayError::ClosedSession)) => {
                tracing::warn!(error = %e, "relay send failed, disconnecting");
                link.close().await;
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to seal message");
                false
            }
        }
    }

    /// Closes the connection, if any. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.close().await;
            tracing::info!(relay = %link.peer_addr, "disconnected from relay");
        }
    }

    /// Returns `true` while the current connection is usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current_link().is_some_and(|link| link.is_connected())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        if self.connecting.load(Ordering::SeqCst) {
            ClientState::Connecting
        } else if self.is_connected() {
            ClientState::Connected
        } else {
            ClientState::Disconnected
        }
    }

    /// Address of the relay for the current connection cycle.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.current_link().map(|link| link.peer_addr)
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.lock().clone()
    }

    /// Opens the socket, reads the key, and spawns the receive task.
    async fn establish(&self, host: &str, port: u16) -> Result<Link, RelayError> {
        let timeout = self.options.connect_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| timed_out("connect"))??;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let peer_addr = stream.peer_addr()?;
        let (mut reader, writer) = stream.into_split();

        let key = tokio::time::timeout(timeout, codec::read_key(&mut reader))
            .await
            .map_err(|_| timed_out("key exchange"))??;
        let crypto = CryptoContext::from_key(&key)?;

        let shared = Arc::new(LinkShared {
            connected: AtomicBool::new(true),
            writer: tokio::sync::Mutex::new(Some(writer)),
        });
        let reader = tokio::spawn(receive_loop(
            reader,
            crypto.clone(),
            Arc::clone(&self.handler),
            Arc::clone(&shared),
            self.options.max_frame_size,
        ));

        Ok(Link {
            peer_addr,
            crypto,
            shared,
            reader,
        })
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.reader.abort();
        }
    }
}

impl fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayClient")
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr())
            .finish_non_exhaustive()
    }
}

fn timed_out(stage: &str) -> RelayError {
    RelayError::Connection(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{stage} timed out"),
    ))
}

/// Background task: decrypt frames and deliver them until the link ends.
///
/// A frame that fails authentication or does not decode to a message means
/// the stream can no longer be trusted, so the connection is dropped rather
/// than skipping the frame.
async fn receive_loop(
    mut reader: OwnedReadHalf,
    crypto: CryptoContext,
    handler: MessageHandler,
    shared: Arc<LinkShared>,
    max_frame_size: usize,
) {
    let _guard = ConnectedGuard(Arc::clone(&shared));

    loop {
        let token = match codec::read_frame(&mut reader, max_frame_size).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                tracing::info!("relay closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %RelayError::from(e), "relay read failed");
                break;
            }
        };

        match Message::open(&token, &crypto) {
            Ok(message) => handler(message),
            Err(e) => {
                tracing::warn!(error = %e, "undecodable frame from relay, dropping connection");
                break;
            }
        }
    }

    shared.close_writer().await;
    tracing::debug!("relay receive task exiting");
}
