//! Error taxonomy shared by the relay server and client.

use crate::codec::CodecError;
use crate::crypto::CryptoError;

/// Every failure the relay can observe, classified by how it is handled.
///
/// - [`RelayError::Connection`] and [`RelayError::Authentication`] during a
///   receive loop terminate only the affected session or client.
/// - [`RelayError::Protocol`] means the byte stream can no longer be trusted
///   and is treated the same way.
/// - [`RelayError::ClosedSession`] is returned for operations attempted after
///   a session or client has reached its terminal state.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Transport failure: refused, reset, broken pipe, unexpected EOF.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Decrypt or verify failure from a wrong key or corrupted bytes.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The frame or its decrypted payload is not a valid message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session or client has already been closed.
    #[error("session is closed")]
    ClosedSession,
}

impl RelayError {
    /// Returns `true` when the error means the peer's byte stream is
    /// desynchronized and every later byte must be distrusted.
    #[must_use]
    pub const fn is_desync(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::Protocol(_))
    }
}

impl From<CryptoError> for RelayError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Authentication => Self::Authentication(err.to_string()),
            CryptoError::InvalidKeyLength(_) | CryptoError::EncryptionFailed => {
                Self::Protocol(err.to_string())
            }
        }
    }
}

impl From<CodecError> for RelayError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(io) => Self::Connection(io),
            other @ (CodecError::FrameTooLarge { .. } | CodecError::InvalidFrame(_)) => {
                Self::Protocol(other.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid message payload: {err}"))
    }
}
