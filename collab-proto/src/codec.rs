//! Framing for the relay byte stream.
//!
//! TCP does not preserve write boundaries, so every encrypted token is sent
//! as one frame with an explicit length header:
//!
//! ```text
//! [u32 length (BE)][token bytes]
//! ```
//!
//! The only unframed bytes on a connection are the [`KEY_LEN`]-byte key the
//! server writes first.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::KEY_LEN;

/// Size of the length header preceding every frame.
pub const LEN_PREFIX: usize = 4;

/// Default upper bound for a single frame body (64 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Underlying stream read or write failed.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Length header announces more than the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Announced body size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Frame is truncated or otherwise malformed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Prefixes `payload` with its big-endian `u32` length.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` if the payload exceeds `u32::MAX` bytes.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        CodecError::InvalidFrame(format!(
            "payload too large for framing: {} bytes",
            payload.len()
        ))
    })?;
    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Splits the first complete frame off the front of `bytes`.
///
/// For callers that accumulate socket data in their own buffer instead of
/// reading through [`read_frame`].
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the frame body
/// and the total number of bytes consumed (header included).
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` if the header announces a body larger
/// than `max_frame_size`.
pub fn decode_frame(
    bytes: &[u8],
    max_frame_size: usize,
) -> Result<Option<(&[u8], usize)>, CodecError> {
    let Some(header) = bytes.get(..LEN_PREFIX) else {
        return Ok(None);
    };
    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(header);
    let body_len = u32::from_be_bytes(len_bytes) as usize;
    if body_len > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: body_len,
            max: max_frame_size,
        });
    }

    let total = LEN_PREFIX + body_len;
    Ok(bytes.get(LEN_PREFIX..total).map(|body| (body, total)))
}

/// Reads one frame body from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream, i.e. the peer closed the
/// connection exactly on a frame boundary.
///
/// # Errors
///
/// - `CodecError::InvalidFrame` if the stream ends inside a length header.
/// - `CodecError::FrameTooLarge` if the header exceeds `max_frame_size`.
/// - `CodecError::Io` for transport failures, including EOF inside a body.
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Vec<u8>>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CodecError::InvalidFrame(format!(
                "stream ended after {filled} of {LEN_PREFIX} header bytes"
            )));
        }
        filled += n;
    }

    let body_len = u32::from_be_bytes(len_bytes) as usize;
    if body_len > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: body_len,
            max: max_frame_size,
        });
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Writes `payload` as a single frame and flushes the writer.
///
/// # Errors
///
/// Returns `CodecError::Io` on transport failure, or
/// `CodecError::InvalidFrame` if the payload cannot be length-prefixed.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes the raw shared key, the first bytes of every relay connection.
///
/// # Errors
///
/// Returns `CodecError::Io` on transport failure.
pub async fn write_key<W>(writer: &mut W, key: &[u8; KEY_LEN]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(key).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly [`KEY_LEN`] key bytes from a freshly opened connection.
///
/// # Errors
///
/// Returns `CodecError::Io` if the stream fails or ends before the whole key
/// has arrived.
pub async fn read_key<R>(reader: &mut R) -> Result<[u8; KEY_LEN], CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut key = [0u8; KEY_LEN];
    reader.read_exact(&mut key).await?;
    Ok(key)
}
