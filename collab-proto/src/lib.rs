//! Shared protocol definitions for the collaboration relay wire format.
//!
//! A connection starts with the server writing the raw shared key
//! ([`codec::write_key`]). After that every application [`message::Message`]
//! travels as one length-prefixed frame ([`codec::write_frame`]) whose body is
//! an authenticated token produced by [`crypto::CryptoContext::encrypt`].

pub mod codec;
pub mod crypto;
pub mod error;
pub mod message;

pub use crypto::CryptoContext;
pub use error::RelayError;
pub use message::Message;

/// Default TCP port for the collaboration relay.
pub const DEFAULT_PORT: u16 = 8888;
