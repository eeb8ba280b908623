//! Client side of the collaboration relay.
//!
//! [`RelayClient`] connects to a relay, receives its shared key, and from then
//! on exchanges encrypted [`Message`]s with every other connected editor.

pub mod client;
pub mod config;

pub use client::{ClientOptions, ClientState, MessageHandler, RelayClient};
pub use collab_proto::Message;
