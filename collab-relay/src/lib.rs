//! Collaboration relay server library.
//!
//! Exposes the relay server for use in tests and embedding. The server
//! accepts plain TCP connections, hands each peer the run's shared key,
//! and fans every message a peer sends out to all other connected peers.

pub mod config;
pub mod registry;
pub mod server;
pub mod session;

pub use server::{BroadcastReport, RelayServer, RelayState};
pub use session::PeerId;
