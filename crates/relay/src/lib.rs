//! Rendezvous relay.
//!
//! A thin WebSocket server that introduces clients on the same network to
//! each other, brokers room negotiation, and forwards chat and transport
//! signaling between a room's occupants. File bytes never pass through
//! here; once two peers are introduced they talk directly.

pub mod client;
pub mod error;
pub mod identity;
pub mod registry;
pub mod server;

pub use client::ClientSender;
pub use error::RelayError;
pub use server::{RelayConfig, RelayServer};

/// Per-client outbound buffer. Events beyond this are dropped with a
/// warning rather than stalling the dispatch path.
pub const SEND_BUFFER_SIZE: usize = 64;
