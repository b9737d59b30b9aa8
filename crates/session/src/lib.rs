//! Client-side session layer for the peerbeam relay.
//!
//! [`RelayClient`] maintains the WebSocket connection to the relay and
//! fans incoming [`ServerEvent`]s out to subscribers. [`RoomSession`]
//! sits on top of it and drives the join lifecycle: creating a room,
//! requesting to join a peer, accepting or rejecting requests, and
//! tearing the pairing down again. Chat payloads pass through a
//! [`MessageCipher`] so the relay only ever sees ciphertext.
//!
//! [`ServerEvent`]: peerbeam_protocol::events::ServerEvent

pub mod cipher;
pub mod client;
pub mod error;
pub mod events;
mod pumps;
pub mod room;

pub use cipher::{MessageCipher, PlaintextCipher};
pub use client::RelayClient;
pub use error::SessionError;
pub use events::{EventBus, Subscription};
pub use room::{ChatMessage, JoinState, RequestTarget, RoomSession, SessionEvent};
