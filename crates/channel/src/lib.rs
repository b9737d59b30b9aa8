//! Direct peer-to-peer transport.
//!
//! Two peers negotiate a TCP connection through an out-of-band signaling
//! path (descriptions and candidates relayed as opaque JSON), then multiplex
//! any number of labeled sub-channels over the single stream. Each
//! sub-channel carries text and binary messages and exposes a buffered-amount
//! counter with a low-water notification so producers can pace themselves.

use std::time::Duration;

pub mod channel;
pub mod connection;
pub mod error;
pub mod signaling;
pub mod token;
pub mod wire;

pub use channel::{ChannelMessage, ChannelWriter, SubChannel};
pub use connection::{ConnectionState, PeerConnection, Role};
pub use error::ChannelError;
pub use signaling::{Candidate, DescriptionKind, SessionDescription};

/// How long the offering side keeps its listener open waiting for the
/// remote peer to dial in.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-candidate dial timeout on the answering side. Candidates are tried
/// in arrival order, so a stale address must fail fast.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long either side waits for the token exchange once a TCP stream
/// is established.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `open_channel` waits for the remote acknowledgment. A timeout
/// here is a hard failure, not a retryable stall.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket buffer size. Peers stream file chunks through sub-channels, so
/// reads and writes are buffered well above the default page size.
pub const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// Upper bound on a single multiplexed frame. A frame larger than this is
/// treated as a protocol violation, not an allocation request.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Handshake byte sent when the dialer's token matches.
pub const AUTH_OK: u8 = 0x01;

/// Handshake byte sent when the dialer's token is rejected.
pub const AUTH_REJECTED: u8 = 0x00;
