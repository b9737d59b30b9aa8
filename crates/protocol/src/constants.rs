use std::time::Duration;

/// Time to wait for a pong response (or any incoming message).
///
/// This acts as a read deadline: if *nothing* arrives within this window
/// (no pong, no forwarded event), the relay connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often clients send keepalive pings (must be well below [`WS_PONG_WAIT`]).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum relay message size in bytes (1 MB).
///
/// Relay traffic is small JSON events; file bytes never travel through the
/// relay. The limit leaves headroom for key material and batched snapshots.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
