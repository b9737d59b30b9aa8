use serde::{Deserialize, Serialize};

/// Reason attached to a `room:reject` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// The room already holds two occupants (one of them may be a pending
    /// requester whose handshake has not resolved yet).
    RoomFull,
    /// The room owner declined the request.
    HostRejected,
    /// The room owner is engaged: an established session or another
    /// unresolved request.
    HostBusy,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::RoomFull => "ROOM_FULL",
            RejectReason::HostRejected => "HOST_REJECTED",
            RejectReason::HostBusy => "HOST_BUSY",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File metadata declared by the sender before any binary chunk.
///
/// The receiver trusts `size` for progress math only; the assembled file
/// holds whatever bytes actually arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    /// MIME type; may be empty when unknown.
    #[serde(default)]
    pub mime: String,
}

/// Relay-assigned identity of a client visible in an address group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkClient {
    pub id: String,
    /// Display alias ("Adjective Fruit"), assigned by the relay.
    pub name: String,
    pub device_type: String,
    pub device_model: String,
}
