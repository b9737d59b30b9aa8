//! Relay event surface.
//!
//! Every event travels as `{"event": <name>, "data": <payload>}` over the
//! relay WebSocket. Client-to-server and server-to-client shapes differ for
//! several events (the relay stamps sender identity and strips room ids on
//! forward), so the two directions are separate sum types and every handler
//! matches exhaustively.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::{NetworkClient, RejectReason};

/// Events sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Claim a room id.
    #[serde(rename = "room:create", rename_all = "camelCase")]
    RoomCreate { room_id: String },

    /// Ask to join a room.
    #[serde(rename = "room:request", rename_all = "camelCase")]
    RoomRequest { room_id: String },

    /// Withdraw a pending join request.
    #[serde(rename = "room:request-cancel", rename_all = "camelCase")]
    RoomRequestCancel { room_id: String },

    /// Owner accepts the pending request.
    #[serde(rename = "room:accept", rename_all = "camelCase")]
    RoomAccept { room_id: String },

    /// Owner (or owner policy) rejects a requester.
    #[serde(rename = "room:reject", rename_all = "camelCase")]
    RoomReject {
        room_id: String,
        user_id: String,
        reason: RejectReason,
    },

    /// End the session. Payload is the bare room id.
    #[serde(rename = "room:terminate")]
    RoomTerminate(String),

    /// Opaque chat payload relay.
    #[serde(rename = "room:message", rename_all = "camelCase")]
    RoomMessage {
        room_id: String,
        encrypted_message: String,
    },

    /// E2E key exchange relay.
    #[serde(rename = "room:public-key", rename_all = "camelCase")]
    RoomPublicKey {
        room_id: String,
        public_key: String,
    },

    /// Transport signaling, opaque to the relay.
    #[serde(rename = "file:offer", rename_all = "camelCase")]
    FileOffer { room_id: String, sdp: Value },

    #[serde(rename = "file:answer", rename_all = "camelCase")]
    FileAnswer { room_id: String, sdp: Value },

    #[serde(rename = "file:candidate", rename_all = "camelCase")]
    FileCandidate { room_id: String, candidate: Value },

    /// Request a LAN-visible client by id; the relay resolves its room.
    #[serde(rename = "network:request", rename_all = "camelCase")]
    NetworkRequest { client_id: String },

    #[serde(rename = "network:request-cancel", rename_all = "camelCase")]
    NetworkRequestCancel { client_id: String },

    /// Forward compatibility: unknown events deserialize here.
    #[serde(other, deserialize_with = "ignore_content")]
    Unknown,
}

/// Events sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Create acknowledged; the id is now claimed by this client.
    #[serde(rename = "room:create", rename_all = "camelCase")]
    RoomCreate { room_id: String },

    /// A join request, forwarded to the room's occupants.
    #[serde(rename = "room:request", rename_all = "camelCase")]
    RoomRequest { room_id: String, user_id: String },

    /// A withdrawn request, forwarded to the room's occupants.
    #[serde(rename = "room:request-cancel", rename_all = "camelCase")]
    RoomRequestCancel { room_id: String, user_id: String },

    /// Request accepted; occupancy is now 2. Sent to both parties.
    #[serde(rename = "room:accept", rename_all = "camelCase")]
    RoomAccept { room_id: String },

    /// Request rejected; sent to the requester only.
    #[serde(rename = "room:reject", rename_all = "camelCase")]
    RoomReject {
        room_id: String,
        reason: RejectReason,
    },

    /// Session ended; sent to all occupants. Carries no payload.
    #[serde(rename = "room:terminate")]
    RoomTerminate,

    /// Chat payload, stamped with a fresh id and the sender's client id.
    #[serde(rename = "room:message", rename_all = "camelCase")]
    RoomMessage {
        id: String,
        sender_id: String,
        encrypted_message: String,
    },

    #[serde(rename = "room:public-key", rename_all = "camelCase")]
    RoomPublicKey {
        room_id: String,
        public_key: String,
    },

    /// Offer forwarded unchanged; answer and candidate are stripped to the
    /// opaque payload on forward.
    #[serde(rename = "file:offer", rename_all = "camelCase")]
    FileOffer { room_id: String, sdp: Value },

    #[serde(rename = "file:answer")]
    FileAnswer { sdp: Value },

    #[serde(rename = "file:candidate")]
    FileCandidate { candidate: Value },

    /// Snapshot of the caller's address group, sent on room creation.
    #[serde(rename = "network:connect")]
    NetworkConnect { clients: Vec<NetworkClient> },

    /// A client in the address group became connectable.
    #[serde(rename = "network:join")]
    NetworkJoin { client: NetworkClient },

    #[serde(rename = "network:leave", rename_all = "camelCase")]
    NetworkLeave { client_id: String },

    /// Generic failure notice (e.g. duplicate room id on create).
    #[serde(rename = "error")]
    Error { messages: Vec<String> },

    /// Forward compatibility: unknown events deserialize here.
    #[serde(other, deserialize_with = "ignore_content")]
    Unknown,
}

/// Drains the `data` payload of an unrecognized event: serde's
/// `#[serde(other)]` on an adjacently tagged enum rejects a present content
/// field unless the variant consumes it.
fn ignore_content<'de, D: Deserializer<'de>>(deserializer: D) -> Result<(), D::Error> {
    serde::de::IgnoredAny::deserialize(deserializer)?;
    Ok(())
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_create_wire_form() {
        let ev = ClientEvent::RoomCreate {
            room_id: "room_ab12c".into(),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"event": "room:create", "data": {"roomId": "room_ab12c"}})
        );
    }

    #[test]
    fn client_terminate_bare_room_id() {
        let ev = ClientEvent::RoomTerminate("room_ab12c".into());
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"event": "room:terminate", "data": "room_ab12c"})
        );
    }

    #[test]
    fn server_terminate_has_no_payload() {
        let json = ServerEvent::RoomTerminate.to_json().unwrap();
        assert_eq!(json, r#"{"event":"room:terminate"}"#);
        let parsed = ServerEvent::from_json(&json).unwrap();
        assert_eq!(parsed, ServerEvent::RoomTerminate);
    }

    #[test]
    fn reject_carries_reason_code() {
        let ev = ClientEvent::RoomReject {
            room_id: "room_x".into(),
            user_id: "u1".into(),
            reason: RejectReason::HostRejected,
        };
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["data"]["reason"], "HOST_REJECTED");
        assert_eq!(value["data"]["userId"], "u1");
    }

    #[test]
    fn server_reject_roundtrip() {
        let text = r#"{"event":"room:reject","data":{"roomId":"room_x","reason":"ROOM_FULL"}}"#;
        let parsed = ServerEvent::from_json(text).unwrap();
        assert_eq!(
            parsed,
            ServerEvent::RoomReject {
                room_id: "room_x".into(),
                reason: RejectReason::RoomFull,
            }
        );
    }

    #[test]
    fn offer_payload_is_opaque() {
        let text = r#"{"event":"file:offer","data":{"roomId":"room_x","sdp":{"kind":"offer","token":"aa"}}}"#;
        let parsed = ClientEvent::from_json(text).unwrap();
        match parsed {
            ClientEvent::FileOffer { room_id, sdp } => {
                assert_eq!(room_id, "room_x");
                assert_eq!(sdp["kind"], "offer");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn stamped_message_shape() {
        let ev = ServerEvent::RoomMessage {
            id: "m1".into(),
            sender_id: "c9".into(),
            encrypted_message: "opaque".into(),
        };
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["data"]["senderId"], "c9");
        assert!(value["data"].get("roomId").is_none());
    }

    #[test]
    fn unknown_event_is_tolerated() {
        let parsed = ServerEvent::from_json(r#"{"event":"room:future-thing"}"#).unwrap();
        assert_eq!(parsed, ServerEvent::Unknown);
        let parsed = ClientEvent::from_json(r#"{"event":"nope","data":{"x":1}}"#).unwrap();
        assert_eq!(parsed, ClientEvent::Unknown);
    }
}
