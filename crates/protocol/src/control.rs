//! Transfer control plane.
//!
//! Small JSON text messages interleaved with raw binary chunks on each
//! transfer sub-channel. Binary messages carry file bytes with no framing
//! beyond channel message boundaries; these four messages coordinate the
//! lifecycle around them.

use serde::{Deserialize, Serialize};

use crate::types::FileMeta;

/// One control message, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Declares the transfer before any binary chunk.
    #[serde(rename = "META")]
    Meta { id: String, meta: FileMeta },

    /// All chunks sent; the sender now awaits ACK or CANCEL.
    #[serde(rename = "EOF")]
    Eof { id: String },

    /// Receiver confirms assembly of the complete file.
    #[serde(rename = "ACK")]
    Ack { id: String },

    /// Abort, valid in either direction: sender aborts the stream, or
    /// receiver refuses further chunks.
    #[serde(rename = "CANCEL")]
    Cancel { id: String },
}

impl ControlMessage {
    /// The transfer id this message belongs to.
    pub fn id(&self) -> &str {
        match self {
            ControlMessage::Meta { id, .. }
            | ControlMessage::Eof { id }
            | ControlMessage::Ack { id }
            | ControlMessage::Cancel { id } => id,
        }
    }

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
    fn meta_wire_form() {
        let msg = ControlMessage::Meta {
            id: "t1".into(),
            meta: FileMeta {
                name: "photo.jpg".into(),
                size: 123_456,
                mime: "image/jpeg".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "META",
                "id": "t1",
                "meta": {"name": "photo.jpg", "size": 123_456, "mime": "image/jpeg"},
            })
        );
    }

    #[test]
    fn short_forms_roundtrip() {
        for msg in [
            ControlMessage::Eof { id: "t1".into() },
            ControlMessage::Ack { id: "t1".into() },
            ControlMessage::Cancel { id: "t1".into() },
        ] {
            let json = msg.to_json().unwrap();
            assert_eq!(ControlMessage::from_json(&json).unwrap(), msg);
            assert_eq!(msg.id(), "t1");
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(ControlMessage::from_json(r#"{"type":"NOPE","id":"t1"}"#).is_err());
    }
}
