//! Negotiation payloads carried over the signaling path.
//!
//! The relay forwards these as opaque JSON. Only the two peers interpret
//! them: the offer carries the connection token, candidates carry the
//! socket addresses the offering side is reachable on.

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Session description exchanged once per connection and direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub token: String,
}

impl SessionDescription {
    pub fn to_value(&self) -> serde_json::Value {
        // Serializing a two-field struct cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, ChannelError> {
        serde_json::from_value(value.clone())
            .map_err(|err| ChannelError::Signaling(format!("bad session description: {err}")))
    }
}

/// One address the offering side listens on, as `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub addr: String,
}

impl Candidate {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self, ChannelError> {
        serde_json::from_value(value.clone())
            .map_err(|err| ChannelError::Signaling(format!("bad candidate: {err}")))
    }
}
