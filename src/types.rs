// src/types.rs
use serde::{Deserialize, Serialize};

/// Relay-assigned identifier of one live connection; doubles as participant id.
pub type ConnectionId = String;
pub type RoomKey = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ConnectionId,
    pub name: String,
    pub muted: bool,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            muted: false,
        }
    }
}

pub type RosterSnapshot = Vec<Participant>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastKind {
    Chat,
    File,
    Drawing,
}

/// One point-to-point signaling message as seen by the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub kind: SignalKind,
    pub sender_id: ConnectionId,
    pub recipient_id: ConnectionId,
    pub ciphertext: String,
}
