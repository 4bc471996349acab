use crate::types::{BroadcastKind, ConnectionId, Participant, SignalKind};
use serde::{Deserialize, Serialize};

/// Frames sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom {
        room_key: String,
        display_name: String,
    },
    LeaveRoom,
    Signal {
        #[serde(rename = "type")]
        kind: SignalKind,
        recipient_id: ConnectionId,
        ciphertext: String,
    },
    Broadcast {
        kind: BroadcastKind,
        payload: serde_json::Value,
    },
    SetMuted {
        muted: bool,
    },
}

/// Frames sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome {
        id: ConnectionId,
    },
    ParticipantJoined {
        id: ConnectionId,
        display_name: String,
    },
    ParticipantLeft {
        id: ConnectionId,
    },
    Roster {
        participants: Vec<Participant>,
    },
    Signal {
        #[serde(rename = "type")]
        kind: SignalKind,
        sender_id: ConnectionId,
        ciphertext: String,
    },
    Broadcast {
        kind: BroadcastKind,
        sender_id: ConnectionId,
        payload: serde_json::Value,
    },
    Error {
        message: String,
    },
}
