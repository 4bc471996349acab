use crate::signaling::messages::ClientMessage;
use crate::signaling::relay::SignalingRelay;
use crate::types::SignalEnvelope;
use crate::utils::{Error, Result};
use log::{debug, warn};
use std::sync::Arc;

/// Maps inbound client frames onto relay operations.
pub struct MessageHandler {
    relay: Arc<SignalingRelay>,
}

impl MessageHandler {
    pub fn new(relay: Arc<SignalingRelay>) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &Arc<SignalingRelay> {
        &self.relay
    }

    pub fn handle_message(&self, connection_id: &str, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::JoinRoom { room_key, display_name } => {
                self.relay.on_join(connection_id, &room_key, &display_name)
            }
            ClientMessage::LeaveRoom => {
                self.relay.on_leave(connection_id);
                Ok(())
            }
            ClientMessage::Signal { kind, recipient_id, ciphertext } => {
                self.handle_signal(SignalEnvelope {
                    kind,
                    sender_id: connection_id.to_string(),
                    recipient_id,
                    ciphertext,
                });
                Ok(())
            }
            ClientMessage::Broadcast { kind, payload } => {
                match self.relay.room_of(connection_id) {
                    Some(room_key) => {
                        let count = self.relay.on_broadcast(&room_key, connection_id, payload, kind);
                        debug!("{:?} broadcast from {} reached {} peers", kind, connection_id, count);
                    }
                    None => warn!("Dropping {:?} broadcast from {}: not in a room", kind, connection_id),
                }
                Ok(())
            }
            ClientMessage::SetMuted { muted } => {
                self.relay.on_set_muted(connection_id, muted);
                Ok(())
            }
        }
    }

    fn handle_signal(&self, envelope: SignalEnvelope) {
        match self.relay.on_relay_signal(envelope) {
            Ok(()) => {}
            Err(Error::RecipientUnavailable(recipient)) => {
                debug!("Dropping signal for unavailable peer {}", recipient);
            }
            Err(e) => warn!("Failed to relay signal: {}", e),
        }
    }

    pub fn handle_disconnect(&self, connection_id: &str) {
        self.relay.disconnect(connection_id);
    }
}
