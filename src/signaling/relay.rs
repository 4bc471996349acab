use crate::metrics;
use crate::room::{JoinOutcome, RosterStore};
use crate::signaling::messages::ServerMessage;
use crate::types::{BroadcastKind, ConnectionId, RoomKey, SignalEnvelope};
use crate::utils::{Error, Result};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug)]
struct ConnectionEntry {
    outbox: Outbox,
    room: Option<RoomKey>,
}

/// Server-side hub: owns the live connections and routes every message
/// between them. Membership changes for a room, and the roster fan-out that
/// follows, run under that room's lock in the `RosterStore`.
pub struct SignalingRelay {
    roster: Arc<RosterStore>,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl SignalingRelay {
    pub fn new(roster: Arc<RosterStore>) -> Self {
        Self {
            roster,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn roster(&self) -> &Arc<RosterStore> {
        &self.roster
    }

    /// Registers a new live connection and queues its `welcome`.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = Uuid::new_v4().to_string();
        let (outbox, rx) = mpsc::unbounded_channel();
        let _ = outbox.send(ServerMessage::Welcome { id: id.clone() });

        self.connections
            .write()
            .insert(id.clone(), ConnectionEntry { outbox, room: None });
        metrics::connection_opened();
        debug!("Registered connection {}", id);
        (id, rx)
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.connections.read().contains_key(connection_id)
    }

    /// Direct reply to one connection, outside any room.
    pub fn send_to(&self, connection_id: &str, message: ServerMessage) -> bool {
        deliver(&self.connections.read(), connection_id, message)
    }

    pub fn room_of(&self, connection_id: &str) -> Option<RoomKey> {
        self.connections
            .read()
            .get(connection_id)
            .and_then(|entry| entry.room.clone())
    }

    pub fn on_join(&self, connection_id: &str, room_key: &str, display_name: &str) -> Result<()> {
        let previous = self
            .connections
            .read()
            .get(connection_id)
            .map(|entry| entry.room.clone())
            .ok_or_else(|| Error::Peer(format!("Unknown connection {}", connection_id)))?;

        if let Some(previous) = previous {
            if previous != room_key {
                info!("{} switching from room {} to {}", connection_id, previous, room_key);
                self.on_leave(connection_id);
            }
        }

        self.roster.mutate(room_key, |room| {
            let outcome = room.join(connection_id, display_name);
            {
                let mut connections = self.connections.write();
                match connections.get_mut(connection_id) {
                    Some(entry) => entry.room = Some(room_key.to_string()),
                    None => {
                        room.leave(connection_id);
                        return;
                    }
                }
            }

            let connections = self.connections.read();
            if outcome == JoinOutcome::Added {
                metrics::participant_joined();
                info!("{} ({}) joined room {}", connection_id, display_name, room_key);
                let joined = ServerMessage::ParticipantJoined {
                    id: connection_id.to_string(),
                    display_name: display_name.to_string(),
                };
                for member in room.member_ids().filter(|m| m.as_str() != connection_id) {
                    deliver(&connections, member, joined.clone());
                }
            }

            let roster = ServerMessage::Roster {
                participants: room.snapshot(),
            };
            for member in room.member_ids() {
                deliver(&connections, member, roster.clone());
            }
        });
        Ok(())
    }

    /// Removes the connection from its room, if any. Safe to call repeatedly.
    pub fn on_leave(&self, connection_id: &str) {
        let room_key = {
            let mut connections = self.connections.write();
            match connections.get_mut(connection_id).and_then(|e| e.room.take()) {
                Some(key) => key,
                None => return,
            }
        };

        self.roster.mutate(&room_key, |room| {
            if !room.leave(connection_id) {
                return;
            }
            metrics::participant_left();
            info!("{} left room {}", connection_id, room_key);

            let connections = self.connections.read();
            let left = ServerMessage::ParticipantLeft {
                id: connection_id.to_string(),
            };
            let roster = ServerMessage::Roster {
                participants: room.snapshot(),
            };
            for member in room.member_ids() {
                deliver(&connections, member, left.clone());
                deliver(&connections, member, roster.clone());
            }
        });
    }

    /// Transport closed: leave, then forget the outbox.
    pub fn disconnect(&self, connection_id: &str) {
        self.on_leave(connection_id);
        if self.connections.write().remove(connection_id).is_some() {
            metrics::connection_closed();
            debug!("Unregistered connection {}", connection_id);
        }
    }

    /// Forwards an opaque signal to its recipient. The ciphertext is never
    /// inspected.
    pub fn on_relay_signal(&self, envelope: SignalEnvelope) -> Result<()> {
        let connections = self.connections.read();
        let sender_room = connections
            .get(&envelope.sender_id)
            .and_then(|entry| entry.room.as_ref());
        let recipient = connections.get(&envelope.recipient_id);

        match (sender_room, recipient) {
            (Some(room), Some(entry)) if entry.room.as_ref() == Some(room) => {
                let forwarded = ServerMessage::Signal {
                    kind: envelope.kind,
                    sender_id: envelope.sender_id.clone(),
                    ciphertext: envelope.ciphertext,
                };
                if entry.outbox.send(forwarded).is_err() {
                    metrics::signal_dropped();
                    return Err(Error::RecipientUnavailable(envelope.recipient_id));
                }
                metrics::signal_forwarded();
                debug!(
                    "Relayed {:?} {} -> {}",
                    envelope.kind, envelope.sender_id, envelope.recipient_id
                );
                Ok(())
            }
            _ => {
                metrics::signal_dropped();
                Err(Error::RecipientUnavailable(envelope.recipient_id))
            }
        }
    }

    /// Fans a payload out to every room member except the sender. Returns the
    /// number of recipients.
    pub fn on_broadcast(
        &self,
        room_key: &str,
        sender_id: &str,
        payload: serde_json::Value,
        kind: BroadcastKind,
    ) -> usize {
        let delivered = self
            .roster
            .inspect(room_key, |room| {
                if !room.contains(sender_id) {
                    warn!("{} broadcast to room {} without membership", sender_id, room_key);
                    return 0;
                }
                let connections = self.connections.read();
                let message = ServerMessage::Broadcast {
                    kind,
                    sender_id: sender_id.to_string(),
                    payload,
                };
                room.member_ids()
                    .filter(|m| m.as_str() != sender_id)
                    .filter(|m| deliver(&connections, m, message.clone()))
                    .count()
            })
            .unwrap_or(0);
        metrics::broadcast_sent(delivered);
        delivered
    }

    pub fn on_set_muted(&self, connection_id: &str, muted: bool) {
        let room_key = match self.room_of(connection_id) {
            Some(key) => key,
            None => return,
        };
        self.roster.mutate(&room_key, |room| {
            if !room.set_muted(connection_id, muted) {
                return;
            }
            let connections = self.connections.read();
            let roster = ServerMessage::Roster {
                participants: room.snapshot(),
            };
            for member in room.member_ids() {
                deliver(&connections, member, roster.clone());
            }
        });
    }
}

fn deliver(
    connections: &HashMap<ConnectionId, ConnectionEntry>,
    connection_id: &str,
    message: ServerMessage,
) -> bool {
    match connections.get(connection_id) {
        Some(entry) => entry.outbox.send(message).is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Participant, SignalKind};
    use serde_json::json;

    fn relay() -> SignalingRelay {
        SignalingRelay::new(Arc::new(RosterStore::new()))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn roster_ids(participants: &[Participant]) -> Vec<&str> {
        participants.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn connect_sends_welcome() {
        let relay = relay();
        let (id, mut rx) = relay.connect();
        assert_eq!(drain(&mut rx), vec![ServerMessage::Welcome { id }]);
    }

    #[test]
    fn join_notifies_existing_members_and_everyone_gets_roster() {
        let relay = relay();
        let (a, mut rx_a) = relay.connect();
        let (b, mut rx_b) = relay.connect();
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.on_join(&a, "r1", "A").unwrap();
        match drain(&mut rx_a).as_slice() {
            [ServerMessage::Roster { participants }] => assert_eq!(roster_ids(participants), vec![a.as_str()]),
            other => panic!("unexpected {:?}", other),
        }

        relay.on_join(&b, "r1", "B").unwrap();
        let to_a = drain(&mut rx_a);
        assert_eq!(
            to_a[0],
            ServerMessage::ParticipantJoined { id: b.clone(), display_name: "B".into() }
        );
        match &to_a[1] {
            ServerMessage::Roster { participants } => {
                assert_eq!(roster_ids(participants), vec![a.as_str(), b.as_str()])
            }
            other => panic!("unexpected {:?}", other),
        }

        let to_b = drain(&mut rx_b);
        assert_eq!(to_b.len(), 1, "newcomer gets no participant-joined for itself");
        assert!(matches!(&to_b[0], ServerMessage::Roster { participants } if participants.len() == 2));
    }

    #[test]
    fn rejoin_same_room_only_refreshes_roster() {
        let relay = relay();
        let (a, mut rx_a) = relay.connect();
        let (b, mut rx_b) = relay.connect();
        relay.on_join(&a, "r1", "A").unwrap();
        relay.on_join(&b, "r1", "B").unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay.on_join(&b, "r1", "Bee").unwrap();
        let to_a = drain(&mut rx_a);
        assert_eq!(to_a.len(), 1);
        assert!(matches!(&to_a[0], ServerMessage::Roster { participants } if participants[1].name == "Bee"));
    }

    #[test]
    fn joining_another_room_leaves_the_first() {
        let relay = relay();
        let (a, mut rx_a) = relay.connect();
        let (b, _rx_b) = relay.connect();
        relay.on_join(&a, "r1", "A").unwrap();
        relay.on_join(&b, "r1", "B").unwrap();
        drain(&mut rx_a);

        relay.on_join(&b, "r2", "B").unwrap();
        let to_a = drain(&mut rx_a);
        assert_eq!(to_a[0], ServerMessage::ParticipantLeft { id: b.clone() });
        assert_eq!(relay.roster().snapshot("r1").len(), 1);
        assert_eq!(relay.roster().snapshot("r2").len(), 1);
        assert_eq!(relay.room_of(&b).as_deref(), Some("r2"));
    }

    #[test]
    fn leave_twice_broadcasts_once() {
        let relay = relay();
        let (a, mut rx_a) = relay.connect();
        let (b, _rx_b) = relay.connect();
        relay.on_join(&a, "r1", "A").unwrap();
        relay.on_join(&b, "r1", "B").unwrap();
        drain(&mut rx_a);

        relay.on_leave(&b);
        relay.on_leave(&b);
        relay.disconnect(&b);
        let to_a = drain(&mut rx_a);
        assert_eq!(to_a.len(), 2);
        assert_eq!(to_a[0], ServerMessage::ParticipantLeft { id: b.clone() });
        assert!(matches!(&to_a[1], ServerMessage::Roster { participants } if roster_ids(participants) == vec![a.as_str()]));
    }

    #[test]
    fn signal_is_forwarded_with_sender_id() {
        let relay = relay();
        let (a, mut rx_a) = relay.connect();
        let (b, mut rx_b) = relay.connect();
        relay.on_join(&a, "r1", "A").unwrap();
        relay.on_join(&b, "r1", "B").unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        relay
            .on_relay_signal(SignalEnvelope {
                kind: SignalKind::Offer,
                sender_id: a.clone(),
                recipient_id: b.clone(),
                ciphertext: "E".into(),
            })
            .unwrap();
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::Signal { kind: SignalKind::Offer, sender_id: a.clone(), ciphertext: "E".into() }]
        );
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn signal_to_missing_or_foreign_peer_is_dropped() {
        let relay = relay();
        let (a, _rx_a) = relay.connect();
        let (b, mut rx_b) = relay.connect();
        relay.on_join(&a, "r1", "A").unwrap();
        relay.on_join(&b, "r2", "B").unwrap();
        drain(&mut rx_b);

        let envelope = |to: &str| SignalEnvelope {
            kind: SignalKind::IceCandidate,
            sender_id: a.clone(),
            recipient_id: to.to_string(),
            ciphertext: "c".into(),
        };
        assert!(matches!(relay.on_relay_signal(envelope(&b)), Err(Error::RecipientUnavailable(_))));
        assert!(matches!(relay.on_relay_signal(envelope("gone")), Err(Error::RecipientUnavailable(_))));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn signals_keep_send_order() {
        let relay = relay();
        let (a, _rx_a) = relay.connect();
        let (b, mut rx_b) = relay.connect();
        relay.on_join(&a, "r1", "A").unwrap();
        relay.on_join(&b, "r1", "B").unwrap();
        drain(&mut rx_b);

        for i in 0..20 {
            let kind = if i == 0 { SignalKind::Offer } else { SignalKind::IceCandidate };
            relay
                .on_relay_signal(SignalEnvelope {
                    kind,
                    sender_id: a.clone(),
                    recipient_id: b.clone(),
                    ciphertext: i.to_string(),
                })
                .unwrap();
        }
        let order: Vec<String> = drain(&mut rx_b)
            .into_iter()
            .map(|m| match m {
                ServerMessage::Signal { ciphertext, .. } => ciphertext,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(order, (0..20).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn broadcast_skips_sender() {
        let relay = relay();
        let (a, mut rx_a) = relay.connect();
        let (b, mut rx_b) = relay.connect();
        let (c, mut rx_c) = relay.connect();
        for (id, name) in [(&a, "A"), (&b, "B"), (&c, "C")] {
            relay.on_join(id, "r1", name).unwrap();
        }
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        let sent = relay.on_broadcast("r1", &a, json!({"text": "hi"}), BroadcastKind::Chat);
        assert_eq!(sent, 2);
        assert!(drain(&mut rx_a).is_empty());
        for rx in [&mut rx_b, &mut rx_c] {
            assert_eq!(
                drain(rx),
                vec![ServerMessage::Broadcast {
                    kind: BroadcastKind::Chat,
                    sender_id: a.clone(),
                    payload: json!({"text": "hi"}),
                }]
            );
        }
    }

    #[test]
    fn mute_change_rebroadcasts_roster() {
        let relay = relay();
        let (a, mut rx_a) = relay.connect();
        relay.on_join(&a, "r1", "A").unwrap();
        drain(&mut rx_a);

        relay.on_set_muted(&a, true);
        relay.on_set_muted(&a, true);
        let to_a = drain(&mut rx_a);
        assert_eq!(to_a.len(), 1);
        assert!(matches!(&to_a[0], ServerMessage::Roster { participants } if participants[0].muted));
    }

    #[test]
    fn join_from_unknown_connection_fails() {
        let relay = relay();
        assert!(relay.on_join("ghost", "r1", "G").is_err());
        assert!(relay.roster().snapshot("r1").is_empty());
    }
}
