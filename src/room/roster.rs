use super::state::{JoinOutcome, Room};
use crate::types::{ConnectionId, RoomKey, RosterSnapshot};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub room_key: RoomKey,
    pub participant_count: usize,
    pub participants: RosterSnapshot,
}

/// Per-room participant registry. Each room has its own lock; the outer map
/// is only held long enough to find or create a room.
#[derive(Debug, Default)]
pub struct RosterStore {
    rooms: RwLock<HashMap<RoomKey, Arc<Mutex<Room>>>>,
}

impl RosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with exclusive access to the room, creating it if needed.
    /// A room left empty by `f` is retired and removed before the lock is
    /// released.
    pub fn mutate<R>(&self, room_key: &str, f: impl FnOnce(&mut Room) -> R) -> R {
        loop {
            let handle = self.room_handle(room_key);
            let mut room = handle.lock();
            if room.is_retired() {
                // Lost a race with the last leaver; pick up the fresh room.
                continue;
            }

            let result = f(&mut room);
            if room.is_empty() {
                room.retire();
                let mut rooms = self.rooms.write();
                if rooms.get(room_key).map_or(false, |h| Arc::ptr_eq(h, &handle)) {
                    rooms.remove(room_key);
                }
            }
            return result;
        }
    }

    /// Runs `f` against an existing room without creating one.
    pub fn inspect<R>(&self, room_key: &str, f: impl FnOnce(&Room) -> R) -> Option<R> {
        let handle = self.rooms.read().get(room_key).cloned()?;
        let room = handle.lock();
        if room.is_retired() {
            return None;
        }
        Some(f(&room))
    }

    pub fn join(&self, room_key: &str, connection_id: &str, display_name: &str) -> ConnectionId {
        self.mutate(room_key, |room| {
            room.join(connection_id, display_name);
        });
        connection_id.to_string()
    }

    pub fn join_with_outcome(
        &self,
        room_key: &str,
        connection_id: &str,
        display_name: &str,
    ) -> JoinOutcome {
        self.mutate(room_key, |room| room.join(connection_id, display_name))
    }

    pub fn leave(&self, room_key: &str, connection_id: &str) -> bool {
        if !self.rooms.read().contains_key(room_key) {
            return false;
        }
        self.mutate(room_key, |room| room.leave(connection_id))
    }

    pub fn set_muted(&self, room_key: &str, connection_id: &str, muted: bool) -> bool {
        if !self.rooms.read().contains_key(room_key) {
            return false;
        }
        self.mutate(room_key, |room| room.set_muted(connection_id, muted))
    }

    pub fn snapshot(&self, room_key: &str) -> RosterSnapshot {
        self.inspect(room_key, Room::snapshot).unwrap_or_default()
    }

    pub fn room_keys(&self) -> Vec<RoomKey> {
        let mut keys: Vec<_> = self.rooms.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn summaries(&self) -> Vec<RoomSummary> {
        self.room_keys()
            .into_iter()
            .filter_map(|key| {
                self.inspect(&key, |room| RoomSummary {
                    room_key: room.key.clone(),
                    participant_count: room.len(),
                    participants: room.snapshot(),
                })
            })
            .collect()
    }

    fn room_handle(&self, room_key: &str) -> Arc<Mutex<Room>> {
        if let Some(handle) = self.rooms.read().get(room_key) {
            return handle.clone();
        }
        self.rooms
            .write()
            .entry(room_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new(room_key.to_string()))))
            .clone()
    }
}
