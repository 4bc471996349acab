use crate::types::{ConnectionId, Participant, RoomKey, RosterSnapshot};

/// Outcome of registering a connection in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Added,
    Renamed,
}

#[derive(Debug, Clone)]
pub struct Room {
    pub key: RoomKey,
    participants: Vec<Participant>,
    retired: bool,
}

impl Room {
    pub fn new(key: RoomKey) -> Self {
        Self {
            key,
            participants: Vec::new(),
            retired: false,
        }
    }

    pub fn join(&mut self, id: &str, display_name: &str) -> JoinOutcome {
        if let Some(existing) = self.participants.iter_mut().find(|p| p.id == id) {
            existing.name = display_name.to_string();
            return JoinOutcome::Renamed;
        }
        self.participants.push(Participant::new(id, display_name));
        JoinOutcome::Added
    }

    pub fn leave(&mut self, id: &str) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p.id != id);
        self.participants.len() != before
    }

    pub fn set_muted(&mut self, id: &str, muted: bool) -> bool {
        match self.participants.iter_mut().find(|p| p.id == id) {
            Some(p) if p.muted != muted => {
                p.muted = muted;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.iter().any(|p| p.id == id)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.participants.iter().map(|p| &p.id)
    }

    pub fn snapshot(&self) -> RosterSnapshot {
        self.participants.clone()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }
}
