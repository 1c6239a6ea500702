//! Process-local presence tracking.
//!
//! Presence is advisory: it marks who is looking at a room right now, which
//! the unread accounting treats as "caught up". It is never persisted — after
//! a restart the sets are empty and clients re-populate them by rejoining.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use shared::domain::{RoomId, UserId};

#[derive(Default)]
pub struct PresenceTracker {
    rooms: RwLock<HashMap<RoomId, HashSet<UserId>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room_id: RoomId, user_id: UserId) {
        let mut rooms = self.rooms.write().expect("presence lock poisoned");
        rooms.entry(room_id).or_default().insert(user_id);
    }

    /// No-op for unknown rooms or users. Empty sets are dropped so the map
    /// does not grow with dead rooms.
    pub fn leave(&self, room_id: RoomId, user_id: UserId) {
        let mut rooms = self.rooms.write().expect("presence lock poisoned");
        if let Some(active) = rooms.get_mut(&room_id) {
            active.remove(&user_id);
            if active.is_empty() {
                rooms.remove(&room_id);
            }
        }
    }

    /// Snapshot of the active set. Callers get an owned copy, so the lock is
    /// never held across an await point.
    pub fn active_users(&self, room_id: RoomId) -> HashSet<UserId> {
        let rooms = self.rooms.read().expect("presence lock poisoned");
        rooms.get(&room_id).cloned().unwrap_or_default()
    }

    pub fn is_active(&self, room_id: RoomId, user_id: UserId) -> bool {
        let rooms = self.rooms.read().expect("presence lock poisoned");
        rooms
            .get(&room_id)
            .map(|active| active.contains(&user_id))
            .unwrap_or(false)
    }
}
