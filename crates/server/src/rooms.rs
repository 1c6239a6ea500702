use std::{collections::HashMap, sync::Mutex};

use shared::{domain::RoomId, protocol::TopicEvent};
use tokio::sync::broadcast;

/// A slow subscriber that lags past this many buffered events skips ahead and
/// resyncs from live traffic.
const ROOM_CHANNEL_CAPACITY: usize = 256;

/// Lazily-created fan-out channel per room. Publishing to a room nobody is
/// subscribed to is a no-op, not an error.
#[derive(Default)]
pub struct RoomChannels {
    channels: Mutex<HashMap<RoomId, broadcast::Sender<TopicEvent>>>,
}

impl RoomChannels {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, room_id: RoomId) -> broadcast::Sender<TopicEvent> {
        let mut channels = self.channels.lock().expect("room channel lock poisoned");
        channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, room_id: RoomId) -> broadcast::Receiver<TopicEvent> {
        self.sender(room_id).subscribe()
    }

    pub fn publish(&self, room_id: RoomId, event: TopicEvent) {
        let _ = self.sender(room_id).send(event);
    }
}
