use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, RoomId};

const CHANNEL_CAPACITY: usize = 256;

/// Per-room broadcast of committed events.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<RoomId, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a room's commits. Creates the channel if needed.
    pub fn subscribe(&self, room_id: RoomId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish a committed event. No-op if nobody is listening.
    pub fn send(&self, room_id: RoomId, event: &Event) {
        if let Some(sender) = self.channels.get(&room_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.channels
            .get(room_id)
            .map_or(0, |s| s.receiver_count())
    }
}
