use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// In-process event feed, one broadcast channel per user. Every applied
/// event is published to the users it concerns (both session parties,
/// the owning coach of a service). Lagged subscribers drop messages per
/// broadcast semantics.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to one user's feed. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish to one user's feed. No-op if nobody is listening.
    pub fn send(&self, user_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&user_id) {
            let _ = sender.send(event.clone());
        }
    }
}
