//! Call event fan-out for the presentation layer

pub mod types;

pub use types::CallEvent;

use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcasts `CallEvent`s to every subscriber
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Dropped when nobody is subscribed
    pub fn publish(&self, event: CallEvent) {
        let _ = self.tx.send(event);
    }

    /// A subscriber that falls behind gets `Lagged` and misses events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
