//! Event bus and listener dispatch.
//!
//! Every change event goes to the typed listeners registered on the
//! [`Dispatcher`] first, then onto a tokio broadcast channel for async
//! consumers that prefer a stream.

pub mod events;
pub mod listeners;

use std::sync::Arc;
use tokio::sync::broadcast;

pub use events::{EventKind, MpdEvent};
pub use listeners::{Dispatcher, EventFilter, ListenerId, StatusChangeListener};

/// Event bus handle for publishing and subscribing
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MpdEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: MpdEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> broadcast::Receiver<MpdEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    /// 256 events of backlog per subscriber
    fn default() -> Self {
        Self::new(256)
    }
}

/// Shared event bus wrapped in Arc for thread-safe sharing
pub type SharedBus = Arc<EventBus>;

/// Create a new shared event bus
pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}
