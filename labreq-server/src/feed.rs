//! The change feed: the in-process notification channel between the store
//! commit path and the delivery relay.
//!
//! Payloads are serialized JSON, exactly what a database notification channel
//! would carry, so the relay exercises the real wire contract. A subscriber
//! that falls behind is overrun (broadcast semantics); the relay treats an
//! overrun as a reconnect, accepting the at-least-once contract where
//! ordering is only guaranteed within a connected stretch.

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Cheap-to-clone handle to the event channel.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<String>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a committed event's payload.
    ///
    /// Having no subscribers is normal (the relay may be restarting); the
    /// payload is simply dropped in that case, matching a notification
    /// channel with no listener.
    pub fn emit(&self, payload: String) {
        let _ = self.sender.send(payload);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Number of currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
