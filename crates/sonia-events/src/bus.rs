//! Event bus for broadcasting events to subscribers.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::event::SoniaEvent;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event bus for broadcasting events to all subscribers.
///
/// Events are delivered asynchronously and in publish order. Slow
/// receivers may lag and drop events; the bus carries diagnostics and
/// UI updates, not state of record.
#[derive(Debug)]
pub struct EventBus {
    /// Sender for broadcasting events.
    sender: broadcast::Sender<Arc<SoniaEvent>>,
    /// Channel capacity.
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: SoniaEvent) -> usize {
        let event = Arc::new(event);

        trace!(event_type = %event.event_type(), "Publishing event");

        if let Ok(count) = self.sender.send(Arc::clone(&event)) {
            debug!(
                event_type = %event.event_type(),
                receiver_count = count,
                "Event published"
            );
            count
        } else {
            // No receivers - this is fine
            trace!(event_type = %event.event_type(), "No receivers for event");
            0
        }
    }

    /// Subscribe to events.
    ///
    /// Returns a receiver that will receive all events published after
    /// this call.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Get the current number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
        }
    }
}

/// Receiver for events from the event bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<SoniaEvent>>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the channel is closed. Lagged receivers skip the
    /// dropped events and keep receiving.
    pub async fn recv(&mut self) -> Option<Arc<SoniaEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive the next event without blocking.
    pub fn try_recv(&mut self) -> Option<Arc<SoniaEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                }
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonia_core::Timestamp;

    fn maintenance_event() -> SoniaEvent {
        SoniaEvent::MaintenanceToggled {
            old: false,
            new: true,
            timestamp: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_creation() {
        let bus = EventBus::new();
        assert_eq!(bus.capacity(), DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        let count = bus.publish(maintenance_event());
        assert_eq!(count, 1);

        let msg = receiver.recv().await.unwrap();
        assert_eq!(msg.event_type(), "supervision.maintenance.toggled");
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut receiver1 = bus.subscribe();
        let mut receiver2 = bus.subscribe();

        let count = bus.publish(maintenance_event());
        assert_eq!(count, 2);

        assert!(receiver1.recv().await.is_some());
        assert!(receiver2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(maintenance_event()), 0);
    }

    #[tokio::test]
    async fn test_try_recv_empty() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_clone_shares_channel() {
        let bus = EventBus::new();
        let clone = bus.clone();
        let mut receiver = bus.subscribe();

        clone.publish(maintenance_event());
        assert!(receiver.recv().await.is_some());
    }
}
