//! Event Bus implementation.
//!
//! Handlers run synchronously on the publishing thread, in publish order.
//! Async consumers take a broadcast receiver instead.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::{EventCategory, LinkEvent};

/// Subscription handle for unsubscribing from events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", &self.0.to_string()[..8])
    }
}

/// Filter to receive only specific event types
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    /// Receive all events.
    #[default]
    All,
    /// Receive events matching any of these categories.
    Categories(Vec<EventCategory>),
}

impl EventFilter {
    /// Check if an event matches this filter
    pub fn matches(&self, event: &LinkEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Categories(categories) => categories.contains(&event.category()),
        }
    }
}

type EventHandler = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// Events buffered per broadcast receiver before it lags
pub const CHANNEL_CAPACITY: usize = 256;

/// Error types for event bus operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventBusError {
    /// No subscribers are listening
    #[error("No active subscribers")]
    NoSubscribers,
}

/// Typed publish/subscribe hub owned by one printer link
pub struct EventBus {
    sender: broadcast::Sender<LinkEvent>,
    handlers: RwLock<HashMap<SubscriptionId, (EventFilter, EventHandler)>>,
}

impl EventBus {
    /// Create an event bus without subscribers
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Publish an event to all subscribers
    ///
    /// Matching handlers are called before this returns. The handler table
    /// is not locked while they run, so a handler may publish or subscribe.
    /// Returns the number of broadcast receivers reached.
    pub fn publish(&self, event: LinkEvent) -> Result<usize, EventBusError> {
        let matching: Vec<EventHandler> = {
            let handlers = self.handlers.read();
            handlers
                .values()
                .filter(|(filter, _)| filter.matches(&event))
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in &matching {
            handler(event.clone());
        }

        match self.sender.send(event) {
            Ok(count) => Ok(count),
            Err(_) if matching.is_empty() && self.subscriber_count() == 0 => {
                Err(EventBusError::NoSubscribers)
            }
            Err(_) => Ok(0),
        }
    }

    /// Subscribe to events with a synchronous handler
    ///
    /// The handler is called on the publishing thread, which is often the
    /// serial reader. It should return quickly.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(LinkEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.handlers.write().insert(id, (filter, Arc::new(handler)));
        tracing::debug!("Subscription {} added", id);
        id
    }

    /// Get a receiver for polling events from a tokio task
    pub fn receiver(&self) -> broadcast::Receiver<LinkEvent> {
        self.sender.subscribe()
    }

    /// Unsubscribe from events
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.handlers.write().remove(&id).is_some();
        if removed {
            tracing::debug!("Subscription {} removed", id);
        }
        removed
    }

    /// Get the number of active subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::events::{ConnectionEvent, QueueEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn opened() -> LinkEvent {
        LinkEvent::Connection(ConnectionEvent::Opened {
            port: "/dev/ttyACM0".to_string(),
        })
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let bus = EventBus::new();

        let id = bus.subscribe(EventFilter::All, |_| {});
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert!(matches!(
            bus.publish(opened()),
            Err(EventBusError::NoSubscribers)
        ));
    }

    #[test]
    fn test_event_filtering() {
        let bus = EventBus::new();
        let connection_count = Arc::new(AtomicUsize::new(0));
        let queue_count = Arc::new(AtomicUsize::new(0));

        let cc = connection_count.clone();
        bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Connection]),
            move |_| {
                cc.fetch_add(1, Ordering::SeqCst);
            },
        );

        let qc = queue_count.clone();
        bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Queue]),
            move |_| {
                qc.fetch_add(1, Ordering::SeqCst);
            },
        );

        bus.publish(opened()).ok();
        bus.publish(LinkEvent::Queue(QueueEvent::QueueFlushed { dropped: 2 }))
            .ok();
        bus.publish(LinkEvent::Queue(QueueEvent::LineNumberChanged {
            line_number: 0,
        }))
        .ok();

        assert_eq!(connection_count.load(Ordering::SeqCst), 1);
        assert_eq!(queue_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_may_publish() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(AtomicUsize::new(0));

        let inner_bus = Arc::downgrade(&bus);
        bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Connection]),
            move |_| {
                if let Some(bus) = inner_bus.upgrade() {
                    bus.publish(LinkEvent::Queue(QueueEvent::QueueFlushed { dropped: 0 }))
                        .ok();
                }
            },
        );
        let counter = seen.clone();
        bus.subscribe(
            EventFilter::Categories(vec![EventCategory::Queue]),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        bus.publish(opened()).ok();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_receiver() {
        let bus = EventBus::new();
        let mut receiver = bus.receiver();

        bus.publish(opened()).ok();

        match receiver.recv().await {
            Ok(LinkEvent::Connection(ConnectionEvent::Opened { port })) => {
                assert_eq!(port, "/dev/ttyACM0");
            }
            other => panic!("Wrong event received: {:?}", other),
        }
    }
}
