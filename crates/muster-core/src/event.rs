//! The event bus: a fan-out stream of [`Event`]s for observers (the
//! REST/WebSocket adapters, tests) that must never be able to slow down
//! or block the dispatch loop.
//!
//! Built directly on `tokio::sync::broadcast`, which already gives us
//! a bounded ring per subscriber and `RecvError::Lagged(n)` when a slow
//! subscriber falls behind. We just
//! turn that lag signal into a first-class [`Event::EventsDropped`] so
//! callers see it in the same stream instead of having to special-case
//! a distinct error channel.

use async_stream::stream;
use futures::Stream;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::Event;

/// Default subscriber ring capacity. A subscriber that falls this far
/// behind the publisher starts losing events (surfaced as
/// `EventsDropped`) rather than pushing back on the dispatch loop.
pub const DEFAULT_CAPACITY: usize = 1024;

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish one event. Never blocks; if there are no subscribers the
    /// event is simply dropped.
    pub fn publish(&self, event: Event) {
        trace!(?event, "publishing event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to a live stream of events. Each subscriber gets its
    /// own independent ring buffer of `DEFAULT_CAPACITY` events.
    pub fn subscribe(&self) -> impl Stream<Item = Event> + Send + 'static {
        let mut rx = self.tx.subscribe();
        stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        yield Event::EventsDropped { count };
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(8);
        let mut sub = Box::pin(bus.subscribe());
        bus.publish(Event::InstanceSpawned {
            worker_id: uuid::Uuid::new_v4(),
        });
        let event = sub.next().await.unwrap();
        assert!(matches!(event, Event::InstanceSpawned { .. }));
    }

    #[tokio::test]
    async fn lag_surfaces_as_events_dropped() {
        let bus = EventBus::new(2);
        let mut sub = Box::pin(bus.subscribe());
        for _ in 0..10 {
            bus.publish(Event::InstanceSpawned {
                worker_id: uuid::Uuid::new_v4(),
            });
        }
        let event = sub.next().await.unwrap();
        assert!(matches!(event, Event::EventsDropped { .. }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.publish(Event::InstanceSpawned {
            worker_id: uuid::Uuid::new_v4(),
        });
    }
}
