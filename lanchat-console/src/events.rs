//! Event bus: front ends subscribe to core events and unsubscribe when done.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use lanchat_core::Event;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of events to every subscriber. Publishing never blocks, so it is safe from receive loops.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Deliver to every subscriber. Subscribers whose receiver is gone are dropped.
    pub fn publish(&self, event: Event) {
        log::debug!("event: {event:?}");
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_gets_every_event() {
        let bus = EventBus::new();
        let (_, mut a) = bus.subscribe();
        let (_, mut b) = bus.subscribe();
        bus.publish(Event::LinkUp { silent: false });
        assert_eq!(a.recv().await, Some(Event::LinkUp { silent: false }));
        assert_eq!(b.recv().await, Some(Event::LinkUp { silent: false }));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe();
        bus.unsubscribe(id);
        bus.publish(Event::Warning("x".into()));
        assert_eq!(rx.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let (_, rx) = bus.subscribe();
        drop(rx);
        bus.publish(Event::LinkDown { silent: true });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
