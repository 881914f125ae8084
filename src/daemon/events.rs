//! Lossy fan-out of lifecycle events to subscribers.
//!
//! Each subscriber gets a bounded channel; `broadcast` never blocks.
//! A subscriber that stops draining loses events instead of stalling
//! lifecycle operations. The event ring itself lives in the registry
//! under the main lock; this bus only owns the subscriber table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard};

use crate::protocol::Event;

/// Per-subscriber channel capacity.
pub const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, SyncSender<Event>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, SyncSender<Event>>> {
        // Nothing in the table can be left half-mutated by a panic.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscriber. The returned id must be passed back to
    /// [`EventBus::unsubscribe`] when the consumer goes away.
    pub fn subscribe(&self) -> (u64, Receiver<Event>) {
        let (tx, rx) = sync_channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.table().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.table().remove(&id);
    }

    /// Non-blocking send to every subscriber. Overfull subscribers drop
    /// the event; disconnected ones are pruned.
    pub fn broadcast(&self, event: &Event) {
        self.table().retain(|_, tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Drop every subscriber channel; receivers observe disconnect and
    /// their connections wind down.
    pub fn close_all(&self) {
        self.table().clear();
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.table().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventKind;
    use std::time::{Duration, Instant};

    fn event(n: usize) -> Event {
        Event::new(EventKind::Run, format!("p{n}"))
    }

    #[test]
    fn subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let (id, rx) = bus.subscribe();

        bus.broadcast(&event(1));
        bus.broadcast(&event(2));

        assert_eq!(rx.recv().unwrap().process, "p1");
        assert_eq!(rx.recv().unwrap().process, "p2");
        bus.unsubscribe(id);
    }

    #[test]
    fn slow_subscriber_drops_events_without_blocking() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe();

        let start = Instant::now();
        for n in 0..SUBSCRIBER_BUFFER * 3 {
            bus.broadcast(&event(n));
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[test]
    fn disconnected_subscriber_is_pruned() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe();
        drop(rx);

        bus.broadcast(&event(0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn close_all_disconnects_receivers() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe();
        bus.close_all();
        assert!(rx.recv().is_err());
    }

    #[test]
    fn one_full_subscriber_does_not_starve_others() {
        let bus = EventBus::new();
        let (_slow_id, slow_rx) = bus.subscribe();
        let (_live_id, live_rx) = bus.subscribe();

        for n in 0..SUBSCRIBER_BUFFER + 10 {
            bus.broadcast(&event(n));
            while live_rx.try_recv().is_ok() {}
        }

        // The drained subscriber saw everything; the stalled one capped out.
        let mut stalled = 0;
        while slow_rx.try_recv().is_ok() {
            stalled += 1;
        }
        assert_eq!(stalled, SUBSCRIBER_BUFFER);
    }
}
