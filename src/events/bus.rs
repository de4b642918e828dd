//! # Event bus.
//!
//! [`Bus`] wraps [`tokio::sync::broadcast`]: many publishers (supervisor,
//! provisioner, workers), any number of receivers.
//!
//! ```text
//!   ConnectionSupervisor ──┐
//!   Provisioner ───────────┼──► Bus ──► subscriber listener ──► SubscriberSet
//!   dispatch workers ──────┘
//! ```
//!
//! ## Rules
//! - `publish()` never blocks and never fails; without receivers the event is lost.
//! - One shared ring buffer; slow receivers see `RecvError::Lagged(n)`.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for runtime events. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Bus {
    /// Creates a bus with the given ring capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel::<Event>(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all current receivers.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates a receiver for events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn test_receiver_sees_events_after_subscribe() {
        let bus = Bus::new(8);
        bus.publish(Event::new(EventKind::Connecting));

        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventKind::Connected).with_epoch(1));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Connected);
        assert_eq!(ev.epoch, Some(1));
    }
}
