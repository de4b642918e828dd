//! # Subscriber trait
//!
//! `Subscribe` is the extension point for reacting to runtime events (logging,
//! metrics, alerting). Each subscriber runs in its own worker fed by a bounded
//! queue owned by the [`SubscriberSet`](crate::subscribers::SubscriberSet).
//!
//! ## Contract
//! - Slow subscribers never block the supervisor, the workers or each other.
//! - On queue overflow, events for that subscriber are dropped with a warning.
//!
//! ## Example
//! ```rust
//! use rabbitvisor::{Event, EventKind, Subscribe};
//!
//! struct RequeueCounter(std::sync::atomic::AtomicU64);
//!
//! #[async_trait::async_trait]
//! impl Subscribe for RequeueCounter {
//!     async fn on_event(&self, ev: &Event) {
//!         if ev.kind == EventKind::DeliveryRequeued {
//!             self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
//!         }
//!     }
//!     fn name(&self) -> &'static str { "requeue-counter" }
//! }
//! ```

use async_trait::async_trait;

use crate::events::Event;

/// Contract for event subscribers.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handles one event.
    async fn on_event(&self, event: &Event);

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Capacity of this subscriber's queue.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
