//! # Runtime events emitted by the supervisor, the provisioner and the dispatch workers.
//!
//! [`EventKind`] groups into:
//! - **Connection events**: dialing, epoch boundaries, reconnect waits
//! - **Consumption events**: topology, consumer start, per-delivery settlement
//! - **Shutdown events**: cancellation observed, supervisor finished
//! - **Subscriber events**: overflow and panics inside event subscribers
//!
//! [`Event`] carries optional metadata filled depending on the kind.
//!
//! ## Ordering guarantees
//! Each event has a globally unique, monotonically increasing `seq`.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use rabbitvisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::BackoffScheduled)
//!     .with_epoch(3)
//!     .with_attempt(2)
//!     .with_delay(Duration::from_secs(10))
//!     .with_reason("connect failed: connection refused");
//!
//! assert_eq!(ev.delay_ms, Some(10_000));
//! assert_eq!(ev.epoch, Some(3));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Connection ===
    /// Dialing the broker.
    ///
    /// Sets: `epoch`, `attempt` (consecutive failures so far).
    Connecting,

    /// Connection and channel are open.
    ///
    /// Sets: `epoch`.
    Connected,

    /// Dial or channel-open failed.
    ///
    /// Sets: `epoch`, `attempt`, `reason`.
    ConnectFailed,

    /// An epoch ended and its connection was closed.
    ///
    /// Sets: `epoch`, `reason` (outcome label).
    EpochEnded,

    /// The supervisor waits before the next dial.
    ///
    /// Sets: `epoch`, `attempt`, `delay_ms`, `reason` (why the epoch ended).
    BackoffScheduled,

    // === Consumption ===
    /// Exchanges, queues and bindings are declared for this epoch.
    ///
    /// Sets: `epoch`, `queue` (realized consumer queue, if any).
    TopologyDeclared,

    /// `basic.consume` succeeded.
    ///
    /// Sets: `queue`, `attempt` (worker count).
    ConsumerStarted,

    /// Delivery acknowledged.
    ///
    /// Sets: `queue`, `tag`, `message_id`.
    DeliveryAcked,

    /// Delivery negatively acknowledged with requeue.
    ///
    /// Sets: `queue`, `tag`, `message_id`, `reason`.
    DeliveryRequeued,

    /// Delivery negatively acknowledged without requeue.
    ///
    /// Sets: `queue`, `tag`, `message_id`, `reason`.
    DeliveryRejected,

    /// Handler reported a failure.
    ///
    /// Sets: `source` (handler name), `tag`, `message_id`, `reason`.
    HandlerFailed,

    /// A reply was published.
    ///
    /// Sets: `queue` (reply destination), `message_id` (correlation id).
    ReplyPublished,

    // === Shutdown ===
    /// Cancellation observed.
    ShutdownRequested,

    /// The supervisor returned.
    ///
    /// Sets: `epoch`, `reason` (error, if any).
    SupervisorStopped,

    // === Subscribers ===
    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets: `source` (subscriber name), `reason`.
    SubscriberOverflow,

    /// Subscriber panicked while handling an event.
    ///
    /// Sets: `source` (subscriber name), `reason`.
    SubscriberPanicked,
}

/// Runtime event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    pub kind: EventKind,

    /// Connection epoch (1-based).
    pub epoch: Option<u64>,
    /// Attempt or count, depending on the kind.
    pub attempt: Option<u32>,
    /// Wait before the next dial, in milliseconds.
    pub delay_ms: Option<u32>,
    /// Human-readable reason.
    pub reason: Option<Arc<str>>,
    /// Queue name or reply destination.
    pub queue: Option<Arc<str>>,
    /// Handler or subscriber name.
    pub source: Option<Arc<str>>,
    /// Delivery tag.
    pub tag: Option<u64>,
    /// Message (or correlation) id.
    pub message_id: Option<Arc<str>>,
}

impl Event {
    /// Creates an event of the given kind with the current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            epoch: None,
            attempt: None,
            delay_ms: None,
            reason: None,
            queue: None,
            source: None,
            tag: None,
            message_id: None,
        }
    }

    #[inline]
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = Some(epoch);
        self
    }

    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a delay (stored as milliseconds, saturating).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay_ms = Some(d.as_millis().min(u128::from(u32::MAX)) as u32);
        self
    }

    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[inline]
    pub fn with_queue(mut self, queue: impl Into<Arc<str>>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    #[inline]
    pub fn with_source(mut self, source: impl Into<Arc<str>>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[inline]
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = Some(tag);
        self
    }

    #[inline]
    pub fn with_message_id(mut self, id: impl Into<Arc<str>>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Creates a subscriber overflow event.
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_source(subscriber)
            .with_reason(reason)
    }

    /// Creates a subscriber panic event.
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_source(subscriber)
            .with_reason(info)
    }

    /// True for events describing a single delivery.
    pub fn is_delivery(&self) -> bool {
        matches!(
            self.kind,
            EventKind::DeliveryAcked | EventKind::DeliveryRequeued | EventKind::DeliveryRejected
        )
    }
}
