//! Runtime events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `ConnectionSupervisor`, `Provisioner`, `DispatchEngine` workers,
//!   `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: [`SubscriberSet::listen`](crate::SubscriberSet::listen) fans events out to
//!   user subscribers such as [`LogWriter`](crate::LogWriter).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
