//! # Event subscribers.
//!
//! Subscribers observe runtime events broadcast through the [`Bus`](crate::events::Bus).
//!
//! ```text
//!   Supervisor / workers ── publish(Event) ──► Bus ──► SubscriberSet::listen
//!                                                          ├──► LogWriter (tracing)
//!                                                          └──► custom (metrics, alerts, ...)
//! ```
//!
//! - [`Subscribe`] the trait to implement
//! - [`SubscriberSet`] per-subscriber queues and workers
//! - [`LogWriter`] built-in `tracing` writer

mod log;
mod set;
mod subscribe;

pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
