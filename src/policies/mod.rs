//! Reconnect and failure policies.
//!
//! ## Contents
//! - [`BackoffPolicy`] how long the supervisor waits between connection epochs
//! - [`JitterPolicy`]  randomization of that wait
//! - [`FailurePolicy`] what happens to a delivery whose handler failed
//!
//! ## Quick wiring
//! ```text
//! ReconnectConfig ──► BackoffPolicy ──► core::ConnectionSupervisor (wait between epochs)
//! ConsumerConfig.policy ──► FailurePolicy ──► dispatch::FailureStrategy (per delivery)
//! ```

mod backoff;
mod failure;
mod jitter;

pub use backoff::BackoffPolicy;
pub use failure::FailurePolicy;
pub use jitter::JitterPolicy;
