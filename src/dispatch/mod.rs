//! Consume-dispatch-acknowledge loop.
//!
//! ## Contents
//! - [`DispatchEngine`] subscription, worker fan-out, settlement
//! - [`InFlight`], [`Acker`] a delivery and its single-use settlement handle
//! - [`ExecutionContext`] message metadata for handlers
//! - [`DispatchOutcome`] what a handler reports
//! - [`FailureStrategy`] outcome + policy ⇒ [`Decision`]
//! - [`ReplyPublisher`], [`ReplyEnvelope`] correlated replies
//!
//! ## Per-delivery flow
//! ```text
//! Delivery ─► ExecutionContext ─► Handler::invoke ─► DispatchOutcome
//!          ─► FailureStrategy::decide ─► Decision { action, halt }
//!          ─► Acker::{ack,nack} (exactly once) ─► ReplyPublisher::reply (optional)
//! ```

mod delivery;
mod engine;
mod outcome;
mod reply;
mod strategy;

pub use delivery::{Acker, ExecutionContext, InFlight};
pub use engine::{DispatchEngine, EngineExit, EngineOptions};
pub use outcome::{Decision, DispatchOutcome, FinalAction, Halt};
pub use reply::{ERROR_HEADER, ReplyEnvelope, ReplyPublisher};
pub use strategy::FailureStrategy;
