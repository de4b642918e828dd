//! Runtime core: connection supervision and lifecycle.
//!
//! - [`supervisor`]: dial loop with backoff, cancellation and per-epoch cleanup;
//! - [`epoch`]: the per-connection work contract ([`EpochHandler`], [`Outcome`])
//!   and the provision-then-consume [`BridgeEpoch`];
//! - [`shutdown`]: OS signal handling for the root cancellation token.

mod epoch;
mod shutdown;
mod supervisor;

pub use epoch::{BridgeEpoch, EpochHandler, Outcome};
pub use shutdown::{cancel_on_signal, wait_for_shutdown_signal, ShutdownSignal};
pub use supervisor::ConnectionSupervisor;
