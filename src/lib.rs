//! # rabbitvisor
//!
//! **Rabbitvisor** keeps an AMQP 0-9-1 consumer alive and well-behaved.
//!
//! It dials the broker with reconnect backoff, declares topology on every new
//! connection, fans deliveries out to a pool of workers running an injected
//! handler, and applies an explicit failure policy to every message: drop it,
//! requeue it and restart, requeue it and stop, or report the failure back to
//! the sender.
//!
//! ## Architecture
//! ```text
//!                  ┌─────────────────────────────────────────────┐
//!                  │ ConnectionSupervisor (dial loop + backoff)  │
//!                  └──────────────┬──────────────────────────────┘
//!                                 │ one channel per epoch
//!                                 ▼
//!                  ┌─────────────────────────────────────────────┐
//!                  │ BridgeEpoch                                 │
//!                  │  ├─ Provisioner::provision(topology)        │
//!                  │  └─ DispatchEngine::consume(queue)          │
//!                  └──────────────┬──────────────────────────────┘
//!                ┌────────────────┼────────────────┐
//!                ▼                ▼                ▼
//!            worker 0         worker 1   ...   worker N-1
//!                │ Handler::invoke ─► DispatchOutcome
//!                │ FailureStrategy::decide ─► ack / nack / reply
//!                ▼
//!   ┌───────────────────────────────────────────────────────────┐
//!   │ Bus (broadcast events) ─► SubscriberSet ─► LogWriter, ... │
//!   └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Epoch lifecycle
//! ```text
//! loop {
//!   ├─► connect ── Err ─► ConnectFailed ─► backoff ─► continue
//!   ├─► open channel, provision topology (generated queue names are fresh)
//!   ├─► consume until:
//!   │     ├─ token cancelled         ─► Ok(())
//!   │     ├─ single message done     ─► Ok(())
//!   │     ├─ restart policy halted   ─► backoff ─► continue
//!   │     ├─ stop policy halted      ─► Failed
//!   │     └─ channel / stream lost   ─► Failed
//!   └─► Failed ─► reconnect disabled ? Err : backoff ─► continue
//! }
//! ```
//!
//! ## Features
//! | Area            | Description                                               | Key types                                   |
//! |-----------------|-----------------------------------------------------------|---------------------------------------------|
//! | **Supervision** | Dial loop, backoff, cancellation, per-epoch cleanup       | [`ConnectionSupervisor`], [`EpochHandler`]  |
//! | **Topology**    | Declarative exchanges, queues, bindings                   | [`topology::TopologySpec`], [`Provisioner`] |
//! | **Dispatch**    | Worker fan-out, exactly-once settlement, replies          | [`DispatchEngine`], [`FailureStrategy`]     |
//! | **Handlers**    | Subprocess, HTTP, email, republish, closures              | [`Handler`], [`HandlerFn`]                  |
//! | **Events**      | Lifecycle events and subscribers                          | [`Event`], [`Subscribe`], [`LogWriter`]     |
//! | **Config**      | Deserializable, validated settings                        | [`config::BridgeConfig`]                    |
//!
//! ## Optional features
//! - `amqp` (default): the `lapin` broker backend, [`broker::amqp::AmqpBroker`].
//! - `http` (default): the HTTP forward handler.
//! - `cli` (default): the `amqp-exec` binary.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use rabbitvisor::broker::{memory::MemoryBroker, OutboundMessage};
//! use rabbitvisor::topology::{QueueRef, QueueSpec, TopologySpec};
//! use rabbitvisor::{
//!     BackoffPolicy, BridgeEpoch, ConnectionSupervisor, DispatchEngine, DispatchOutcome,
//!     EngineOptions, ExecutionContext, FailurePolicy, FailureStrategy, HandlerFn, Provisioner,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!     broker.enqueue("jobs", OutboundMessage::new("hello"));
//!
//!     let handler = HandlerFn::arc("upper", |_ctx: ExecutionContext, body: Vec<u8>| async move {
//!         DispatchOutcome::success(body.to_ascii_uppercase())
//!     });
//!     let engine = DispatchEngine::new(handler, FailureStrategy::new(FailurePolicy::Drop))
//!         .with_options(EngineOptions { single: true, ..EngineOptions::default() });
//!     let epoch = BridgeEpoch::new(
//!         Provisioner::new(),
//!         TopologySpec::default().with_queue(QueueSpec::named("jobs")),
//!         QueueRef::Declared(0),
//!         engine,
//!     );
//!
//!     ConnectionSupervisor::new(broker.clone(), "amqp://localhost")
//!         .with_backoff(BackoffPolicy::fixed(Duration::from_secs(1)))
//!         .run(&epoch, CancellationToken::new())
//!         .await?;
//!
//!     assert_eq!(broker.acks().len(), 1);
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
mod core;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handlers;
pub mod policies;
pub mod subscribers;
pub mod topology;

// ---- Public re-exports ----

pub use crate::core::{
    cancel_on_signal, wait_for_shutdown_signal, BridgeEpoch, ConnectionSupervisor, EpochHandler,
    Outcome, ShutdownSignal,
};
pub use dispatch::{
    DispatchEngine, DispatchOutcome, EngineExit, EngineOptions, ExecutionContext, FailureStrategy,
    ReplyEnvelope, ReplyPublisher,
};
pub use error::{
    BrokerError, ConfigError, DispatchError, EpochError, MailError, SupervisorError, TopologyError,
};
pub use events::{Bus, Event, EventKind};
pub use handlers::{Handler, HandlerFn, HandlerRef};
pub use policies::{BackoffPolicy, FailurePolicy, JitterPolicy};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
pub use topology::{ProvisionedTopology, Provisioner};
