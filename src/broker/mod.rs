//! # Broker seam.
//!
//! The runtime talks to the message broker only through the traits in this
//! module, so the wire protocol stays an external dependency:
//!
//! ```text
//! Broker::connect(url) ──► BrokerConnection::open_channel() ──► BrokerChannel
//!                                                                 ├─ exchange_declare / queue_declare / queue_bind
//!                                                                 ├─ qos / consume ──► DeliveryStream
//!                                                                 ├─ ack / nack
//!                                                                 └─ publish
//! ```
//!
//! Backends:
//! - [`amqp::AmqpBroker`]: `lapin`, AMQP 0-9-1 (feature `amqp`);
//! - [`memory::MemoryBroker`]: in-process broker with default/direct/topic/fanout routing.
//!
//! Channel operations issued by concurrent workers go through [`SharedChannel`],
//! which serializes them behind one lock.

#[cfg(feature = "amqp")]
pub mod amqp;
mod channel;
pub mod memory;
mod message;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use channel::SharedChannel;
pub use message::{Delivery, FieldTable, FieldValue, OutboundMessage, Properties};

use crate::error::BrokerError;
use crate::topology::ExchangeSpec;

/// Stream of deliveries produced by `basic.consume`.
///
/// `None` means the broker (or a local close) ended the subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Arguments of `queue.declare`, after the provisioner applied its rules.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueDeclare {
    /// Empty name asks the broker to generate one.
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub passive: bool,
    pub arguments: FieldTable,
}

/// Arguments of `basic.consume` (manual acknowledgement is implied).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Empty tag lets the broker pick one.
    pub consumer_tag: String,
    pub exclusive: bool,
}

/// Dials broker connections.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// One live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Closes the connection and all its channels. Idempotent.
    async fn close(&self);
}

/// One channel multiplexed on a connection.
///
/// Implementations may assume callers serialize operations (see [`SharedChannel`]).
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Declares a queue and returns the realized (possibly generated) name.
    async fn queue_declare(&self, args: &QueueDeclare) -> Result<String, BrokerError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Sets the per-consumer prefetch window.
    async fn qos(&self, prefetch: u16) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        opts: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), BrokerError>;

    /// Closes the channel; unacknowledged deliveries return to their queues. Idempotent.
    async fn close(&self);
}
