//! # Serialized channel handle.
//!
//! [`SharedChannel`] is the only channel handle the provisioner, the dispatch
//! workers and the reply publisher see. Every operation takes the same
//! `tokio::sync::Mutex` so that ack/nack/publish issued by different workers
//! reach the transport one at a time.
//!
//! ```text
//! worker 1 ──┐
//! worker 2 ──┼──► SharedChannel::{ack,nack,publish} ──► [guard] ──► BrokerChannel
//! worker N ──┘
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{BrokerChannel, ConsumeOptions, DeliveryStream, OutboundMessage, QueueDeclare};
use crate::error::BrokerError;
use crate::topology::ExchangeSpec;

/// Cloneable, operation-serializing wrapper around a [`BrokerChannel`].
#[derive(Clone)]
pub struct SharedChannel {
    inner: Arc<dyn BrokerChannel>,
    guard: Arc<Mutex<()>>,
}

impl fmt::Debug for SharedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedChannel").finish_non_exhaustive()
    }
}

impl SharedChannel {
    pub fn new(inner: Arc<dyn BrokerChannel>) -> Self {
        Self {
            inner,
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let _g = self.guard.lock().await;
        self.inner.exchange_declare(spec).await
    }

    pub async fn queue_declare(&self, args: &QueueDeclare) -> Result<String, BrokerError> {
        let _g = self.guard.lock().await;
        self.inner.queue_declare(args).await
    }

    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let _g = self.guard.lock().await;
        self.inner.queue_bind(queue, exchange, routing_key).await
    }

    pub async fn qos(&self, prefetch: u16) -> Result<(), BrokerError> {
        let _g = self.guard.lock().await;
        self.inner.qos(prefetch).await
    }

    /// Subscribes; the returned stream is polled outside the guard.
    pub async fn consume(
        &self,
        queue: &str,
        opts: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let _g = self.guard.lock().await;
        self.inner.consume(queue, opts).await
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let _g = self.guard.lock().await;
        self.inner.ack(delivery_tag).await
    }

    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let _g = self.guard.lock().await;
        self.inner.nack(delivery_tag, requeue).await
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), BrokerError> {
        let _g = self.guard.lock().await;
        self.inner.publish(exchange, routing_key, message).await
    }

    /// Closes the underlying channel.
    ///
    /// Does not take the guard: closing must be able to interrupt a blocked operation.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}
