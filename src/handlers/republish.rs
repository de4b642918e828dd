//! # Republishing handler.
//!
//! Forwards each delivery (body and properties) to an exchange/routing key,
//! possibly on another broker. The handler owns its outgoing connection: it is
//! dialed on first use and dropped after a publish error, so the next delivery
//! redials.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerChannel, BrokerConnection, OutboundMessage};
use crate::dispatch::{DispatchOutcome, ExecutionContext};
use crate::error::BrokerError;

use super::Handler;

struct Link {
    conn: Box<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// Republishes deliveries to `exchange` with `routing_key`.
pub struct RepublishHandler<B: Broker> {
    broker: B,
    url: String,
    exchange: String,
    routing_key: String,
    link: Mutex<Option<Link>>,
}

impl<B: Broker> RepublishHandler<B> {
    pub fn new(
        broker: B,
        url: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            url: url.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            link: Mutex::new(None),
        }
    }

    async fn dial(&self) -> Result<Link, BrokerError> {
        let conn = self.broker.connect(&self.url).await?;
        match conn.open_channel().await {
            Ok(channel) => Ok(Link { conn, channel }),
            Err(e) => {
                conn.close().await;
                Err(e)
            }
        }
    }

    async fn forward(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        let mut link = self.link.lock().await;
        if link.is_none() {
            *link = Some(self.dial().await?);
        }
        let Some(current) = link.as_ref() else {
            return Err(BrokerError::Closed);
        };

        if let Err(e) = current
            .channel
            .publish(&self.exchange, &self.routing_key, message)
            .await
        {
            if let Some(stale) = link.take() {
                stale.channel.close().await;
                stale.conn.close().await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Closes the outgoing connection, if any.
    pub async fn close(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.channel.close().await;
            link.conn.close().await;
        }
    }
}

#[async_trait]
impl<B: Broker> Handler for RepublishHandler<B> {
    fn name(&self) -> &str {
        "republish"
    }

    async fn invoke(&self, ctx: &ExecutionContext, body: &[u8]) -> DispatchOutcome {
        let message = OutboundMessage::new(body).with_properties(ctx.properties.clone());
        match self.forward(&message).await {
            Ok(()) => {
                debug!(exchange = %self.exchange, routing_key = %self.routing_key, "republished");
                DispatchOutcome::Success(Vec::new())
            }
            Err(e) => {
                warn!(err = %e, exchange = %self.exchange, "republish failed; will redial");
                DispatchOutcome::failure(format!("republish: {e}"), Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::Properties;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: "in".into(),
            redelivered: false,
            properties: Properties::default().with_header("k", "v"),
        }
    }

    #[tokio::test]
    async fn test_forwards_body_and_properties() {
        let broker = MemoryBroker::new();
        broker.enqueue("out", OutboundMessage::new("seed"));
        let handler = RepublishHandler::new(broker.clone(), "amqp://dest", "", "out");

        let out = handler.invoke(&ctx(), b"payload").await;
        assert!(out.is_success());
        assert_eq!(broker.queue_bodies("out"), vec![b"seed".to_vec(), b"payload".to_vec()]);

        let published = broker.published();
        let last = published.last().unwrap();
        assert_eq!(last.routing_key, "out");
        assert_eq!(last.message.properties.headers.get("k").and_then(|v| v.as_str()), Some("v"));

        handler.invoke(&ctx(), b"again").await;
        assert_eq!(broker.dial_count(), 1);
        handler.close().await;
    }

    #[tokio::test]
    async fn test_publish_error_redials() {
        let broker = MemoryBroker::new();
        broker.enqueue("out", OutboundMessage::new("seed"));
        let handler = RepublishHandler::new(broker.clone(), "amqp://dest", "", "out");

        broker.fail_next_publishes(1);
        let out = handler.invoke(&ctx(), b"lost").await;
        assert!(matches!(out, DispatchOutcome::HandlerFailure { .. }));

        let out = handler.invoke(&ctx(), b"kept").await;
        assert!(out.is_success());
        assert_eq!(broker.dial_count(), 2);
        assert_eq!(broker.queue_len("out"), 2);
    }

    #[tokio::test]
    async fn test_dial_failure_is_handler_failure() {
        let broker = MemoryBroker::new();
        broker.fail_next_dials(1);
        let handler = RepublishHandler::new(broker.clone(), "amqp://dest", "", "out");
        let out = handler.invoke(&ctx(), b"x").await;
        assert!(matches!(out, DispatchOutcome::HandlerFailure { .. }));
    }
}
