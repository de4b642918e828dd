//! # AMQP 0-9-1 backend.
//!
//! Thin mapping of the broker traits onto `lapin`: one [`lapin::Connection`] per
//! [`BrokerConnection`], one [`lapin::Channel`] per [`BrokerChannel`].
//! Publishing waits for the publisher confirm future, so a publish that returns
//! `Ok` has been handed to the broker.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, ByteArray, FieldArray, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::debug;

use super::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Delivery, DeliveryStream, FieldTable,
    FieldValue, OutboundMessage, Properties, QueueDeclare,
};
use crate::error::BrokerError;
use crate::topology::{ExchangeKind, ExchangeSpec};

/// `lapin`-backed broker.
#[derive(Clone, Default)]
pub struct AmqpBroker {
    properties: ConnectionProperties,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses custom connection properties (connection name, executor, ...).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let conn = Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Box::new(AmqpConnection { conn }))
    }
}

struct AmqpConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) {
        if let Err(e) = self.conn.close(200, "closing").await {
            debug!(error = %e, "connection close");
        }
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let kind = match spec.kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };
        let opts = ExchangeDeclareOptions {
            passive: spec.passive,
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            internal: false,
            nowait: false,
        };
        self.channel
            .exchange_declare(&spec.name, kind, opts, lapin::types::FieldTable::default())
            .await
            .map_err(|e| BrokerError::Declare(e.to_string()))
    }

    async fn queue_declare(&self, args: &QueueDeclare) -> Result<String, BrokerError> {
        let opts = QueueDeclareOptions {
            passive: args.passive,
            durable: args.durable,
            exclusive: args.exclusive,
            auto_delete: args.auto_delete,
            nowait: false,
        };
        let queue = self
            .channel
            .queue_declare(&args.name, opts, to_amqp_table(&args.arguments))
            .await
            .map_err(|e| BrokerError::Declare(e.to_string()))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare(e.to_string()))
    }

    async fn qos(&self, prefetch: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        opts: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &opts.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: opts.exclusive,
                    nowait: false,
                },
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        let stream = consumer.map(|item| {
            item.map(from_lapin_delivery)
                .map_err(|e| BrokerError::Consume(e.to_string()))
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                to_amqp_properties(&message.properties),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close(200, "closing").await {
            debug!(error = %e, "channel close");
        }
    }
}

fn from_lapin_delivery(d: lapin::message::Delivery) -> Delivery {
    let p = &d.properties;
    let text = |v: &Option<ShortString>| v.as_ref().map(|s| s.as_str().to_string());
    Delivery {
        delivery_tag: d.delivery_tag,
        exchange: d.exchange.as_str().to_string(),
        routing_key: d.routing_key.as_str().to_string(),
        redelivered: d.redelivered,
        properties: Properties {
            content_type: text(p.content_type()),
            content_encoding: text(p.content_encoding()),
            headers: p.headers().as_ref().map(from_amqp_table).unwrap_or_default(),
            delivery_mode: *p.delivery_mode(),
            priority: *p.priority(),
            correlation_id: text(p.correlation_id()),
            reply_to: text(p.reply_to()),
            expiration: text(p.expiration()),
            message_id: text(p.message_id()),
            timestamp: *p.timestamp(),
            kind: text(p.kind()),
            app_id: text(p.app_id()),
        },
        body: d.data,
    }
}

fn to_amqp_properties(p: &Properties) -> BasicProperties {
    let mut props = BasicProperties::default();
    if let Some(v) = &p.content_type {
        props = props.with_content_type(v.clone().into());
    }
    if let Some(v) = &p.content_encoding {
        props = props.with_content_encoding(v.clone().into());
    }
    if !p.headers.is_empty() {
        props = props.with_headers(to_amqp_table(&p.headers));
    }
    if let Some(v) = p.delivery_mode {
        props = props.with_delivery_mode(v);
    }
    if let Some(v) = p.priority {
        props = props.with_priority(v);
    }
    if let Some(v) = &p.correlation_id {
        props = props.with_correlation_id(v.clone().into());
    }
    if let Some(v) = &p.reply_to {
        props = props.with_reply_to(v.clone().into());
    }
    if let Some(v) = &p.expiration {
        props = props.with_expiration(v.clone().into());
    }
    if let Some(v) = &p.message_id {
        props = props.with_message_id(v.clone().into());
    }
    if let Some(v) = p.timestamp {
        props = props.with_timestamp(v);
    }
    if let Some(v) = &p.kind {
        props = props.with_kind(v.clone().into());
    }
    if let Some(v) = &p.app_id {
        props = props.with_app_id(v.clone().into());
    }
    props
}

fn from_amqp_table(table: &lapin::types::FieldTable) -> FieldTable {
    table
        .inner()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), from_amqp_value(v)))
        .collect()
}

fn to_amqp_table(table: &FieldTable) -> lapin::types::FieldTable {
    let mut out = lapin::types::FieldTable::default();
    for (k, v) in table {
        out.insert(ShortString::from(k.clone()), to_amqp_value(v));
    }
    out
}

fn from_amqp_value(v: &AMQPValue) -> FieldValue {
    match v {
        AMQPValue::Boolean(b) => FieldValue::Bool(*b),
        AMQPValue::ShortShortInt(n) => FieldValue::Int(i64::from(*n)),
        AMQPValue::ShortShortUInt(n) => FieldValue::UInt(u64::from(*n)),
        AMQPValue::ShortInt(n) => FieldValue::Int(i64::from(*n)),
        AMQPValue::ShortUInt(n) => FieldValue::UInt(u64::from(*n)),
        AMQPValue::LongInt(n) => FieldValue::Int(i64::from(*n)),
        AMQPValue::LongUInt(n) => FieldValue::UInt(u64::from(*n)),
        AMQPValue::LongLongInt(n) => FieldValue::Int(*n),
        AMQPValue::Float(n) => FieldValue::Float(f64::from(*n)),
        AMQPValue::Double(n) => FieldValue::Float(*n),
        AMQPValue::DecimalValue(d) => {
            FieldValue::Float(f64::from(d.value) / 10f64.powi(i32::from(d.scale)))
        }
        AMQPValue::ShortString(s) => FieldValue::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => match std::str::from_utf8(s.as_bytes()) {
            Ok(text) => FieldValue::String(text.to_string()),
            Err(_) => FieldValue::Bytes(s.as_bytes().to_vec()),
        },
        AMQPValue::FieldArray(a) => FieldValue::Array(a.as_slice().iter().map(from_amqp_value).collect()),
        AMQPValue::Timestamp(t) => FieldValue::UInt(*t),
        AMQPValue::FieldTable(t) => FieldValue::Table(from_amqp_table(t)),
        AMQPValue::ByteArray(b) => FieldValue::Bytes(b.as_slice().to_vec()),
        AMQPValue::Void => FieldValue::Void,
    }
}

fn to_amqp_value(v: &FieldValue) -> AMQPValue {
    match v {
        FieldValue::Bool(b) => AMQPValue::Boolean(*b),
        FieldValue::Int(n) => AMQPValue::LongLongInt(*n),
        FieldValue::UInt(n) => match i64::try_from(*n) {
            Ok(n) => AMQPValue::LongLongInt(n),
            Err(_) => AMQPValue::Timestamp(*n),
        },
        FieldValue::Float(n) => AMQPValue::Double(*n),
        FieldValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        FieldValue::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(to_amqp_value).collect::<Vec<_>>()))
        }
        FieldValue::Table(t) => AMQPValue::FieldTable(to_amqp_table(t)),
        FieldValue::Bytes(b) => AMQPValue::ByteArray(ByteArray::from(b.clone())),
        FieldValue::Void => AMQPValue::Void,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_values_survive_conversion() {
        let mut headers = FieldTable::new();
        headers.insert("to".into(), FieldValue::Array(vec!["a@x".into(), "b@y".into()]));
        headers.insert("retries".into(), FieldValue::Int(3));
        headers.insert("x-queue-mode".into(), "lazy".into());

        let back = from_amqp_table(&to_amqp_table(&headers));
        assert_eq!(back, headers);
    }

    #[test]
    fn test_properties_mapping_keeps_reply_fields() {
        let props = Properties::default()
            .with_reply_to("amq.gen-1")
            .with_correlation_id("c-9")
            .with_content_type("text/plain");
        let amqp = to_amqp_properties(&props);
        assert_eq!(amqp.reply_to().as_ref().map(|s| s.as_str()), Some("amq.gen-1"));
        assert_eq!(amqp.correlation_id().as_ref().map(|s| s.as_str()), Some("c-9"));
        assert!(amqp.headers().is_none());
    }
}
