//! # In-flight deliveries and their execution context.
//!
//! A delivery taken from the stream becomes an [`InFlight`]: the immutable
//! [`Delivery`] plus an [`Acker`] bound to the channel that produced it. The
//! acker's terminal methods consume it, so a delivery tag is settled at most
//! once; a dropped acker leaves the message unacknowledged until the channel
//! closes and the broker requeues it.
//!
//! [`ExecutionContext`] is what a handler sees besides the body: message
//! metadata, plus the environment-variable rendering used by the subprocess
//! handler.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::broker::{Delivery, FieldValue, Properties, SharedChannel};
use crate::error::BrokerError;

/// Settles exactly one delivery tag on the channel that delivered it.
#[derive(Debug)]
#[must_use = "an unsettled delivery stays unacknowledged until the channel closes"]
pub struct Acker {
    channel: SharedChannel,
    tag: u64,
}

impl Acker {
    pub fn new(channel: SharedChannel, tag: u64) -> Self {
        Self { channel, tag }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// `basic.ack`.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.channel.ack(self.tag).await
    }

    /// `basic.nack`, optionally requeueing.
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.channel.nack(self.tag, requeue).await
    }
}

/// A delivery that has not been settled yet.
#[derive(Debug)]
pub struct InFlight {
    pub delivery: Delivery,
    pub acker: Acker,
}

impl InFlight {
    pub fn new(delivery: Delivery, channel: SharedChannel) -> Self {
        let acker = Acker::new(channel, delivery.delivery_tag);
        Self { delivery, acker }
    }
}

/// Message metadata handed to handlers.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionContext {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: Properties,
}

impl ExecutionContext {
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
            properties: delivery.properties.clone(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&FieldValue> {
        self.properties.headers.get(name)
    }

    /// Non-empty `reply_to`.
    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref().filter(|s| !s.is_empty())
    }

    /// Message id, or `"-"`.
    pub fn id_for_log(&self) -> &str {
        self.properties
            .message_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("-")
    }

    /// Environment for a subprocess.
    ///
    /// One `AMQP_<header>` per header (value rendered by [`FieldValue`]'s
    /// `Display`), then the standard fields. Unset strings render empty,
    /// unset delivery mode and priority render `0`, the timestamp is RFC 3339
    /// UTC with nanoseconds (empty when unset).
    pub fn env(&self) -> Vec<(String, String)> {
        let p = &self.properties;
        let text = |v: &Option<String>| v.clone().unwrap_or_default();

        let mut env: Vec<(String, String)> = p
            .headers
            .iter()
            .map(|(k, v)| (format!("AMQP_{k}"), v.to_string()))
            .collect();

        env.extend([
            ("ContentType".to_string(), text(&p.content_type)),
            ("ContentEncoding".to_string(), text(&p.content_encoding)),
            ("CorrelationId".to_string(), text(&p.correlation_id)),
            ("ReplyTo".to_string(), text(&p.reply_to)),
            ("Expiration".to_string(), text(&p.expiration)),
            ("MessageId".to_string(), text(&p.message_id)),
            ("Type".to_string(), text(&p.kind)),
            ("Exchange".to_string(), self.exchange.clone()),
            ("RoutingKey".to_string(), self.routing_key.clone()),
            (
                "DeliveryMode".to_string(),
                p.delivery_mode.unwrap_or(0).to_string(),
            ),
            ("Priority".to_string(), p.priority.unwrap_or(0).to_string()),
            ("Timestamp".to_string(), rfc3339_nanos(p.timestamp)),
        ]);
        env
    }
}

fn rfc3339_nanos(seconds: Option<u64>) -> String {
    seconds
        .and_then(|s| i64::try_from(s).ok())
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(properties: Properties) -> ExecutionContext {
        ExecutionContext {
            delivery_tag: 4,
            exchange: "amq.topic".into(),
            routing_key: "jobs.resize".into(),
            redelivered: false,
            properties,
        }
    }

    fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_env_renders_headers_and_fields() {
        let mut props = Properties::default()
            .with_header("width", 640i64)
            .with_header("to", FieldValue::Array(vec!["a@x".into(), "b@y".into()]))
            .with_reply_to("amq.gen-7")
            .with_message_id("m-1");
        props.timestamp = Some(1_700_000_000);
        props.delivery_mode = Some(2);

        let env = ctx(props).env();
        assert_eq!(lookup(&env, "AMQP_width"), Some("640"));
        assert_eq!(lookup(&env, "AMQP_to"), Some("[a@x b@y]"));
        assert_eq!(lookup(&env, "ReplyTo"), Some("amq.gen-7"));
        assert_eq!(lookup(&env, "RoutingKey"), Some("jobs.resize"));
        assert_eq!(lookup(&env, "DeliveryMode"), Some("2"));
        assert_eq!(lookup(&env, "Priority"), Some("0"));
        assert_eq!(
            lookup(&env, "Timestamp"),
            Some("2023-11-14T22:13:20.000000000Z")
        );
    }

    #[test]
    fn test_env_unset_fields_are_empty() {
        let env = ctx(Properties::default()).env();
        assert_eq!(lookup(&env, "CorrelationId"), Some(""));
        assert_eq!(lookup(&env, "Timestamp"), Some(""));
        assert!(!env.iter().any(|(k, _)| k.starts_with("AMQP_")));
    }
}
