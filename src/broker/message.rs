//! # Wire-level message model.
//!
//! Backend-neutral snapshots of what the broker hands out ([`Delivery`]) and
//! what gets published ([`OutboundMessage`]). Header values are modeled by
//! [`FieldValue`], which covers the AMQP field-table scalar, array and table types.
//!
//! Field names are case-preserved; empty strings are treated as "not set" by
//! the accessors that matter for routing (`reply_to`, `correlation_id`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Header table: string keys to scalar/array/table values.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// A single header value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Array(Vec<FieldValue>),
    Table(FieldTable),
    Bytes(Vec<u8>),
    Void,
}

impl FieldValue {
    /// Returns the string payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the array payload, if this is an array value.
    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Array(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// Renders the value the way it appears in environment variables:
/// scalars verbatim, arrays as `[a b c]`, tables as JSON.
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::UInt(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::String(s) => f.write_str(s),
            FieldValue::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            FieldValue::Void => Ok(()),
            FieldValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            FieldValue::Table(table) => match serde_json::to_string(table) {
                Ok(json) => f.write_str(&json),
                Err(_) => Err(fmt::Error),
            },
        }
    }
}

/// Basic properties carried by a message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: FieldTable,
    /// 1 = non-persistent, 2 = persistent.
    pub delivery_mode: Option<u8>,
    /// 0..=9.
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    /// The AMQP `type` property.
    pub kind: Option<String>,
    pub app_id: Option<String>,
}

impl Properties {
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// A message to publish.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutboundMessage {
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            properties: Properties::default(),
            body: body.into(),
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

/// Immutable snapshot of a received message.
///
/// The `delivery_tag` is only meaningful to the channel that produced it and is
/// consumed by exactly one terminal ack/nack (see [`crate::dispatch::Acker`]).
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: Properties,
    pub body: Vec<u8>,
}

impl Delivery {
    /// Reply destination, `None` when unset or empty.
    pub fn reply_to(&self) -> Option<&str> {
        non_empty(&self.properties.reply_to)
    }

    /// Correlation id for a reply: the delivery's correlation id, falling back
    /// to its message id.
    pub fn correlation(&self) -> Option<&str> {
        non_empty(&self.properties.correlation_id).or_else(|| non_empty(&self.properties.message_id))
    }

    /// Message id or `"-"` for logs.
    pub fn id_for_log(&self) -> &str {
        non_empty(&self.properties.message_id).unwrap_or("-")
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(props: Properties) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: "amq.topic".into(),
            routing_key: "jobs.run".into(),
            redelivered: false,
            properties: props,
            body: b"payload".to_vec(),
        }
    }

    #[test]
    fn test_correlation_falls_back_to_message_id() {
        let d = delivery(Properties::default().with_message_id("m-1"));
        assert_eq!(d.correlation(), Some("m-1"));

        let d = delivery(
            Properties::default()
                .with_message_id("m-1")
                .with_correlation_id("c-1"),
        );
        assert_eq!(d.correlation(), Some("c-1"));
    }

    #[test]
    fn test_empty_reply_to_is_none() {
        let d = delivery(Properties::default().with_reply_to(""));
        assert_eq!(d.reply_to(), None);
    }

    #[test]
    fn test_field_value_display() {
        let arr = FieldValue::Array(vec!["a@x".into(), "b@y".into()]);
        assert_eq!(arr.to_string(), "[a@x b@y]");
        assert_eq!(FieldValue::Int(-3).to_string(), "-3");

        let mut table = FieldTable::new();
        table.insert("k".into(), FieldValue::Bool(true));
        assert_eq!(FieldValue::Table(table).to_string(), r#"{"k":true}"#);
    }
}
