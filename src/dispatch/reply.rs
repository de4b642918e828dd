//! # Reply publication.
//!
//! Replies go to the default exchange with the destination as routing key,
//! which addresses the requester's queue directly. Each reply gets a fresh
//! UUIDv4 message id and the current timestamp, and carries the request's
//! correlation id. A failure detail travels in the `error` header.

use chrono::Utc;
use uuid::Uuid;

use crate::broker::{FieldValue, OutboundMessage, Properties, SharedChannel};
use crate::error::BrokerError;

/// Header carrying the failure detail of an error reply.
pub const ERROR_HEADER: &str = "error";

/// A reply ready to publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub correlation_id: Option<String>,
    /// Routing key on the default exchange (the request's `reply_to`).
    pub destination: String,
    pub body: Vec<u8>,
    pub error: Option<String>,
}

impl ReplyEnvelope {
    pub fn new(destination: impl Into<String>, body: impl Into<Vec<u8>>, correlation_id: Option<&str>) -> Self {
        Self {
            correlation_id: correlation_id.map(str::to_string),
            destination: destination.into(),
            body: body.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// The message that [`ReplyPublisher`] publishes for this envelope.
    pub fn to_message(&self) -> OutboundMessage {
        let mut props = Properties {
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: Some(unix_now()),
            correlation_id: self.correlation_id.clone(),
            ..Properties::default()
        };
        if let Some(err) = &self.error {
            props.headers.insert(ERROR_HEADER.to_string(), FieldValue::from(err.as_str()));
        }
        OutboundMessage::new(self.body.clone()).with_properties(props)
    }
}

fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

/// Publishes reply envelopes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplyPublisher;

impl ReplyPublisher {
    pub async fn reply(&self, channel: &SharedChannel, envelope: &ReplyEnvelope) -> Result<(), BrokerError> {
        channel
            .publish("", &envelope.destination, &envelope.to_message())
            .await
    }
}
