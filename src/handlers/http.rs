//! # HTTP forward handler.
//!
//! POSTs each delivery as a JSON [`ForwardDocument`] to a fixed URL with the
//! configured headers (default `Content-Type: application/json`) and request
//! timeout.
//!
//! - 2xx ⇒ `Success(response body)`
//! - other status ⇒ `HandlerFailure("HTTP <status>", response body)`
//! - request error (refused, timeout, DNS) ⇒ `HandlerFailure`, so the failure
//!   policy decides between dropping and retrying.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use tracing::debug;

use crate::broker::FieldTable;
use crate::dispatch::{DispatchOutcome, ExecutionContext};
use crate::error::ConfigError;

use super::Handler;

/// JSON document sent for each delivery.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForwardDocument {
    #[serde(skip_serializing_if = "FieldTable::is_empty")]
    pub headers: FieldTable,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// RFC 3339, UTC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub exchange: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub routing_key: String,
}

impl ForwardDocument {
    pub fn new(ctx: &ExecutionContext, body: &[u8]) -> Self {
        let p = &ctx.properties;
        Self {
            headers: p.headers.clone(),
            body: String::from_utf8_lossy(body).into_owned(),
            content_type: p.content_type.clone(),
            content_encoding: p.content_encoding.clone(),
            delivery_mode: p.delivery_mode,
            priority: p.priority,
            correlation_id: p.correlation_id.clone(),
            reply_to: p.reply_to.clone(),
            expiration: p.expiration.clone(),
            message_id: p.message_id.clone(),
            timestamp: p
                .timestamp
                .and_then(|s| i64::try_from(s).ok())
                .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            kind: p.kind.clone(),
            exchange: ctx.exchange.clone(),
            routing_key: ctx.routing_key.clone(),
        }
    }
}

/// Forwards deliveries to an HTTP endpoint.
#[derive(Clone, Debug)]
pub struct HttpHandler {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl HttpHandler {
    /// Default request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "http",
                reason: e.to_string(),
            })?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self {
            client,
            url: url.into(),
            headers,
        })
    }

    /// Adds or replaces a request header.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            field: "http header",
            reason,
        };
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Handler for HttpHandler {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(&self, ctx: &ExecutionContext, body: &[u8]) -> DispatchOutcome {
        let doc = ForwardDocument::new(ctx, body);
        let payload = match serde_json::to_vec(&doc) {
            Ok(p) => p,
            Err(e) => return DispatchOutcome::rejected(format!("encode: {e}")),
        };

        let response = match self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return DispatchOutcome::failure(format!("request: {e}"), Vec::new()),
        };

        let status = response.status();
        let output = match response.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => return DispatchOutcome::failure(format!("read response: {e}"), Vec::new()),
        };
        debug!(url = %self.url, %status, bytes = output.len(), "forwarded");

        if status.is_success() {
            DispatchOutcome::Success(output)
        } else {
            DispatchOutcome::failure(format!("HTTP {status}"), output)
        }
    }
}
