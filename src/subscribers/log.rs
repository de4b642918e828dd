//! # LogWriter: runtime events to `tracing`
//!
//! Connection-level events log at `info`/`warn`, per-delivery events at `debug`.
//!
//! ## Example output (fmt layer)
//! ```text
//! INFO  connecting epoch=1 attempt=1
//! WARN  connect failed epoch=1 failures=1 err="connect failed: connection refused"
//! INFO  reconnect scheduled epoch=1 delay_ms=10000 failures=1
//! INFO  consumer started queue="amq.gen-1" workers=4
//! DEBUG delivery requeued queue="jobs" tag=7 err="exit status 3"
//! ```

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let reason = e.reason.as_deref().unwrap_or("");
        let queue = e.queue.as_deref().unwrap_or("");
        let msg = e.message_id.as_deref().unwrap_or("-");
        match e.kind {
            EventKind::Connecting => {
                info!(epoch = ?e.epoch, attempt = ?e.attempt, "connecting");
            }
            EventKind::Connected => info!(epoch = ?e.epoch, "connected"),
            EventKind::ConnectFailed => {
                warn!(epoch = ?e.epoch, failures = ?e.attempt, err = reason, "connect failed");
            }
            EventKind::EpochEnded => info!(epoch = ?e.epoch, outcome = reason, "epoch ended"),
            EventKind::BackoffScheduled => {
                info!(
                    epoch = ?e.epoch,
                    delay_ms = ?e.delay_ms,
                    failures = ?e.attempt,
                    err = reason,
                    "reconnect scheduled"
                );
            }
            EventKind::TopologyDeclared => info!(epoch = ?e.epoch, queue, "topology declared"),
            EventKind::ConsumerStarted => info!(queue, workers = ?e.attempt, "consumer started"),
            EventKind::DeliveryAcked => debug!(queue, tag = ?e.tag, msg, "delivery acked"),
            EventKind::DeliveryRequeued => {
                debug!(queue, tag = ?e.tag, msg, err = reason, "delivery requeued");
            }
            EventKind::DeliveryRejected => {
                warn!(queue, tag = ?e.tag, msg, err = reason, "delivery rejected");
            }
            EventKind::HandlerFailed => {
                warn!(
                    handler = e.source.as_deref().unwrap_or("?"),
                    tag = ?e.tag,
                    msg,
                    err = reason,
                    "handler failed"
                );
            }
            EventKind::ReplyPublished => debug!(destination = queue, correlation = msg, "reply published"),
            EventKind::ShutdownRequested => info!("shutdown requested"),
            EventKind::SupervisorStopped => {
                if reason.is_empty() {
                    info!(epoch = ?e.epoch, "supervisor stopped");
                } else {
                    warn!(epoch = ?e.epoch, err = reason, "supervisor stopped");
                }
            }
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked => {
                warn!(
                    subscriber = e.source.as_deref().unwrap_or("?"),
                    err = reason,
                    "subscriber problem"
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
