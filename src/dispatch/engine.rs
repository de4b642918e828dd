//! # Dispatch engine: consume, fan out, settle.
//!
//! One subscription per epoch; `workers` tasks compete for deliveries from the
//! shared stream, so each delivery reaches exactly one worker.
//!
//! ```text
//! consume(queue) ──► Arc<Mutex<DeliveryStream>>
//!                         ├──► worker 0 ─┐
//!                         ├──► worker 1 ─┼─► handler.invoke ─► FailureStrategy::decide
//!                         └──► worker N ─┘        ─► ack/nack (once) ─► reply (optional)
//! ```
//!
//! ## Stopping
//! - Parent token cancelled: workers finish their in-flight delivery and stop pulling.
//! - A worker halts (policy halt, fatal error, stream end): it cancels the shared
//!   halt token; siblings drain the same way.
//! - The engine returns once every worker has returned, reporting the most
//!   severe exit: failure, then stop, then restart, then stream end.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{ConsumeOptions, Delivery, DeliveryStream, SharedChannel};
use crate::error::{BrokerError, DispatchError};
use crate::events::{Bus, Event, EventKind};
use crate::handlers::HandlerRef;

use super::delivery::{ExecutionContext, InFlight};
use super::outcome::{DispatchOutcome, FinalAction, Halt};
use super::reply::ReplyPublisher;
use super::strategy::FailureStrategy;

/// How the consume loop of one epoch ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineExit {
    /// The parent token was cancelled.
    Cancelled,
    /// Single-message mode processed its message.
    Completed,
    /// A failure policy halted consumption.
    Halted(Halt),
    /// The broker ended the subscription.
    StreamClosed,
    /// The channel is unusable.
    Failed(DispatchError),
}

impl EngineExit {
    fn severity(&self) -> u8 {
        match self {
            EngineExit::Cancelled | EngineExit::Completed => 0,
            EngineExit::StreamClosed => 1,
            EngineExit::Halted(Halt::Restart { .. }) => 2,
            EngineExit::Halted(_) => 3,
            EngineExit::Failed(_) => 4,
        }
    }
}

/// Consumer settings of the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineOptions {
    /// Concurrent workers (at least 1).
    pub workers: usize,
    /// Process exactly one delivery, then return [`EngineExit::Completed`].
    pub single: bool,
    /// `basic.qos` prefetch; `None` uses the worker count, `Some(0)` skips qos.
    pub prefetch: Option<u16>,
    pub consumer_tag: String,
    pub exclusive: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            single: false,
            prefetch: None,
            consumer_tag: String::new(),
            exclusive: false,
        }
    }
}

/// Consume loop with worker fan-out.
#[derive(Clone)]
pub struct DispatchEngine {
    handler: HandlerRef,
    strategy: FailureStrategy,
    replies: ReplyPublisher,
    options: EngineOptions,
    bus: Option<Bus>,
}

impl DispatchEngine {
    pub fn new(handler: HandlerRef, strategy: FailureStrategy) -> Self {
        Self {
            handler,
            strategy,
            replies: ReplyPublisher,
            options: EngineOptions::default(),
            bus: None,
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Subscribes to `queue` and dispatches until cancelled, halted or failed.
    pub async fn consume(
        &self,
        channel: &SharedChannel,
        queue: &str,
        token: &CancellationToken,
    ) -> EngineExit {
        let workers = self.options.workers.max(1);
        let prefetch = self
            .options
            .prefetch
            .unwrap_or_else(|| u16::try_from(workers).unwrap_or(u16::MAX));
        if prefetch > 0 {
            if let Err(source) = channel.qos(prefetch).await {
                return EngineExit::Failed(DispatchError::Subscribe {
                    queue: queue.to_string(),
                    source,
                });
            }
        }

        let opts = ConsumeOptions {
            consumer_tag: self.options.consumer_tag.clone(),
            exclusive: self.options.exclusive,
        };
        let stream = match channel.consume(queue, &opts).await {
            Ok(stream) => stream,
            Err(source) => {
                return EngineExit::Failed(DispatchError::Subscribe {
                    queue: queue.to_string(),
                    source,
                })
            }
        };

        let queue: Arc<str> = Arc::from(queue);
        info!(queue = %queue, workers, single = self.options.single, "consuming");
        self.publish(
            Event::new(EventKind::ConsumerStarted)
                .with_queue(Arc::clone(&queue))
                .with_attempt(workers as u32),
        );

        let stream = Arc::new(Mutex::new(stream));
        if self.options.single {
            return self
                .worker(0, channel.clone(), queue, stream, token.child_token(), true)
                .await;
        }

        let halt = token.child_token();
        let mut set = JoinSet::new();
        let mut ids = HashMap::with_capacity(workers);
        for index in 0..workers {
            let engine = self.clone();
            let fut = engine.worker_owned(
                index,
                channel.clone(),
                Arc::clone(&queue),
                Arc::clone(&stream),
                halt.clone(),
            );
            let abort = set.spawn(fut);
            ids.insert(abort.id(), index);
        }

        let mut exit = EngineExit::Cancelled;
        while let Some(joined) = set.join_next().await {
            let worker_exit = match joined {
                Ok(e) => e,
                Err(err) => {
                    halt.cancel();
                    EngineExit::Failed(DispatchError::Worker {
                        worker: ids.get(&err.id()).copied().unwrap_or(usize::MAX),
                        reason: err.to_string(),
                    })
                }
            };
            if worker_exit.severity() > exit.severity() {
                exit = worker_exit;
            }
        }
        exit
    }

    async fn worker_owned(
        self,
        index: usize,
        channel: SharedChannel,
        queue: Arc<str>,
        stream: Arc<Mutex<DeliveryStream>>,
        halt: CancellationToken,
    ) -> EngineExit {
        self.worker(index, channel, queue, stream, halt, false).await
    }

    async fn worker(
        &self,
        index: usize,
        channel: SharedChannel,
        queue: Arc<str>,
        stream: Arc<Mutex<DeliveryStream>>,
        halt: CancellationToken,
        single: bool,
    ) -> EngineExit {
        loop {
            let next = {
                let mut guard = tokio::select! {
                    biased;
                    _ = halt.cancelled() => return EngineExit::Cancelled,
                    guard = stream.lock() => guard,
                };
                tokio::select! {
                    biased;
                    _ = halt.cancelled() => return EngineExit::Cancelled,
                    item = guard.next() => item,
                }
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    halt.cancel();
                    warn!(worker = index, queue = %queue, err = %e, "delivery stream failed");
                    return EngineExit::Failed(DispatchError::Stream(e));
                }
                None => {
                    halt.cancel();
                    info!(worker = index, queue = %queue, "delivery stream closed");
                    return EngineExit::StreamClosed;
                }
            };

            match self.process(&channel, &queue, delivery).await {
                Ok(None) if single => return EngineExit::Completed,
                Ok(None) => {}
                Ok(Some(h)) => {
                    halt.cancel();
                    return EngineExit::Halted(h);
                }
                Err(e) => {
                    halt.cancel();
                    return EngineExit::Failed(e);
                }
            }
        }
    }

    /// Runs the handler on one delivery and settles it. Returns a policy halt, if any.
    async fn process(
        &self,
        channel: &SharedChannel,
        queue: &Arc<str>,
        delivery: Delivery,
    ) -> Result<Option<Halt>, DispatchError> {
        let InFlight { delivery, acker } = InFlight::new(delivery, channel.clone());
        let tag = acker.tag();
        let msg_id: Arc<str> = Arc::from(delivery.id_for_log());
        let ctx = ExecutionContext::from_delivery(&delivery);

        debug!(queue = %queue, tag, msg = %msg_id, redelivered = delivery.redelivered, "delivery");
        let outcome = self.handler.invoke(&ctx, &delivery.body).await;

        match &outcome {
            DispatchOutcome::HandlerFailure { exit, .. } => {
                warn!(handler = self.handler.name(), tag, msg = %msg_id, policy = %self.strategy.policy, err = %exit, "handler failed");
                self.publish(
                    Event::new(EventKind::HandlerFailed)
                        .with_source(self.handler.name())
                        .with_tag(tag)
                        .with_message_id(Arc::clone(&msg_id))
                        .with_reason(exit.as_str()),
                );
            }
            DispatchOutcome::TransportFailure(reason) => {
                warn!(handler = self.handler.name(), tag, msg = %msg_id, err = %reason, "handler could not run");
            }
            DispatchOutcome::Rejected { reason } => {
                warn!(handler = self.handler.name(), tag, msg = %msg_id, err = %reason, "message rejected");
            }
            DispatchOutcome::Success(_) => {}
        }
        let reason: Option<Arc<str>> = match &outcome {
            DispatchOutcome::HandlerFailure { exit, .. } => Some(Arc::from(exit.as_str())),
            DispatchOutcome::Rejected { reason } => Some(Arc::from(reason.as_str())),
            _ => None,
        };

        let decision = self.strategy.decide(outcome, &delivery);
        let settled = |kind: EventKind| {
            let mut ev = Event::new(kind)
                .with_queue(Arc::clone(queue))
                .with_tag(tag)
                .with_message_id(Arc::clone(&msg_id));
            if let Some(r) = &reason {
                ev = ev.with_reason(Arc::clone(r));
            }
            ev
        };
        let ack_err = |source: BrokerError| DispatchError::Ack { tag, source };

        match decision.action {
            FinalAction::Acknowledge => {
                acker.ack().await.map_err(ack_err)?;
                self.publish(settled(EventKind::DeliveryAcked));
            }
            FinalAction::AcknowledgeAndReply(envelope) => {
                acker.ack().await.map_err(ack_err)?;
                self.publish(settled(EventKind::DeliveryAcked));
                self.replies
                    .reply(channel, &envelope)
                    .await
                    .map_err(|source| DispatchError::Reply {
                        destination: envelope.destination.clone(),
                        source,
                    })?;
                debug!(destination = %envelope.destination, tag, "reply published");
                let mut ev = Event::new(EventKind::ReplyPublished).with_queue(envelope.destination.as_str());
                if let Some(id) = &envelope.correlation_id {
                    ev = ev.with_message_id(id.as_str());
                }
                self.publish(ev);
            }
            FinalAction::NegativeAcknowledgeAndRequeue => {
                acker.nack(true).await.map_err(ack_err)?;
                self.publish(settled(EventKind::DeliveryRequeued));
            }
            FinalAction::NegativeAcknowledgeDiscard => {
                acker.nack(false).await.map_err(ack_err)?;
                self.publish(settled(EventKind::DeliveryRejected));
            }
            FinalAction::Abandon => {
                drop(acker);
            }
        }

        match decision.halt {
            None => Ok(None),
            Some(Halt::Fatal { reason }) => Err(DispatchError::Transport {
                handler: self.handler.name().to_string(),
                reason,
            }),
            Some(h) => Ok(Some(h)),
        }
    }

    fn publish(&self, ev: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(ev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::broker::memory::MemoryBroker;
    use crate::broker::{Broker, BrokerConnection, OutboundMessage, Properties};
    use crate::dispatch::reply::ERROR_HEADER;
    use crate::handlers::HandlerFn;
    use crate::policies::FailurePolicy;

    async fn open(broker: &MemoryBroker) -> (Box<dyn BrokerConnection>, SharedChannel) {
        let conn = broker.connect("mem://").await.unwrap();
        let ch = SharedChannel::new(conn.open_channel().await.unwrap());
        (conn, ch)
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    /// Fails on bodies equal to `"fail"`, echoes otherwise.
    fn echo_or_fail(calls: Arc<AtomicUsize>) -> HandlerRef {
        HandlerFn::arc("echo", move |_ctx: ExecutionContext, body: Vec<u8>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if body == b"fail" {
                    DispatchOutcome::failure("exit status: 1", "partial")
                } else {
                    DispatchOutcome::success(body)
                }
            }
        })
    }

    #[tokio::test]
    async fn test_drop_policy_keeps_consuming() {
        let broker = MemoryBroker::new();
        for i in 1..=10 {
            let body = if i == 5 { "fail".to_string() } else { format!("m{i}") };
            broker.enqueue("jobs", OutboundMessage::new(body));
        }
        let (_conn, ch) = open(&broker).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = DispatchEngine::new(echo_or_fail(calls.clone()), FailureStrategy::new(FailurePolicy::Drop));

        let token = CancellationToken::new();
        let run = {
            let (engine, ch, token) = (engine.clone(), ch.clone(), token.clone());
            tokio::spawn(async move { engine.consume(&ch, "jobs", &token).await })
        };

        wait_until(|| broker.acks().len() == 10).await;
        token.cancel();
        assert_eq!(run.await.unwrap(), EngineExit::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert!(broker.nacks().is_empty());
        assert_eq!(broker.queue_len("jobs"), 0);
    }

    #[tokio::test]
    async fn test_stop_policy_requeues_and_reads_no_more() {
        let broker = MemoryBroker::new();
        for body in ["fail", "b", "c"] {
            broker.enqueue("jobs", OutboundMessage::new(body));
        }
        let (_conn, ch) = open(&broker).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = DispatchEngine::new(echo_or_fail(calls.clone()), FailureStrategy::new(FailurePolicy::Stop));

        let exit = engine.consume(&ch, "jobs", &CancellationToken::new()).await;

        assert_eq!(
            exit,
            EngineExit::Halted(Halt::Stop {
                detail: "exit status: 1".into()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.nacks().len(), 1);
        assert!(broker.nacks()[0].1);
        assert!(broker.acks().is_empty());
        assert_eq!(broker.queue_len("jobs"), 3);
    }

    #[tokio::test]
    async fn test_reply_with_error_publishes_once() {
        let broker = MemoryBroker::new();
        broker.enqueue(
            "jobs",
            OutboundMessage::new("fail").with_properties(
                Properties::default()
                    .with_reply_to("client")
                    .with_correlation_id("c-42"),
            ),
        );
        let (_conn, ch) = open(&broker).await;
        let engine = DispatchEngine::new(
            echo_or_fail(Arc::new(AtomicUsize::new(0))),
            FailureStrategy::new(FailurePolicy::ReplyWithError),
        )
        .with_options(EngineOptions {
            single: true,
            ..EngineOptions::default()
        });

        let exit = engine.consume(&ch, "jobs", &CancellationToken::new()).await;
        assert_eq!(exit, EngineExit::Completed);
        assert_eq!(broker.acks().len(), 1);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let reply = &published[0];
        assert_eq!((reply.exchange.as_str(), reply.routing_key.as_str()), ("", "client"));
        assert_eq!(reply.message.body, b"partial");
        assert_eq!(reply.message.properties.correlation_id.as_deref(), Some("c-42"));
        assert_eq!(
            reply.message.properties.headers.get(ERROR_HEADER).and_then(|v| v.as_str()),
            Some("exit status: 1")
        );
    }

    #[tokio::test]
    async fn test_reply_with_error_without_reply_to_publishes_nothing() {
        let broker = MemoryBroker::new();
        broker.enqueue("jobs", OutboundMessage::new("fail"));
        let (_conn, ch) = open(&broker).await;
        let engine = DispatchEngine::new(
            echo_or_fail(Arc::new(AtomicUsize::new(0))),
            FailureStrategy::new(FailurePolicy::ReplyWithError),
        )
        .with_options(EngineOptions {
            single: true,
            ..EngineOptions::default()
        });

        assert_eq!(
            engine.consume(&ch, "jobs", &CancellationToken::new()).await,
            EngineExit::Completed
        );
        assert_eq!(broker.acks().len(), 1);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_success_output_reply_uses_message_id_as_correlation() {
        let broker = MemoryBroker::new();
        broker.enqueue(
            "jobs",
            OutboundMessage::new("ping").with_properties(
                Properties::default()
                    .with_reply_to("client")
                    .with_message_id("m-7"),
            ),
        );
        let (_conn, ch) = open(&broker).await;
        let engine = DispatchEngine::new(
            echo_or_fail(Arc::new(AtomicUsize::new(0))),
            FailureStrategy::new(FailurePolicy::Drop).with_reply_output(true),
        )
        .with_options(EngineOptions {
            single: true,
            ..EngineOptions::default()
        });

        engine.consume(&ch, "jobs", &CancellationToken::new()).await;
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message.body, b"ping");
        assert_eq!(published[0].message.properties.correlation_id.as_deref(), Some("m-7"));
        assert!(published[0].message.properties.headers.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_delivery_unsettled() {
        let broker = MemoryBroker::new();
        broker.enqueue("jobs", OutboundMessage::new("x"));
        let (conn, ch) = open(&broker).await;
        let handler = HandlerFn::arc("broken", |_ctx: ExecutionContext, _body: Vec<u8>| async {
            DispatchOutcome::transport("spawn: No such file or directory")
        });
        let engine = DispatchEngine::new(handler, FailureStrategy::new(FailurePolicy::Drop));

        let exit = engine.consume(&ch, "jobs", &CancellationToken::new()).await;
        assert!(matches!(
            exit,
            EngineExit::Failed(DispatchError::Transport { ref handler, .. }) if handler == "broken"
        ));
        assert!(broker.acks().is_empty());
        assert!(broker.nacks().is_empty());

        conn.close().await;
        assert_eq!(broker.queue_len("jobs"), 1);
    }

    #[tokio::test]
    async fn test_parallel_workers_settle_each_delivery_once() {
        let broker = MemoryBroker::new();
        for i in 0..40 {
            broker.enqueue("jobs", OutboundMessage::new(format!("m{i}")));
        }
        let (_conn, ch) = open(&broker).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = DispatchEngine::new(echo_or_fail(calls.clone()), FailureStrategy::default())
            .with_options(EngineOptions {
                workers: 4,
                ..EngineOptions::default()
            });

        let token = CancellationToken::new();
        let run = {
            let (engine, ch, token) = (engine.clone(), ch.clone(), token.clone());
            tokio::spawn(async move { engine.consume(&ch, "jobs", &token).await })
        };
        wait_until(|| broker.acks().len() == 40).await;
        token.cancel();
        assert_eq!(run.await.unwrap(), EngineExit::Cancelled);

        let mut tags = broker.acks();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), 40);
        assert_eq!(calls.load(Ordering::SeqCst), 40);
    }

    #[tokio::test]
    async fn test_restart_halt_stops_all_workers() {
        let broker = MemoryBroker::new();
        broker.enqueue("jobs", OutboundMessage::new("fail"));
        let (_conn, ch) = open(&broker).await;
        let engine = DispatchEngine::new(
            echo_or_fail(Arc::new(AtomicUsize::new(0))),
            FailureStrategy::new(FailurePolicy::Restart),
        )
        .with_options(EngineOptions {
            workers: 3,
            ..EngineOptions::default()
        });

        let exit = engine.consume(&ch, "jobs", &CancellationToken::new()).await;
        assert!(matches!(exit, EngineExit::Halted(Halt::Restart { .. })));
        assert_eq!(broker.queue_len("jobs"), 1);
    }

    #[tokio::test]
    async fn test_broker_disconnect_ends_stream() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        broker.enqueue("jobs", OutboundMessage::new("x"));
        let engine = DispatchEngine::new(
            echo_or_fail(Arc::new(AtomicUsize::new(0))),
            FailureStrategy::default(),
        );

        let token = CancellationToken::new();
        let run = {
            let (engine, ch, token) = (engine.clone(), ch.clone(), token.clone());
            tokio::spawn(async move { engine.consume(&ch, "jobs", &token).await })
        };
        wait_until(|| broker.acks().len() == 1).await;
        broker.disconnect_all();
        assert_eq!(run.await.unwrap(), EngineExit::StreamClosed);
    }

    #[tokio::test]
    async fn test_subscribe_to_missing_queue_fails() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        let engine = DispatchEngine::new(
            echo_or_fail(Arc::new(AtomicUsize::new(0))),
            FailureStrategy::default(),
        );
        let exit = engine.consume(&ch, "nope", &CancellationToken::new()).await;
        assert!(matches!(exit, EngineExit::Failed(DispatchError::Subscribe { .. })));
    }
}
