//! # In-process broker.
//!
//! [`MemoryBroker`] implements the [`Broker`] traits without a network. It keeps
//! exchanges, queues, bindings and unacknowledged deliveries in one shared state
//! and records every ack, nack and publish in a journal that tests inspect.
//!
//! ## Semantics mirrored from AMQP 0-9-1
//! - Default exchange `""` routes to the queue named by the routing key;
//!   `amq.direct`, `amq.topic` and `amq.fanout` exist from the start.
//! - Re-declaring an entity with equivalent attributes succeeds; a mismatch fails
//!   like `PRECONDITION_FAILED`; a passive declaration of a missing entity fails
//!   like `NOT_FOUND`.
//! - An empty queue name generates `amq.gen-N`. Exclusive queues belong to the
//!   declaring connection and are deleted (with their bindings) when it closes.
//! - Deliveries stay in the queue until a consumer stream polls them.
//! - Closing a channel returns its unacknowledged deliveries to the front of
//!   their queues, flagged `redelivered`.
//!
//! Failure injection: [`MemoryBroker::fail_next_dials`], [`MemoryBroker::fail_next_publishes`]
//! and [`MemoryBroker::disconnect_all`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Delivery, DeliveryStream,
    FieldTable, OutboundMessage, QueueDeclare,
};
use crate::error::BrokerError;
use crate::topology::{ExchangeKind, ExchangeSpec};

/// Journal entry of a channel operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Ack {
        tag: u64,
    },
    Nack {
        tag: u64,
        requeue: bool,
    },
    Publish {
        exchange: String,
        routing_key: String,
        message: OutboundMessage,
    },
}

/// A recorded publish.
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutboundMessage,
}

#[derive(Clone, Debug)]
struct Stored {
    exchange: String,
    routing_key: String,
    message: OutboundMessage,
    redelivered: bool,
}

#[derive(Debug)]
struct MemQueue {
    durable: bool,
    auto_delete: bool,
    exclusive_owner: Option<u64>,
    arguments: FieldTable,
    ready: VecDeque<Stored>,
}

#[derive(Clone, Debug)]
struct ExchangeEntry {
    kind: ExchangeKind,
    durable: bool,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    channel: u64,
    stored: Stored,
}

#[derive(Debug)]
struct ChannelEntry {
    connection: u64,
    closed: CancellationToken,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<(String, String, String)>,
    unacked: HashMap<u64, Unacked>,
    channels: HashMap<u64, ChannelEntry>,
    journal: Vec<Op>,
    next_tag: u64,
    next_id: u64,
    generated: u64,
    dials: u32,
    dial_failures: u32,
    publish_failures: u32,
}

impl State {
    fn with_defaults() -> Self {
        let mut state = State::default();
        for (name, kind) in [
            ("", ExchangeKind::Direct),
            ("amq.direct", ExchangeKind::Direct),
            ("amq.topic", ExchangeKind::Topic),
            ("amq.fanout", ExchangeKind::Fanout),
        ] {
            state.exchanges.insert(
                name.to_string(),
                ExchangeEntry {
                    kind,
                    durable: true,
                },
            );
        }
        state
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_ready(&mut self, queue: &str, channel: u64) -> Option<Delivery> {
        let stored = self.queues.get_mut(queue)?.ready.pop_front()?;
        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = Delivery {
            delivery_tag: tag,
            exchange: stored.exchange.clone(),
            routing_key: stored.routing_key.clone(),
            redelivered: stored.redelivered,
            properties: stored.message.properties.clone(),
            body: stored.message.body.clone(),
        };
        self.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                channel,
                stored,
            },
        );
        Some(delivery)
    }

    fn requeue_front(&mut self, queue: &str, mut stored: Stored) {
        if let Some(q) = self.queues.get_mut(queue) {
            stored.redelivered = true;
            q.ready.push_front(stored);
        }
    }

    /// Returns every unacked delivery of the given channels to its queue, preserving order.
    fn release_channels(&mut self, channels: &[u64]) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| channels.contains(&u.channel))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(u) = self.unacked.remove(&tag) {
                self.requeue_front(&u.queue, u.stored);
            }
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: &OutboundMessage) -> Result<(), BrokerError> {
        let stored = Stored {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
            redelivered: false,
        };

        if exchange.is_empty() {
            if let Some(q) = self.queues.get_mut(routing_key) {
                q.ready.push_back(stored);
            }
            return Ok(());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .map(|e| e.kind)
            .ok_or_else(|| BrokerError::Publish(format!("NOT_FOUND - no exchange '{exchange}'")))?;

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, ex, key)| {
                ex == exchange
                    && match kind {
                        ExchangeKind::Direct => key == routing_key,
                        ExchangeKind::Topic => topic_matches(key, routing_key),
                        ExchangeKind::Fanout | ExchangeKind::Headers => true,
                    }
            })
            .map(|(q, _, _)| q.clone())
            .collect();

        let mut seen = Vec::with_capacity(targets.len());
        for queue in targets {
            if seen.contains(&queue) {
                continue;
            }
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_back(stored.clone());
            }
            seen.push(queue);
        }
        Ok(())
    }
}

/// Topic pattern matching: `*` matches one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::with_defaults())),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `n` dials fail.
    pub fn fail_next_dials(&self, n: u32) {
        self.lock().dial_failures = n;
    }

    /// Makes the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().publish_failures = n;
    }

    /// Number of dial attempts so far (failed ones included).
    pub fn dial_count(&self) -> u32 {
        self.lock().dials
    }

    /// Broker-side disconnect: closes every open channel.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for entry in state.channels.values() {
            entry.closed.cancel();
        }
        state.release_channels(&ids);
        state.channels.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Appends a message to a queue, creating a durable queue if missing.
    pub fn enqueue(&self, queue: &str, message: OutboundMessage) {
        let mut state = self.lock();
        let q = state.queues.entry(queue.to_string()).or_insert_with(|| MemQueue {
            durable: true,
            auto_delete: false,
            exclusive_owner: None,
            arguments: FieldTable::new(),
            ready: VecDeque::new(),
        });
        q.ready.push_back(Stored {
            exchange: String::new(),
            routing_key: queue.to_string(),
            message,
            redelivered: false,
        });
        drop(state);
        self.notify.notify_waiters();
    }

    /// Routes a message as if published by an outside producer.
    pub fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let res = self.lock().route(exchange, routing_key, &message);
        self.notify.notify_waiters();
        res
    }

    /// Ready (not yet delivered) messages in a queue; 0 when the queue is missing.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Ready message bodies of a queue, in order.
    pub fn queue_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.message.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    /// Arguments the queue was declared with.
    pub fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        self.lock().queues.get(queue).map(|q| q.arguments.clone())
    }

    /// `(queue, exchange, routing_key)` triples.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock().bindings.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn journal(&self) -> Vec<Op> {
        self.lock().journal.clone()
    }

    /// Tags acknowledged so far.
    pub fn acks(&self) -> Vec<u64> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                Op::Ack { tag } => Some(*tag),
                _ => None,
            })
            .collect()
    }

    /// `(tag, requeue)` pairs negatively acknowledged so far.
    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                Op::Nack { tag, requeue } => Some((*tag, *requeue)),
                _ => None,
            })
            .collect()
    }

    /// Publishes issued through channels.
    pub fn published(&self) -> Vec<Published> {
        self.lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                Op::Publish {
                    exchange,
                    routing_key,
                    message,
                } => Some(Published {
                    exchange: exchange.clone(),
                    routing_key: routing_key.clone(),
                    message: message.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    async fn next_delivery(
        &self,
        queue: &str,
        channel: u64,
        closed: &CancellationToken,
    ) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if closed.is_cancelled() {
                return None;
            }
            {
                let mut state = self.lock();
                if let Some(delivery) = state.take_ready(queue, channel) {
                    return Some(delivery);
                }
                if !state.queues.contains_key(queue) {
                    return None;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = closed.cancelled() => return None,
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, _url: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        state.dials += 1;
        if state.dial_failures > 0 {
            state.dial_failures -= 1;
            return Err(BrokerError::Connect("connection refused".into()));
        }
        let id = state.next_id();
        drop(state);
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
            closed: CancellationToken::new(),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    closed: CancellationToken,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        let mut state = self.broker.lock();
        let id = state.next_id();
        let closed = self.closed.child_token();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                closed: closed.clone(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.id,
            closed,
        }))
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let mut state = self.broker.lock();
        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.connection == self.id)
            .map(|(id, _)| *id)
            .collect();
        state.release_channels(&channels);
        for id in &channels {
            state.channels.remove(id);
        }

        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.exclusive_owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            state.queues.remove(name);
        }
        state.bindings.retain(|(q, _, _)| !owned.contains(q));
        drop(state);
        self.broker.notify.notify_waiters();
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: u64,
    closed: CancellationToken,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let existing = state.exchanges.get(&spec.name).cloned();
        match existing {
            Some(_) if spec.passive => Ok(()),
            None if spec.passive => Err(BrokerError::Declare(format!(
                "NOT_FOUND - no exchange '{}'",
                spec.name
            ))),
            Some(existing) if existing.kind != spec.kind || existing.durable != spec.durable => {
                Err(BrokerError::Declare(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                    spec.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    spec.name.clone(),
                    ExchangeEntry {
                        kind: spec.kind,
                        durable: spec.durable,
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, args: &QueueDeclare) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        if args.name.is_empty() {
            state.generated += 1;
            let name = format!("amq.gen-{}", state.generated);
            state.queues.insert(
                name.clone(),
                MemQueue {
                    durable: false,
                    auto_delete: true,
                    exclusive_owner: Some(self.connection),
                    arguments: args.arguments.clone(),
                    ready: VecDeque::new(),
                },
            );
            return Ok(name);
        }

        let existing = state
            .queues
            .get(&args.name)
            .map(|q| (q.exclusive_owner, q.durable, q.auto_delete, q.arguments.clone()));
        match existing {
            Some((owner, durable, auto_delete, arguments)) => {
                if let Some(owner) = owner {
                    if owner != self.connection {
                        return Err(BrokerError::Declare(format!(
                            "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                            args.name
                        )));
                    }
                }
                if !args.passive
                    && (durable != args.durable
                        || auto_delete != args.auto_delete
                        || arguments != args.arguments)
                {
                    return Err(BrokerError::Declare(format!(
                        "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                        args.name
                    )));
                }
                Ok(args.name.clone())
            }
            None if args.passive => Err(BrokerError::Declare(format!(
                "NOT_FOUND - no queue '{}'",
                args.name
            ))),
            None => {
                state.queues.insert(
                    args.name.clone(),
                    MemQueue {
                        durable: args.durable,
                        auto_delete: args.auto_delete,
                        exclusive_owner: args.exclusive.then_some(self.connection),
                        arguments: args.arguments.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(args.name.clone())
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Declare(format!("NOT_FOUND - no queue '{queue}'")));
        }
        if exchange.is_empty() || !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Declare(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        let binding = (queue.to_string(), exchange.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn qos(&self, _prefetch: u16) -> Result<(), BrokerError> {
        self.ensure_open()
    }

    async fn consume(
        &self,
        queue: &str,
        _opts: &ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        if !self.broker.has_queue(queue) {
            return Err(BrokerError::Consume(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let stream = futures::stream::unfold(
            (
                self.broker.clone(),
                queue.to_string(),
                self.id,
                self.closed.clone(),
            ),
            |(broker, queue, channel, closed)| async move {
                let delivery = broker.next_delivery(&queue, channel, &closed).await?;
                Some((Ok(delivery), (broker, queue, channel, closed)))
            },
        );
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.unacked.get(&delivery_tag) {
            Some(u) if u.channel == self.id => {
                state.unacked.remove(&delivery_tag);
                state.journal.push(Op::Ack { tag: delivery_tag });
                Ok(())
            }
            _ => Err(BrokerError::Ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let owned = matches!(state.unacked.get(&delivery_tag), Some(u) if u.channel == self.id);
        if !owned {
            return Err(BrokerError::Ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        }
        if let Some(u) = state.unacked.remove(&delivery_tag) {
            if requeue {
                state.requeue_front(&u.queue, u.stored);
            }
        }
        state.journal.push(Op::Nack {
            tag: delivery_tag,
            requeue,
        });
        drop(state);
        if requeue {
            self.broker.notify.notify_waiters();
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(BrokerError::Publish("channel closed by broker".into()));
        }
        state.route(exchange, routing_key, message)?;
        state.journal.push(Op::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut state = self.broker.lock();
        state.release_channels(&[self.id]);
        state.channels.remove(&self.id);
        drop(state);
        self.broker.notify.notify_waiters();
    }
}
