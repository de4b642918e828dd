//! # Topology provisioner.
//!
//! Applies a [`TopologySpec`] on a channel: exchanges, then queues, then
//! bindings, stopping at the first refusal. Applied on every epoch; the broker
//! treats equivalent re-declarations as no-ops, so provisioning is idempotent.
//!
//! Queue declaration rules:
//! - empty name ⇒ non-durable, auto-deleted, exclusive, whatever the spec says;
//! - `lazy` ⇒ argument `x-queue-mode = "lazy"` (omitted otherwise);
//! - `passive` ⇒ assert existence only.

use tracing::{debug, info};

use crate::broker::{FieldTable, FieldValue, QueueDeclare, SharedChannel};
use crate::error::TopologyError;
use crate::events::{Bus, Event, EventKind};

use super::spec::{QueueRef, QueueSpec, TopologySpec};

/// Header argument selecting RabbitMQ's lazy queue mode.
pub const QUEUE_MODE_ARG: &str = "x-queue-mode";

/// Realized queue names of one epoch, index-aligned with [`TopologySpec::queues`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvisionedTopology {
    declared: Vec<String>,
    names: Vec<String>,
}

impl ProvisionedTopology {
    /// Resolves a queue reference to this epoch's name.
    ///
    /// A [`QueueRef::Named`] matching a declared spec name resolves to the first
    /// such queue's realized name, so `""` means this epoch's generated queue.
    /// Other names pass through unchanged.
    pub fn resolve<'a>(&'a self, queue: &'a QueueRef) -> Result<&'a str, TopologyError> {
        match queue {
            QueueRef::Declared(index) => self
                .names
                .get(*index)
                .map(String::as_str)
                .ok_or(TopologyError::UnknownQueue(*index)),
            QueueRef::Named(name) => Ok(self
                .declared
                .iter()
                .position(|declared| declared == name)
                .and_then(|index| self.names.get(index))
                .unwrap_or(name)
                .as_str()),
        }
    }

    /// Realized names in declaration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Declares topology on a channel.
#[derive(Clone, Debug, Default)]
pub struct Provisioner {
    bus: Option<Bus>,
}

impl Provisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes [`EventKind::TopologyDeclared`] after each successful run.
    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Declares every exchange, queue and binding of `spec`, in that order.
    pub async fn provision(
        &self,
        channel: &SharedChannel,
        spec: &TopologySpec,
    ) -> Result<ProvisionedTopology, TopologyError> {
        for exchange in &spec.exchanges {
            channel
                .exchange_declare(exchange)
                .await
                .map_err(|source| TopologyError::Exchange {
                    name: exchange.name.clone(),
                    source,
                })?;
            debug!(exchange = %exchange.name, kind = %exchange.kind, passive = exchange.passive, "exchange declared");
        }

        let mut names = Vec::with_capacity(spec.queues.len());
        for queue in &spec.queues {
            let args = declare_args(queue);
            let name = channel
                .queue_declare(&args)
                .await
                .map_err(|source| TopologyError::Queue {
                    name: queue.name.clone(),
                    source,
                })?;
            debug!(queue = %name, durable = args.durable, exclusive = args.exclusive, "queue declared");
            names.push(name);
        }

        let provisioned = ProvisionedTopology {
            declared: spec.queues.iter().map(|q| q.name.clone()).collect(),
            names,
        };

        for binding in &spec.bindings {
            let queue = provisioned.resolve(&binding.queue)?;
            channel
                .queue_bind(queue, &binding.exchange, &binding.routing_key)
                .await
                .map_err(|source| TopologyError::Binding {
                    queue: queue.to_string(),
                    exchange: binding.exchange.clone(),
                    routing_key: binding.routing_key.clone(),
                    source,
                })?;
            debug!(queue, exchange = %binding.exchange, routing_key = %binding.routing_key, "queue bound");
        }

        info!(
            exchanges = spec.exchanges.len(),
            queues = spec.queues.len(),
            bindings = spec.bindings.len(),
            "topology provisioned"
        );
        if let Some(bus) = &self.bus {
            let mut ev = Event::new(EventKind::TopologyDeclared);
            if let Some(first) = provisioned.names.first() {
                ev = ev.with_queue(first.as_str());
            }
            bus.publish(ev);
        }
        Ok(provisioned)
    }
}

fn declare_args(queue: &QueueSpec) -> QueueDeclare {
    let mut arguments = FieldTable::new();
    if queue.lazy {
        arguments.insert(QUEUE_MODE_ARG.to_string(), FieldValue::from("lazy"));
    }
    if queue.is_generated() {
        QueueDeclare {
            name: String::new(),
            durable: false,
            auto_delete: true,
            exclusive: true,
            passive: false,
            arguments,
        }
    } else {
        QueueDeclare {
            name: queue.name.clone(),
            durable: queue.durable,
            auto_delete: queue.auto_delete,
            exclusive: queue.exclusive,
            passive: queue.passive,
            arguments,
        }
    }
}
