//! # Declarative topology specification.
//!
//! A [`TopologySpec`] is an ordered list of exchanges, queues and bindings.
//! It is built once (from configuration) and re-applied on every connection
//! epoch by the [`Provisioner`](super::Provisioner).
//!
//! Bindings and the consumer refer to queues through [`QueueRef`], a
//! back-reference into the declared queue list. This matters for queues with an
//! empty name: the broker generates a fresh name on every declaration, and
//! only the epoch's [`ProvisionedTopology`](super::ProvisionedTopology) knows it.
//!
//! ## Example
//! ```rust
//! use rabbitvisor::topology::{BindingSpec, ExchangeSpec, QueueRef, QueueSpec, TopologySpec};
//!
//! let topo = TopologySpec::default()
//!     .with_exchange(ExchangeSpec::topic("amq.topic").passive())
//!     .with_queue(QueueSpec::generated())
//!     .with_binding(BindingSpec::new(QueueRef::Declared(0), "amq.topic", "jobs.#"));
//!
//! assert_eq!(topo.queues.len(), 1);
//! assert!(topo.queues[0].is_generated());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;

/// Exchange routing type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "topic" => Ok(ExchangeKind::Topic),
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(ConfigError::UnknownExchangeKind(other.to_string())),
        }
    }
}

/// Exchange declaration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    /// Assert existence only; never create.
    pub passive: bool,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Self::default()
        }
    }

    /// Durable topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Topic).durable()
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }
}

/// Queue declaration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueSpec {
    /// Empty = server-generated name.
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// RabbitMQ lazy queue mode (`x-queue-mode = lazy`).
    pub lazy: bool,
    /// Assert existence only; never create.
    pub passive: bool,
}

impl QueueSpec {
    /// Durable named queue.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            ..Self::default()
        }
    }

    /// Server-named queue (non-durable, auto-deleted, exclusive).
    pub fn generated() -> Self {
        Self {
            name: String::new(),
            durable: false,
            auto_delete: true,
            exclusive: true,
            ..Self::default()
        }
    }

    pub fn is_generated(&self) -> bool {
        self.name.is_empty()
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }
}

/// Back-reference to a queue.
///
/// Deserializes from a plain string (`"jobs"` → [`QueueRef::Named`]) or from an
/// index table (`{ declared = 0 }` → [`QueueRef::Declared`]).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "QueueRefRepr")]
pub enum QueueRef {
    /// The queue declared at this index of [`TopologySpec::queues`].
    Declared(usize),
    /// A queue by name. If a declared queue has this name it is that queue.
    Named(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueueRefRepr {
    Declared { declared: usize },
    Named(String),
}

impl From<QueueRefRepr> for QueueRef {
    fn from(repr: QueueRefRepr) -> Self {
        match repr {
            QueueRefRepr::Declared { declared } => QueueRef::Declared(declared),
            QueueRefRepr::Named(name) => QueueRef::Named(name),
        }
    }
}

impl QueueRef {
    pub fn named(name: impl Into<String>) -> Self {
        QueueRef::Named(name.into())
    }
}

impl fmt::Display for QueueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueRef::Declared(index) => write!(f, "#{index}"),
            QueueRef::Named(name) => f.write_str(name),
        }
    }
}

/// Queue-to-exchange binding.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BindingSpec {
    pub queue: QueueRef,
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(queue: QueueRef, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            queue,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Ordered topology: exchanges, then queues, then bindings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopologySpec {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl TopologySpec {
    pub fn with_exchange(mut self, spec: ExchangeSpec) -> Self {
        self.exchanges.push(spec);
        self
    }

    pub fn with_queue(mut self, spec: QueueSpec) -> Self {
        self.queues.push(spec);
        self
    }

    pub fn with_binding(mut self, spec: BindingSpec) -> Self {
        self.bindings.push(spec);
        self
    }

    /// Checks that a [`QueueRef::Declared`] index exists and that an empty
    /// [`QueueRef::Named`] points at a generated queue.
    pub fn validate_ref(&self, queue: &QueueRef) -> Result<(), ConfigError> {
        match queue {
            QueueRef::Declared(index) if *index >= self.queues.len() => {
                Err(ConfigError::UnknownQueue(*index))
            }
            QueueRef::Named(name)
                if name.is_empty() && !self.queues.iter().any(QueueSpec::is_generated) =>
            {
                Err(ConfigError::Invalid {
                    field: "queue",
                    reason: "empty name without a generated queue declaration".into(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Validates all bindings' queue references.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for binding in &self.bindings {
            self.validate_ref(&binding.queue)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_parse() {
        assert_eq!("Direct".parse::<ExchangeKind>(), Ok(ExchangeKind::Direct));
        assert_eq!("".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert_eq!(
            "x-delayed".parse::<ExchangeKind>(),
            Err(ConfigError::UnknownExchangeKind("x-delayed".into()))
        );
    }

    #[test]
    fn test_validate_rejects_dangling_reference() {
        let topo = TopologySpec::default()
            .with_queue(QueueSpec::named("jobs"))
            .with_binding(BindingSpec::new(QueueRef::Declared(1), "amq.topic", "#"));
        assert_eq!(topo.validate(), Err(ConfigError::UnknownQueue(1)));
    }

    #[test]
    fn test_validate_empty_name_needs_generated_queue() {
        let binding = BindingSpec::new(QueueRef::named(""), "amq.topic", "#");

        let topo = TopologySpec::default()
            .with_queue(QueueSpec::named("jobs"))
            .with_binding(binding.clone());
        assert!(matches!(
            topo.validate(),
            Err(ConfigError::Invalid { field: "queue", .. })
        ));

        let topo = TopologySpec::default()
            .with_queue(QueueSpec::generated())
            .with_binding(binding);
        assert_eq!(topo.validate(), Ok(()));
    }

    #[test]
    fn test_queue_ref_deserializes_both_forms() {
        let named: QueueRef = serde_json::from_str(r#""jobs""#).unwrap();
        assert_eq!(named, QueueRef::named("jobs"));

        let declared: QueueRef = serde_json::from_str(r#"{"declared": 2}"#).unwrap();
        assert_eq!(declared, QueueRef::Declared(2));
    }
}
