//! Declarative topology: what to declare, and the provisioner that declares it.
//!
//! - [`TopologySpec`] exchanges, queues and bindings, in declaration order
//! - [`Provisioner`] applies a spec on a channel, once per epoch
//! - [`ProvisionedTopology`] the epoch's realized queue names

mod provisioner;
mod spec;

pub use provisioner::{ProvisionedTopology, Provisioner, QUEUE_MODE_ARG};
pub use spec::{BindingSpec, ExchangeKind, ExchangeSpec, QueueRef, QueueSpec, TopologySpec};
