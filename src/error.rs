//! Error types used by the supervisor, the provisioner and the dispatch engine.
//!
//! The taxonomy follows the failure classes the runtime reacts to:
//!
//! - [`BrokerError`]: a broker operation failed (dial, channel, declare, ack, publish).
//! - [`TopologyError`]: provisioning of exchanges, queues or bindings failed.
//! - [`DispatchError`]: the consume loop cannot continue on this channel.
//! - [`SupervisorError`]: the supervisor gave up (reconnection disabled or a stop was requested).
//! - [`ConfigError`]: invalid configuration, detected once at startup.
//!
//! Every enum provides `as_label()`, a short stable snake_case label for logs.

use thiserror::Error;

/// # Errors produced by a broker backend.
///
/// From the supervisor's perspective each of them means the current connection
/// epoch is no longer usable.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Dialing the broker failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Opening (or using) a channel failed.
    #[error("channel error: {0}")]
    Channel(String),

    /// Exchange/queue declaration or queue binding was refused.
    #[error("declare failed: {0}")]
    Declare(String),

    /// `basic.consume` was refused.
    #[error("consume failed: {0}")]
    Consume(String),

    /// `basic.ack` / `basic.nack` failed.
    #[error("acknowledge failed: {0}")]
    Ack(String),

    /// `basic.publish` failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The channel or connection is already closed.
    #[error("channel closed")]
    Closed,
}

impl BrokerError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use rabbitvisor::BrokerError;
    ///
    /// assert_eq!(BrokerError::Closed.as_label(), "broker_closed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::Connect(_) => "broker_connect",
            BrokerError::Channel(_) => "broker_channel",
            BrokerError::Declare(_) => "broker_declare",
            BrokerError::Consume(_) => "broker_consume",
            BrokerError::Ack(_) => "broker_ack",
            BrokerError::Publish(_) => "broker_publish",
            BrokerError::Closed => "broker_closed",
        }
    }
}

/// # Errors produced while provisioning topology.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Exchange declaration failed.
    #[error("exchange '{name}': {source}")]
    Exchange {
        name: String,
        #[source]
        source: BrokerError,
    },

    /// Queue declaration failed.
    #[error("queue '{name}': {source}")]
    Queue {
        name: String,
        #[source]
        source: BrokerError,
    },

    /// Queue binding failed.
    #[error("binding {queue} -> {exchange} ({routing_key}): {source}")]
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
        #[source]
        source: BrokerError,
    },

    /// A queue reference points outside the declared queue list.
    #[error("queue reference #{0} is not declared")]
    UnknownQueue(usize),
}

impl TopologyError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TopologyError::Exchange { .. } => "topology_exchange",
            TopologyError::Queue { .. } => "topology_queue",
            TopologyError::Binding { .. } => "topology_binding",
            TopologyError::UnknownQueue(_) => "topology_unknown_queue",
        }
    }
}

/// # Errors that end the consume loop of one epoch.
///
/// All of them are fatal to the channel: nothing is acknowledged after one of
/// these is raised and the supervisor reconnects.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Subscribing to the queue failed.
    #[error("subscribe to '{queue}' failed: {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: BrokerError,
    },

    /// The delivery stream yielded an error.
    #[error("delivery stream failed: {0}")]
    Stream(#[source] BrokerError),

    /// The handler could not run at all.
    #[error("handler '{handler}' could not run: {reason}")]
    Transport { handler: String, reason: String },

    /// Terminal ack/nack failed.
    #[error("acknowledge of delivery {tag} failed: {source}")]
    Ack {
        tag: u64,
        #[source]
        source: BrokerError,
    },

    /// Reply publication failed.
    #[error("reply to '{destination}' failed: {source}")]
    Reply {
        destination: String,
        #[source]
        source: BrokerError,
    },

    /// A worker task panicked or was aborted.
    #[error("worker {worker} aborted: {reason}")]
    Worker { worker: usize, reason: String },
}

impl DispatchError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchError::Subscribe { .. } => "dispatch_subscribe",
            DispatchError::Stream(_) => "dispatch_stream",
            DispatchError::Transport { .. } => "dispatch_transport",
            DispatchError::Ack { .. } => "dispatch_ack",
            DispatchError::Reply { .. } => "dispatch_reply",
            DispatchError::Worker { .. } => "dispatch_worker",
        }
    }
}

/// # Reasons an epoch ended unsuccessfully.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EpochError {
    /// Dial or channel-open failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Topology could not be provisioned.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// The consume loop failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The broker closed the delivery stream.
    #[error("consumer on '{queue}' was closed by the broker")]
    ConsumerClosed { queue: String },

    /// Consumption halted permanently by the `stop` failure policy.
    #[error("consumption stopped after handler failure: {detail}")]
    Stopped { detail: String },
}

impl EpochError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            EpochError::Broker(e) => e.as_label(),
            EpochError::Topology(e) => e.as_label(),
            EpochError::Dispatch(e) => e.as_label(),
            EpochError::ConsumerClosed { .. } => "epoch_consumer_closed",
            EpochError::Stopped { .. } => "epoch_stopped",
        }
    }
}

/// # Errors surfaced by the connection supervisor to its caller.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// The epoch failed and reconnection is disabled.
    #[error("epoch failed and reconnection is disabled: {0}")]
    Epoch(#[from] EpochError),
}

impl SupervisorError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::Epoch(e) => e.as_label(),
        }
    }

    /// Returns the epoch error that ended supervision.
    pub fn epoch(&self) -> &EpochError {
        match self {
            SupervisorError::Epoch(e) => e,
        }
    }
}

/// # Configuration errors.
///
/// Raised at startup, never at dispatch time.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Failure policy string is not recognized.
    #[error("unknown failure policy '{0}' (expected drop, restart, stop or reply)")]
    UnknownPolicy(String),

    /// Exchange kind string is not recognized.
    #[error("unknown exchange kind '{0}' (expected topic, direct, fanout or headers)")]
    UnknownExchangeKind(String),

    /// Broker URL is empty.
    #[error("broker url is empty")]
    MissingUrl,

    /// Worker count must be positive.
    #[error("worker count must be at least 1")]
    NoWorkers,

    /// The consumer queue cannot be resolved against the topology.
    #[error("consumer queue is not set and the topology declares no queue")]
    MissingQueue,

    /// A queue reference points outside the declared queue list.
    #[error("queue reference #{0} is not declared")]
    UnknownQueue(usize),

    /// Generic invalid value.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::UnknownPolicy(_) => "config_unknown_policy",
            ConfigError::UnknownExchangeKind(_) => "config_unknown_exchange_kind",
            ConfigError::MissingUrl => "config_missing_url",
            ConfigError::NoWorkers => "config_no_workers",
            ConfigError::MissingQueue => "config_missing_queue",
            ConfigError::UnknownQueue(_) => "config_unknown_queue",
            ConfigError::Invalid { .. } => "config_invalid",
        }
    }
}

/// # Mail errors.
///
/// Raised while building a [`Mail`](crate::handlers::Mail) from a delivery or
/// by a [`Mailer`](crate::handlers::Mailer). Permanent errors reject the
/// message; the others go through the failure policy.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailError {
    /// A required header is absent.
    #[error("missing `{0}` header")]
    MissingHeader(&'static str),

    /// A header has the wrong type.
    #[error("`{header}` {reason}")]
    InvalidHeader { header: &'static str, reason: String },

    /// The recipient list is empty after trimming.
    #[error("no recipients")]
    NoRecipients,

    /// The mail service refused the mail for good.
    #[error("mail refused: {0}")]
    Refused(String),

    /// The mail service could not be reached or deferred the mail.
    #[error("mail service unavailable: {0}")]
    Unavailable(String),
}

impl MailError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            MailError::MissingHeader(_) => "mail_missing_header",
            MailError::InvalidHeader { .. } => "mail_invalid_header",
            MailError::NoRecipients => "mail_no_recipients",
            MailError::Refused(_) => "mail_refused",
            MailError::Unavailable(_) => "mail_unavailable",
        }
    }

    /// True when retrying the same message cannot succeed.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, MailError::Unavailable(_))
    }
}
