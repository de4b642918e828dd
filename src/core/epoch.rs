//! # One connection epoch.
//!
//! An epoch is the life of one connection/channel pair. The supervisor dials,
//! opens the channel and hands it to an [`EpochHandler`], which reports how the
//! epoch ended through an [`Outcome`]:
//!
//! ```text
//! StopCleanly           ──► supervisor returns Ok(())
//! ContinueAfterBackoff  ──► close, wait, reconnect
//! Failed(err)           ──► close; retry after backoff, or Err if reconnect is disabled
//! ```
//!
//! [`BridgeEpoch`] is the standard handler: provision topology, then consume
//! the configured queue with a [`DispatchEngine`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::SharedChannel;
use crate::dispatch::{DispatchEngine, EngineExit, Halt};
use crate::error::EpochError;
use crate::topology::{Provisioner, QueueRef, TopologySpec};

/// How one epoch ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Reconnect after the backoff wait, regardless of the reconnect setting.
    ContinueAfterBackoff,
    /// Work is done; supervision ends successfully.
    StopCleanly,
    /// The epoch failed.
    Failed(EpochError),
}

/// Work performed on each freshly opened channel.
#[async_trait]
pub trait EpochHandler: Send + Sync {
    /// Uses `channel` until done, halted, failed or cancelled.
    ///
    /// The supervisor closes the channel and its connection after this returns.
    async fn serve(&self, channel: SharedChannel, token: &CancellationToken) -> Outcome;
}

/// Provision-then-consume epoch.
#[derive(Clone)]
pub struct BridgeEpoch {
    provisioner: Provisioner,
    topology: TopologySpec,
    queue: QueueRef,
    engine: DispatchEngine,
}

impl BridgeEpoch {
    pub fn new(
        provisioner: Provisioner,
        topology: TopologySpec,
        queue: QueueRef,
        engine: DispatchEngine,
    ) -> Self {
        Self {
            provisioner,
            topology,
            queue,
            engine,
        }
    }
}

#[async_trait]
impl EpochHandler for BridgeEpoch {
    async fn serve(&self, channel: SharedChannel, token: &CancellationToken) -> Outcome {
        let provisioned = match self.provisioner.provision(&channel, &self.topology).await {
            Ok(p) => p,
            Err(e) => return Outcome::Failed(e.into()),
        };
        let queue = match provisioned.resolve(&self.queue) {
            Ok(q) => q.to_string(),
            Err(e) => return Outcome::Failed(e.into()),
        };

        let exit = self.engine.consume(&channel, &queue, token).await;
        outcome_of(exit, queue)
    }
}

fn outcome_of(exit: EngineExit, queue: String) -> Outcome {
    match exit {
        EngineExit::Cancelled | EngineExit::Completed => Outcome::StopCleanly,
        EngineExit::Halted(Halt::Restart { detail }) => {
            info!(queue = %queue, %detail, "restarting consumption");
            Outcome::ContinueAfterBackoff
        }
        EngineExit::Halted(halt) => {
            warn!(queue = %queue, detail = halt.detail(), "consumption halted");
            Outcome::Failed(EpochError::Stopped {
                detail: halt.detail().to_string(),
            })
        }
        EngineExit::StreamClosed => Outcome::Failed(EpochError::ConsumerClosed { queue }),
        EngineExit::Failed(e) => Outcome::Failed(e.into()),
    }
}
