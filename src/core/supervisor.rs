//! # Connection supervisor: dial, serve, back off, repeat.
//!
//! The [`ConnectionSupervisor`] owns the broker link. Each loop iteration is one
//! *epoch*: dial, open a channel, hand it to the [`EpochHandler`], close both.
//!
//! ```text
//! loop {
//!   ├─► publish Connecting
//!   ├─► Broker::connect(url) ──Err──► ConnectFailed ──► Failed
//!   │       (attempt counter resets on success)
//!   ├─► open_channel()      ──Err──► Failed
//!   ├─► publish Connected; spawn close-watcher (token ⇒ close channel + connection)
//!   ├─► EpochHandler::serve(channel, token) ──► Outcome
//!   ├─► close channel + connection; publish EpochEnded
//!   └─► match outcome {
//!         StopCleanly          ⇒ return Ok(())
//!         ContinueAfterBackoff ⇒ wait, reconnect
//!         Failed(e)            ⇒ reconnect disabled ? Err(e) : wait, reconnect
//!       }
//! }
//! ```
//!
//! ## Rules
//! - The wait before the next dial is `BackoffPolicy::next(attempt)`, where
//!   `attempt` counts epochs since the last successful dial.
//! - Cancellation aborts the wait (or a dial) immediately, force-closes a live
//!   channel, and makes `run` return `Ok(())`.
//! - Channel and connection are closed on every path out of an epoch.

use std::sync::Arc;
use std::time::Duration;

use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerConnection, SharedChannel};
use crate::config::ConnectionConfig;
use crate::core::epoch::{EpochHandler, Outcome};
use crate::error::SupervisorError;
use crate::events::{Bus, Event, EventKind};
use crate::policies::BackoffPolicy;

/// Keeps one broker connection alive across failures.
pub struct ConnectionSupervisor<B: Broker> {
    broker: B,
    url: String,
    backoff: BackoffPolicy,
    reconnect_disabled: bool,
    bus: Bus,
}

impl<B: Broker> ConnectionSupervisor<B> {
    /// Supervisor with the default fixed 10s reconnect interval.
    pub fn new(broker: B, url: impl Into<String>) -> Self {
        Self {
            broker,
            url: url.into(),
            backoff: BackoffPolicy::default(),
            reconnect_disabled: false,
            bus: Bus::default(),
        }
    }

    /// Supervisor configured from a [`ConnectionConfig`].
    pub fn from_config(broker: B, cfg: &ConnectionConfig) -> Self {
        Self::new(broker, cfg.url.clone())
            .with_backoff(cfg.reconnect.backoff())
            .reconnect_disabled(cfg.reconnect.disabled)
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// When set, a failed epoch ends supervision with an error instead of reconnecting.
    pub fn reconnect_disabled(mut self, disabled: bool) -> Self {
        self.reconnect_disabled = disabled;
        self
    }

    /// Publishes lifecycle events to `bus` instead of a private one.
    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = bus;
        self
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Runs epochs until the handler stops cleanly, the token is cancelled, or
    /// an epoch fails with reconnection disabled.
    pub async fn run(
        &self,
        handler: &dyn EpochHandler,
        token: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let mut attempt: u32 = 0;
        let mut epoch: u64 = 0;

        let result = loop {
            if token.is_cancelled() {
                break Ok(());
            }
            epoch += 1;

            let outcome = self.run_epoch(handler, epoch, &mut attempt, &token).await;
            if token.is_cancelled() {
                break Ok(());
            }

            let reason = match outcome {
                Outcome::StopCleanly => break Ok(()),
                Outcome::ContinueAfterBackoff => "restart requested".to_string(),
                Outcome::Failed(e) if self.reconnect_disabled => {
                    warn!(epoch, err = %e, label = e.as_label(), "epoch failed; reconnect disabled");
                    break Err(SupervisorError::Epoch(e));
                }
                Outcome::Failed(e) => {
                    warn!(epoch, err = %e, label = e.as_label(), "epoch failed");
                    e.to_string()
                }
            };

            let delay = self.backoff.next(attempt);
            attempt = attempt.saturating_add(1);
            info!(epoch, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            self.bus.publish(
                Event::new(EventKind::BackoffScheduled)
                    .with_epoch(epoch)
                    .with_attempt(attempt)
                    .with_delay(delay)
                    .with_reason(reason),
            );

            if !self.wait(delay, &token).await {
                break Ok(());
            }
        };

        if token.is_cancelled() {
            self.bus.publish(Event::new(EventKind::ShutdownRequested).with_epoch(epoch));
        }
        let mut stopped = Event::new(EventKind::SupervisorStopped).with_epoch(epoch);
        if let Err(e) = &result {
            stopped = stopped.with_reason(e.to_string());
        }
        self.bus.publish(stopped);
        result
    }

    /// One dial/serve/close cycle.
    async fn run_epoch(
        &self,
        handler: &dyn EpochHandler,
        epoch: u64,
        attempt: &mut u32,
        token: &CancellationToken,
    ) -> Outcome {
        self.bus
            .publish(Event::new(EventKind::Connecting).with_epoch(epoch).with_attempt(*attempt + 1));

        let dialed = select! {
            res = self.broker.connect(&self.url) => res,
            _ = token.cancelled() => return Outcome::StopCleanly,
        };
        let conn: Arc<dyn BrokerConnection> = match dialed {
            Ok(conn) => Arc::from(conn),
            Err(e) => {
                self.bus.publish(
                    Event::new(EventKind::ConnectFailed)
                        .with_epoch(epoch)
                        .with_reason(e.to_string()),
                );
                return Outcome::Failed(e.into());
            }
        };
        *attempt = 0;

        let channel = match conn.open_channel().await {
            Ok(ch) => SharedChannel::new(ch),
            Err(e) => {
                conn.close().await;
                self.bus.publish(
                    Event::new(EventKind::ConnectFailed)
                        .with_epoch(epoch)
                        .with_reason(e.to_string()),
                );
                return Outcome::Failed(e.into());
            }
        };
        info!(epoch, "connected");
        self.bus.publish(Event::new(EventKind::Connected).with_epoch(epoch));

        let served = CancellationToken::new();
        let watcher = tokio::spawn(close_on_cancel(
            token.clone(),
            served.clone(),
            channel.clone(),
            Arc::clone(&conn),
        ));

        let outcome = handler.serve(channel.clone(), token).await;

        served.cancel();
        if let Err(e) = watcher.await {
            debug!(err = %e, "close watcher ended abnormally");
        }
        channel.close().await;
        conn.close().await;

        let mut ended = Event::new(EventKind::EpochEnded).with_epoch(epoch);
        if let Outcome::Failed(e) = &outcome {
            ended = ended.with_reason(e.to_string());
        }
        self.bus.publish(ended);
        outcome
    }

    /// Sleeps for `delay`; returns `false` if cancelled first.
    async fn wait(&self, delay: Duration, token: &CancellationToken) -> bool {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        select! {
            _ = &mut sleep => true,
            _ = token.cancelled() => false,
        }
    }
}

/// Force-closes the epoch's channel and connection when `token` fires before `served`.
async fn close_on_cancel(
    token: CancellationToken,
    served: CancellationToken,
    channel: SharedChannel,
    conn: Arc<dyn BrokerConnection>,
) {
    select! {
        _ = token.cancelled() => {
            debug!("cancelled; closing channel");
            channel.close().await;
            conn.close().await;
        }
        _ = served.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::time::Instant;

    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{ConsumeOptions, OutboundMessage};
    use crate::error::{BrokerError, EpochError};
    use crate::policies::JitterPolicy;
    use crate::topology::{Provisioner, QueueRef, QueueSpec, TopologySpec};

    const INTERVAL: Duration = Duration::from_secs(10);

    fn supervisor(broker: &MemoryBroker) -> ConnectionSupervisor<MemoryBroker> {
        ConnectionSupervisor::new(broker.clone(), "amqp://test")
            .with_backoff(BackoffPolicy::fixed(INTERVAL))
    }

    /// Returns the scripted outcomes in order, then `StopCleanly`.
    struct Scripted {
        outcomes: Mutex<Vec<Outcome>>,
        served: Mutex<u32>,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<Outcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                served: Mutex::new(0),
            }
        }

        fn served(&self) -> u32 {
            *self.served.lock().unwrap()
        }
    }

    #[async_trait]
    impl EpochHandler for Scripted {
        async fn serve(&self, _channel: SharedChannel, _token: &CancellationToken) -> Outcome {
            *self.served.lock().unwrap() += 1;
            self.outcomes.lock().unwrap().pop().unwrap_or(Outcome::StopCleanly)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_failures_wait_interval_then_succeed() {
        let broker = MemoryBroker::new();
        broker.fail_next_dials(3);
        let sup = supervisor(&broker);
        let mut rx = sup.bus().subscribe();
        let handler = Scripted::new(vec![]);

        let start = Instant::now();
        sup.run(&handler, CancellationToken::new()).await.unwrap();

        assert_eq!(broker.dial_count(), 4);
        assert_eq!(handler.served(), 1);
        assert_eq!(start.elapsed(), INTERVAL * 3);

        let mut backoffs = 0;
        while let Ok(ev) = rx.try_recv() {
            if ev.kind == EventKind::BackoffScheduled {
                backoffs += 1;
                assert_eq!(ev.delay_ms, Some(10_000));
            }
        }
        assert_eq!(backoffs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_resets_after_successful_dial() {
        let broker = MemoryBroker::new();
        broker.fail_next_dials(2);
        let sup = ConnectionSupervisor::new(broker.clone(), "amqp://test").with_backoff(BackoffPolicy {
            first: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: JitterPolicy::None,
        });
        let handler = Scripted::new(vec![Outcome::Failed(EpochError::ConsumerClosed {
            queue: "q".into(),
        })]);

        let start = Instant::now();
        sup.run(&handler, CancellationToken::new()).await.unwrap();

        // 1s + 2s for the dial failures, then 1s again after the failed (but connected) epoch.
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(handler.served(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_returns_ok() {
        let broker = MemoryBroker::new();
        broker.fail_next_dials(u32::MAX);
        let sup = supervisor(&broker);
        let handler = Scripted::new(vec![]);
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                time::sleep(Duration::from_secs(25)).await;
                token.cancel();
            })
        };

        let start = Instant::now();
        sup.run(&handler, token).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(25));
        assert_eq!(broker.dial_count(), 3);
        assert_eq!(handler.served(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_reconnect_returns_error() {
        let broker = MemoryBroker::new();
        broker.fail_next_dials(1);
        let sup = supervisor(&broker).reconnect_disabled(true);

        let err = sup
            .run(&Scripted::new(vec![]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.epoch(), EpochError::Broker(BrokerError::Connect(_))));
        assert_eq!(broker.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_reconnects_even_when_disabled() {
        let broker = MemoryBroker::new();
        let sup = supervisor(&broker).reconnect_disabled(true);
        let handler = Scripted::new(vec![Outcome::ContinueAfterBackoff]);

        let start = Instant::now();
        sup.run(&handler, CancellationToken::new()).await.unwrap();
        assert_eq!(broker.dial_count(), 2);
        assert_eq!(start.elapsed(), INTERVAL);
    }

    /// Consumes a queue directly and ignores the token, relying on the close watcher.
    struct Stubborn;

    #[async_trait]
    impl EpochHandler for Stubborn {
        async fn serve(&self, channel: SharedChannel, _token: &CancellationToken) -> Outcome {
            let mut stream = match channel.consume("jobs", &ConsumeOptions::default()).await {
                Ok(s) => s,
                Err(e) => return Outcome::Failed(EpochError::Broker(e)),
            };
            while stream.next().await.is_some() {}
            Outcome::Failed(EpochError::ConsumerClosed { queue: "jobs".into() })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_force_closes_live_channel() {
        let broker = MemoryBroker::new();
        broker.enqueue("jobs", OutboundMessage::new("y"));
        let sup = supervisor(&broker);
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            })
        };

        sup.run(&Stubborn, token).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(broker.dial_count(), 1);
        // The unacked delivery went back to the queue on close.
        assert_eq!(broker.queue_len("jobs"), 1);
        assert_eq!(broker.unacked_count(), 0);
    }

    /// Provisions a server-named queue and records its name per epoch.
    struct NamesPerEpoch {
        topology: TopologySpec,
        seen: Mutex<Vec<String>>,
        broker: MemoryBroker,
    }

    #[async_trait]
    impl EpochHandler for NamesPerEpoch {
        async fn serve(&self, channel: SharedChannel, _token: &CancellationToken) -> Outcome {
            let provisioned = match Provisioner::new().provision(&channel, &self.topology).await {
                Ok(p) => p,
                Err(e) => return Outcome::Failed(e.into()),
            };
            let name = provisioned
                .resolve(&QueueRef::Declared(0))
                .map(str::to_string)
                .unwrap_or_default();

            let mut seen = self.seen.lock().unwrap();
            if let Some(previous) = seen.last() {
                assert!(!self.broker.has_queue(previous), "stale generated queue survived");
            }
            seen.push(name);
            if seen.len() < 3 {
                Outcome::ContinueAfterBackoff
            } else {
                Outcome::StopCleanly
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_generated_queue_renamed_each_epoch() {
        let broker = MemoryBroker::new();
        let handler = NamesPerEpoch {
            topology: TopologySpec::default().with_queue(QueueSpec::generated()),
            seen: Mutex::new(Vec::new()),
            broker: broker.clone(),
        };

        supervisor(&broker)
            .run(&handler, CancellationToken::new())
            .await
            .unwrap();

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|n| n.starts_with("amq.gen-")));
        assert_ne!(seen[0], seen[1]);
        assert_ne!(seen[1], seen[2]);
    }
}
