//! # Failure strategy.
//!
//! Pure mapping from (handler outcome, delivery, policy) to a [`Decision`]:
//!
//! ```text
//! Success ───────────────► ack  (+ reply with output if reply_to and output replies on)
//! Rejected ──────────────► nack, discard
//! TransportFailure ──────► leave unsettled, halt Fatal
//! HandlerFailure ─┬─ drop ─────► ack
//!                 ├─ restart ──► nack+requeue, halt Restart
//!                 ├─ stop ─────► nack+requeue, halt Stop
//!                 └─ reply ────► ack (+ reply with output and error header if reply_to)
//! ```

use crate::broker::Delivery;
use crate::policies::FailurePolicy;

use super::outcome::{Decision, DispatchOutcome, FinalAction, Halt};
use super::reply::ReplyEnvelope;

/// Decides the settlement of each delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FailureStrategy {
    pub policy: FailurePolicy,
    /// Reply to `reply_to` with the handler output on success.
    pub reply_output: bool,
}

impl FailureStrategy {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            reply_output: false,
        }
    }

    pub fn with_reply_output(mut self, on: bool) -> Self {
        self.reply_output = on;
        self
    }

    pub fn decide(&self, outcome: DispatchOutcome, delivery: &Delivery) -> Decision {
        match outcome {
            DispatchOutcome::Success(output) => match delivery.reply_to() {
                Some(dest) if self.reply_output => Decision::settle(FinalAction::AcknowledgeAndReply(
                    ReplyEnvelope::new(dest, output, delivery.correlation()),
                )),
                _ => Decision::settle(FinalAction::Acknowledge),
            },
            DispatchOutcome::Rejected { .. } => Decision::settle(FinalAction::NegativeAcknowledgeDiscard),
            DispatchOutcome::TransportFailure(reason) => {
                Decision::halting(FinalAction::Abandon, Halt::Fatal { reason })
            }
            DispatchOutcome::HandlerFailure { exit, output } => match self.policy {
                FailurePolicy::Drop => Decision::settle(FinalAction::Acknowledge),
                FailurePolicy::Restart => Decision::halting(
                    FinalAction::NegativeAcknowledgeAndRequeue,
                    Halt::Restart { detail: exit },
                ),
                FailurePolicy::Stop => Decision::halting(
                    FinalAction::NegativeAcknowledgeAndRequeue,
                    Halt::Stop { detail: exit },
                ),
                FailurePolicy::ReplyWithError => match delivery.reply_to() {
                    Some(dest) => Decision::settle(FinalAction::AcknowledgeAndReply(
                        ReplyEnvelope::new(dest, output, delivery.correlation()).with_error(exit),
                    )),
                    None => Decision::settle(FinalAction::Acknowledge),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Properties;

    fn delivery(props: Properties) -> Delivery {
        Delivery {
            delivery_tag: 9,
            exchange: String::new(),
            routing_key: "jobs".into(),
            redelivered: false,
            properties: props,
            body: b"in".to_vec(),
        }
    }

    fn rpc() -> Delivery {
        delivery(
            Properties::default()
                .with_reply_to("amq.gen-1")
                .with_correlation_id("c-1"),
        )
    }

    #[test]
    fn test_success_acks_under_every_policy() {
        for policy in [
            FailurePolicy::Drop,
            FailurePolicy::Restart,
            FailurePolicy::Stop,
            FailurePolicy::ReplyWithError,
        ] {
            let d = FailureStrategy::new(policy).decide(DispatchOutcome::success("ok"), &rpc());
            assert_eq!(d, Decision::settle(FinalAction::Acknowledge), "{policy}");
        }
    }

    #[test]
    fn test_success_replies_output_when_enabled() {
        let d = FailureStrategy::new(FailurePolicy::Drop)
            .with_reply_output(true)
            .decide(DispatchOutcome::success("ok"), &rpc());
        assert_eq!(
            d.action,
            FinalAction::AcknowledgeAndReply(ReplyEnvelope::new("amq.gen-1", "ok", Some("c-1")))
        );
    }

    #[test]
    fn test_restart_and_stop_requeue_and_halt() {
        let fail = || DispatchOutcome::failure("exit status: 1", "");
        let restart = FailureStrategy::new(FailurePolicy::Restart).decide(fail(), &rpc());
        assert_eq!(restart.action, FinalAction::NegativeAcknowledgeAndRequeue);
        assert!(matches!(restart.halt, Some(Halt::Restart { .. })));

        let stop = FailureStrategy::new(FailurePolicy::Stop).decide(fail(), &rpc());
        assert_eq!(stop.action, FinalAction::NegativeAcknowledgeAndRequeue);
        assert_eq!(
            stop.halt,
            Some(Halt::Stop {
                detail: "exit status: 1".into()
            })
        );
    }

    #[test]
    fn test_reply_with_error_carries_output_and_detail() {
        let d = FailureStrategy::new(FailurePolicy::ReplyWithError)
            .decide(DispatchOutcome::failure("exit status: 2", "partial"), &rpc());
        let FinalAction::AcknowledgeAndReply(env) = d.action else {
            panic!("expected reply, got {:?}", d.action);
        };
        assert_eq!(env.destination, "amq.gen-1");
        assert_eq!(env.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(env.body, b"partial");
        assert_eq!(env.error.as_deref(), Some("exit status: 2"));
        assert_eq!(d.halt, None);
    }

    #[test]
    fn test_reply_with_error_without_destination_only_acks() {
        let d = FailureStrategy::new(FailurePolicy::ReplyWithError).decide(
            DispatchOutcome::failure("exit status: 2", ""),
            &delivery(Properties::default()),
        );
        assert_eq!(d, Decision::settle(FinalAction::Acknowledge));
    }

    #[test]
    fn test_transport_failure_is_fatal_and_unsettled() {
        let d = FailureStrategy::new(FailurePolicy::Drop)
            .decide(DispatchOutcome::transport("spawn: not found"), &rpc());
        assert_eq!(d.action, FinalAction::Abandon);
        assert!(matches!(d.halt, Some(Halt::Fatal { .. })));
    }

    #[test]
    fn test_rejected_discards() {
        let d = FailureStrategy::new(FailurePolicy::Restart)
            .decide(DispatchOutcome::rejected("missing header 'to'"), &rpc());
        assert_eq!(d, Decision::settle(FinalAction::NegativeAcknowledgeDiscard));
    }
}
