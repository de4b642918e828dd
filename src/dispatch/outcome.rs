//! Handler outcomes and the decisions derived from them.

use super::reply::ReplyEnvelope;

/// What a handler reports for one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded; `output` is its result (stdout, response body, ...).
    Success(Vec<u8>),
    /// Handler ran and failed. `exit` describes the failure
    /// (`exit status: 3`, `HTTP 503`, ...), `output` is whatever it produced.
    HandlerFailure { exit: String, output: Vec<u8> },
    /// The handler could not run at all (spawn failure, lost backend).
    /// Fatal to the channel: the delivery is left unsettled.
    TransportFailure(String),
    /// The message itself is unacceptable (missing required headers, ...).
    Rejected { reason: String },
}

impl DispatchOutcome {
    pub fn success(output: impl Into<Vec<u8>>) -> Self {
        DispatchOutcome::Success(output.into())
    }

    pub fn failure(exit: impl Into<String>, output: impl Into<Vec<u8>>) -> Self {
        DispatchOutcome::HandlerFailure {
            exit: exit.into(),
            output: output.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        DispatchOutcome::TransportFailure(reason.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        DispatchOutcome::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Success(_))
    }

    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchOutcome::Success(_) => "success",
            DispatchOutcome::HandlerFailure { .. } => "handler_failure",
            DispatchOutcome::TransportFailure(_) => "transport_failure",
            DispatchOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// Terminal settlement of a delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalAction {
    Acknowledge,
    /// Acknowledge, then publish the envelope.
    AcknowledgeAndReply(ReplyEnvelope),
    NegativeAcknowledgeAndRequeue,
    NegativeAcknowledgeDiscard,
    /// Leave unsettled; the channel is torn down.
    Abandon,
}

/// Why consumption must stop after the current delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Halt {
    /// Restart the connection epoch.
    Restart { detail: String },
    /// Stop consuming for good.
    Stop { detail: String },
    /// The handler's transport failed; the channel is unusable.
    Fatal { reason: String },
}

impl Halt {
    pub fn detail(&self) -> &str {
        match self {
            Halt::Restart { detail } | Halt::Stop { detail } => detail,
            Halt::Fatal { reason } => reason,
        }
    }
}

/// Settlement plus an optional halt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub action: FinalAction,
    pub halt: Option<Halt>,
}

impl Decision {
    pub fn settle(action: FinalAction) -> Self {
        Self { action, halt: None }
    }

    pub fn halting(action: FinalAction, halt: Halt) -> Self {
        Self {
            action,
            halt: Some(halt),
        }
    }
}
