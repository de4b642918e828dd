//! # Failure policies for handler errors.
//!
//! [`FailurePolicy`] decides what happens to a delivery whose handler reported a
//! failure (non-zero exit, non-2xx response, ...). Successful deliveries are
//! always acknowledged, whatever the policy.
//!
//! | policy    | delivery               | consumption                          |
//! |-----------|------------------------|--------------------------------------|
//! | `drop`    | ack                    | continues                            |
//! | `restart` | nack + requeue         | halts, supervisor restarts the epoch |
//! | `stop`    | nack + requeue         | halts permanently                    |
//! | `reply`   | ack + error reply      | continues                            |

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;

/// What to do with a delivery whose handler failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Acknowledge and move on (the failure is logged).
    #[default]
    Drop,
    /// Requeue the message and restart the connection epoch.
    Restart,
    /// Requeue the message and stop consuming.
    Stop,
    /// Acknowledge and send the failure back to the message's `reply_to`.
    #[serde(rename = "reply", alias = "reply-with-error", alias = "reply_with_error")]
    ReplyWithError,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Drop => "drop",
            FailurePolicy::Restart => "restart",
            FailurePolicy::Stop => "stop",
            FailurePolicy::ReplyWithError => "reply",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(FailurePolicy::Drop),
            "restart" => Ok(FailurePolicy::Restart),
            "stop" => Ok(FailurePolicy::Stop),
            "reply" | "reply-with-error" | "reply_with_error" => Ok(FailurePolicy::ReplyWithError),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_policies() {
        assert_eq!("drop".parse(), Ok(FailurePolicy::Drop));
        assert_eq!("RESTART".parse(), Ok(FailurePolicy::Restart));
        assert_eq!(" stop ".parse(), Ok(FailurePolicy::Stop));
        assert_eq!("reply".parse(), Ok(FailurePolicy::ReplyWithError));
        assert_eq!("reply-with-error".parse(), Ok(FailurePolicy::ReplyWithError));
    }

    #[test]
    fn test_unknown_policy_is_config_error() {
        assert_eq!(
            "retry-forever".parse::<FailurePolicy>(),
            Err(ConfigError::UnknownPolicy("retry-forever".into()))
        );
    }

    #[test]
    fn test_deserialize_alias() {
        let p: FailurePolicy = serde_json::from_str(r#""reply-with-error""#).unwrap();
        assert_eq!(p, FailurePolicy::ReplyWithError);
        assert_eq!(p.to_string(), "reply");
    }
}
