//! # Reconnect backoff.
//!
//! [`BackoffPolicy`] computes how long the supervisor waits before dialing again
//! after a failed connection epoch:
//! - [`BackoffPolicy::first`] the wait after the first failure (the reconnect interval);
//! - [`BackoffPolicy::factor`] growth per consecutive failure (`1.0` keeps it fixed);
//! - [`BackoffPolicy::max`] the cap.
//!
//! The wait for failure `n` (0-indexed) is `first × factor^n`, clamped to `max`,
//! then jittered. The base is derived from `n` alone, so jitter never compounds.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use rabbitvisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_secs(1),
//!     max: Duration::from_secs(8),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_secs(1));
//! assert_eq!(backoff.next(2), Duration::from_secs(4));
//! assert_eq!(backoff.next(6), Duration::from_secs(8));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Reconnect wait policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Wait after the first failed epoch.
    pub first: Duration,
    /// Upper bound for any wait.
    pub max: Duration,
    /// Multiplicative growth factor per consecutive failure.
    pub factor: f64,
    /// Randomization applied to the computed wait.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Fixed 10s wait, no jitter.
    fn default() -> Self {
        Self::fixed(Duration::from_secs(10))
    }
}

impl BackoffPolicy {
    /// Constant wait of `interval` on every retry.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            first: interval,
            max: interval,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Computes the wait before the retry following `attempt` consecutive failures (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !unclamped.is_finite() || unclamped < 0.0 || unclamped > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped)
        };

        match self.jitter {
            JitterPolicy::Decorrelated => {
                self.jitter
                    .apply_decorrelated(self.first.min(self.max), base, self.max)
            }
            _ => self.jitter.apply(base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fixed_ten_seconds() {
        let policy = BackoffPolicy::default();
        for attempt in [0, 1, 5, 50] {
            assert_eq!(policy.next(attempt), Duration::from_secs(10));
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(500),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: JitterPolicy::None,
        };
        assert_eq!(policy.next(0), Duration::from_millis(500));
        assert_eq!(policy.next(1), Duration::from_secs(1));
        assert_eq!(policy.next(3), Duration::from_secs(4));
        assert_eq!(policy.next(4), Duration::from_secs(5));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_first_above_max_clamps() {
        let policy = BackoffPolicy {
            first: Duration::from_secs(30),
            max: Duration::from_secs(5),
            factor: 1.0,
            jitter: JitterPolicy::None,
        };
        assert_eq!(policy.next(0), Duration::from_secs(5));
    }

    #[test]
    fn test_equal_jitter_stays_in_upper_half() {
        let policy = BackoffPolicy {
            jitter: JitterPolicy::Equal,
            ..BackoffPolicy::fixed(Duration::from_secs(2))
        };
        for attempt in 0..40 {
            let d = policy.next(attempt);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2), "{d:?}");
        }
    }

    #[test]
    fn test_decorrelated_jitter_respects_floor_and_cap() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(200),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter: JitterPolicy::Decorrelated,
        };
        for _ in 0..100 {
            let d = policy.next(6);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_secs(10));
        }
    }
}
