//! # Jitter for reconnect waits.
//!
//! Many consumers losing the same broker at once would otherwise redial in lockstep.
//!
//! - [`JitterPolicy::None`] exact wait
//! - [`JitterPolicy::Full`] random in `[0, wait]`
//! - [`JitterPolicy::Equal`] `wait/2 + random[0, wait/2]`
//! - [`JitterPolicy::Decorrelated`] random in `[base, prev × 3]`, capped

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::error::ConfigError;

/// Randomization applied to a reconnect wait.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterPolicy {
    /// Use the computed wait as is.
    #[default]
    None,
    /// Uniform in `[0, wait]`.
    Full,
    /// Uniform in `[wait/2, wait]`.
    Equal,
    /// Uniform in `[base, prev × 3]`, see [`apply_decorrelated`](Self::apply_decorrelated).
    Decorrelated,
}

impl FromStr for JitterPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(JitterPolicy::None),
            "full" => Ok(JitterPolicy::Full),
            "equal" => Ok(JitterPolicy::Equal),
            "decorrelated" => Ok(JitterPolicy::Decorrelated),
            other => Err(ConfigError::Invalid {
                field: "jitter",
                reason: format!("unknown jitter '{other}'"),
            }),
        }
    }
}

impl JitterPolicy {
    /// Applies jitter to `delay`. `Decorrelated` needs context and returns `delay` unchanged here.
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            JitterPolicy::None | JitterPolicy::Decorrelated => delay,
            JitterPolicy::Full => full(delay),
            JitterPolicy::Equal => equal(delay),
        }
    }

    /// Decorrelated jitter between `base` and `min(prev × 3, max)`.
    ///
    /// Falls back to [`apply`](Self::apply) on `prev` for the other variants.
    pub fn apply_decorrelated(&self, base: Duration, prev: Duration, max: Duration) -> Duration {
        if !matches!(self, JitterPolicy::Decorrelated) {
            return self.apply(prev);
        }

        let base_ms = base.as_millis() as u64;
        let upper = (prev.as_millis() as u64).saturating_mul(3).min(max.as_millis() as u64);
        let upper = upper.max(base_ms);
        if base_ms >= upper {
            return base;
        }
        Duration::from_millis(rand::rng().random_range(base_ms..=upper))
    }
}

fn full(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=ms))
}

fn equal(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    let half = ms / 2;
    if half == 0 {
        return delay;
    }
    Duration::from_millis(half + rand::rng().random_range(0..=half))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("Equal".parse::<JitterPolicy>(), Ok(JitterPolicy::Equal));
        assert_eq!("".parse::<JitterPolicy>(), Ok(JitterPolicy::None));
        assert!("wobbly".parse::<JitterPolicy>().is_err());
    }

    #[test]
    fn test_full_jitter_bounds() {
        for _ in 0..50 {
            assert!(JitterPolicy::Full.apply(Duration::from_millis(300)) <= Duration::from_millis(300));
        }
        assert_eq!(JitterPolicy::Full.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_decorrelated_on_other_variant_falls_back() {
        let d = JitterPolicy::None.apply_decorrelated(
            Duration::from_millis(10),
            Duration::from_millis(40),
            Duration::from_secs(1),
        );
        assert_eq!(d, Duration::from_millis(40));
    }
}
