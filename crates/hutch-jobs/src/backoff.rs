//! Backoff policies for failed jobs.

use crate::error::JobError;
use hutch_config::RetryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backoff strategy carried in the `backoff` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// Delay multiplied by the growth factor on each retry.
    Exponential,
}

impl Backoff {
    /// Returns the strategy name as carried on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Backoff::Fixed => "fixed",
            Backoff::Exponential => "exponential",
        }
    }
}

impl fmt::Display for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backoff {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Backoff::Fixed),
            "exponential" => Ok(Backoff::Exponential),
            other => Err(JobError::InvalidConfiguration(format!(
                "unknown backoff strategy '{other}' (expected fixed or exponential)"
            ))),
        }
    }
}

impl TryFrom<&str> for Backoff {
    type Error = JobError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Computes retry delays from a strategy, an attempt number and the
/// job's configured base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Growth factor for [`Backoff::Exponential`].
    pub exponential_factor: u32,

    /// Upper bound for exponential delays, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            exponential_factor: config.exponential_factor.max(1),
            max_delay_ms: config.max_delay_ms,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy with the given growth factor and cap.
    pub fn new(exponential_factor: u32, max_delay_ms: u64) -> Self {
        Self {
            exponential_factor: exponential_factor.max(1),
            max_delay_ms,
        }
    }

    /// Delay in milliseconds before the retry that follows `attempt`
    /// failed deliveries (1-based).
    ///
    /// `fixed` always returns `base_delay_ms`. `exponential` returns
    /// `base_delay_ms * factor^(attempt - 1)`, saturating, and capped at
    /// `max(max_delay_ms, base_delay_ms)` so it never drops below the base.
    pub fn next_delay(&self, backoff: Backoff, attempt: u32, base_delay_ms: u64) -> u64 {
        match backoff {
            Backoff::Fixed => base_delay_ms,
            Backoff::Exponential => {
                let exp = attempt.max(1) - 1;
                let multiplier = u64::from(self.exponential_factor)
                    .checked_pow(exp)
                    .unwrap_or(u64::MAX);
                let cap = self.max_delay_ms.max(base_delay_ms);
                base_delay_ms.saturating_mul(multiplier).min(cap)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.next_delay(Backoff::Fixed, 1, 5000), 5000);
        assert_eq!(policy.next_delay(Backoff::Fixed, 2, 5000), 5000);
        assert_eq!(policy.next_delay(Backoff::Fixed, 30, 5000), 5000);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = BackoffPolicy::new(2, 3_600_000);

        // 1st retry: 1000ms
        // 2nd retry: 2000ms
        // 3rd retry: 4000ms
        assert_eq!(policy.next_delay(Backoff::Exponential, 1, 1000), 1000);
        assert_eq!(policy.next_delay(Backoff::Exponential, 2, 1000), 2000);
        assert_eq!(policy.next_delay(Backoff::Exponential, 3, 1000), 4000);
    }

    #[test]
    fn test_exponential_custom_factor() {
        let policy = BackoffPolicy::new(3, u64::MAX);
        assert_eq!(policy.next_delay(Backoff::Exponential, 3, 100), 900);
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = BackoffPolicy::new(2, 10_000);
        assert_eq!(policy.next_delay(Backoff::Exponential, 10, 1000), 10_000);
    }

    #[test]
    fn test_cap_never_undercuts_base_delay() {
        let policy = BackoffPolicy::new(2, 1000);
        assert_eq!(policy.next_delay(Backoff::Exponential, 1, 50_000), 50_000);
        assert_eq!(policy.next_delay(Backoff::Exponential, 4, 50_000), 50_000);
    }

    #[test]
    fn test_exponential_is_monotonic() {
        let policy = BackoffPolicy::new(2, 3_600_000);
        for base in [0, 1, 50, 5000, u64::MAX / 3] {
            let mut previous = 0;
            for attempt in 1..=80 {
                let delay = policy.next_delay(Backoff::Exponential, attempt, base);
                assert!(delay >= previous, "attempt {attempt} base {base}: {delay} < {previous}");
                previous = delay;
            }
        }
    }

    #[test]
    fn test_zero_factor_is_clamped() {
        let policy = BackoffPolicy::new(0, 10_000);
        assert_eq!(policy.exponential_factor, 1);
        assert_eq!(policy.next_delay(Backoff::Exponential, 5, 700), 700);
    }

    #[test]
    fn test_parse_backoff() {
        assert_eq!("fixed".parse::<Backoff>().unwrap(), Backoff::Fixed);
        assert_eq!(Backoff::try_from("exponential").unwrap(), Backoff::Exponential);
        assert!(matches!(
            "linear".parse::<Backoff>(),
            Err(JobError::InvalidConfiguration(_))
        ));
    }
}
