//! Retry policy with exponential backoff and optional jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter applied on top of the exponential delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exact `base * 2^attempt` delays.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

/// Retry configuration for transient capability failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound of any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// Creates the default retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the delay to wait after failed attempt `attempt` (0-based).
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }

    /// Decides what to do after attempt `attempt` failed.
    #[must_use]
    pub fn decide(&self, attempt: u32, retryable: bool) -> RetryDecision {
        if !retryable {
            RetryDecision::NotRetryable
        } else if attempt >= self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.backoff_delay(attempt))
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// The retry budget is spent.
    GiveUp,
    /// The error is not retryable.
    NotRetryable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::default().with_max_delay_ms(5000);
        assert_eq!(config.backoff_delay(10), Duration::from_millis(5000));
        assert_eq!(config.backoff_delay(64), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_bounds() {
        let config = RetryConfig::default().with_jitter(JitterStrategy::Full);
        for _ in 0..50 {
            assert!(config.backoff_delay(1) <= Duration::from_millis(2000));
        }
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let config = RetryConfig::default().with_jitter(JitterStrategy::Equal);
        for _ in 0..50 {
            let delay = config.backoff_delay(0);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_decisions() {
        let config = RetryConfig::default().with_max_retries(2);
        assert_eq!(config.decide(0, false), RetryDecision::NotRetryable);
        assert_eq!(config.decide(0, true), RetryDecision::Retry(Duration::from_millis(1000)));
        assert_eq!(config.decide(1, true), RetryDecision::Retry(Duration::from_millis(2000)));
        assert_eq!(config.decide(2, true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_serde_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay_ms, 1000);
        assert_eq!(config.jitter, JitterStrategy::None);
    }
}
