//! # Retry Policy
//!
//! Backoff schedule for automatic redelivery. The computed delay becomes the
//! not-before score of the rescheduled queue job.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryConfigError {
    #[error("retry duration must be at least one second")]
    ZeroDuration,
    #[error("retry count must be at least 1")]
    ZeroRetryCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(rename = "type")]
    pub strategy: RetryStrategy,
    /// Base delay in seconds
    pub duration_seconds: u64,
    /// Automatic attempts allowed before the delivery is discarded
    pub retry_count: u32,
}

impl RetryConfig {
    pub fn linear(duration_seconds: u64, retry_count: u32) -> Self {
        Self {
            strategy: RetryStrategy::Linear,
            duration_seconds,
            retry_count,
        }
    }

    pub fn exponential(duration_seconds: u64, retry_count: u32) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            duration_seconds,
            retry_count,
        }
    }

    pub fn validate(&self) -> Result<(), RetryConfigError> {
        if self.duration_seconds == 0 {
            return Err(RetryConfigError::ZeroDuration);
        }
        if self.retry_count == 0 {
            return Err(RetryConfigError::ZeroRetryCount);
        }
        Ok(())
    }

    /// Whether another automatic attempt is allowed after `auto_attempts`.
    pub fn can_retry(&self, auto_attempts: u32) -> bool {
        auto_attempts < self.retry_count
    }

    /// Delay before automatic attempt `attempt + 1`, where `attempt` is the
    /// 1-based number of the attempt that just failed.
    pub fn backoff(&self, attempt: u32, ceiling: Duration) -> Duration {
        let base = self.duration_seconds;
        let seconds = match self.strategy {
            RetryStrategy::Linear => base,
            RetryStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(63);
                base.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_secs(seconds).min(ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: Duration = Duration::from_secs(7_200);

    #[test]
    fn linear_is_constant() {
        let config = RetryConfig::linear(30, 5);
        let delays: Vec<_> = (1..=5).map(|n| config.backoff(n, CEILING)).collect();
        assert!(delays.iter().all(|d| *d == Duration::from_secs(30)));
    }

    #[test]
    fn exponential_is_monotonic_and_capped() {
        let config = RetryConfig::exponential(10, 20);
        assert_eq!(config.backoff(1, CEILING), Duration::from_secs(10));
        assert_eq!(config.backoff(2, CEILING), Duration::from_secs(20));
        assert_eq!(config.backoff(4, CEILING), Duration::from_secs(80));

        let mut previous = Duration::ZERO;
        for attempt in 1..=80 {
            let delay = config.backoff(attempt, CEILING);
            assert!(delay >= previous);
            assert!(delay <= CEILING);
            previous = delay;
        }
        assert_eq!(previous, CEILING);
    }

    #[test]
    fn retry_budget() {
        let config = RetryConfig::linear(1, 2);
        assert!(config.can_retry(0));
        assert!(config.can_retry(1));
        assert!(!config.can_retry(2));
    }

    #[test]
    fn validation_and_serde() {
        assert_eq!(
            RetryConfig::linear(0, 3).validate(),
            Err(RetryConfigError::ZeroDuration)
        );
        assert_eq!(
            RetryConfig::exponential(5, 0).validate(),
            Err(RetryConfigError::ZeroRetryCount)
        );

        let parsed: RetryConfig = serde_json::from_value(serde_json::json!({
            "type": "exponential",
            "duration_seconds": 5,
            "retry_count": 3
        }))
        .unwrap();
        assert_eq!(parsed, RetryConfig::exponential(5, 3));
    }
}
