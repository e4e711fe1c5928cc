//! Retry policy for failed registrations
//!
//! Registration failures are not retried unless a [`RetryConfig`] is set on
//! the engine. The delay grows exponentially from `initial_delay` by
//! `backoff_multiplier`, is capped at `max_delay`, and may be jittered by
//! ±10%.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallCoreError, CallCoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total registration attempts before giving up, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Many fast retries, for flaky local networks
    pub fn quick() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            use_jitter: true,
        }
    }

    /// Few slow retries, for overloaded registrars
    pub fn slow() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 3.0,
            use_jitter: false,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);

        let actual = if self.use_jitter {
            let jitter = (rand::random::<f64>() - 0.5) * 0.2;
            capped * (1.0 + jitter)
        } else {
            capped
        };
        Duration::from_millis(actual.max(0.0) as u64)
    }

    pub fn validate(&self) -> CallCoreResult<()> {
        if self.max_attempts == 0 {
            return Err(CallCoreError::invalid_configuration(
                "registration_retry.max_attempts",
                "must be at least 1",
            ));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(CallCoreError::invalid_configuration(
                "registration_retry.backoff_multiplier",
                "must be at least 1.0",
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(CallCoreError::invalid_configuration(
                "registration_retry.initial_delay",
                "must not exceed max_delay",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let config = RetryConfig::default().without_jitter();
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig::slow();
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(60));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let delay = config.delay_for_attempt(2).as_millis();
            assert!((180..=220).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::default().with_max_attempts(0).validate().is_err());
        let mut config = RetryConfig::default();
        config.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
        let config = RetryConfig::default().with_initial_delay(Duration::from_secs(120));
        assert!(config.validate().is_err());
    }
}
