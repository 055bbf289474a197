//! Bounded retry with exponential backoff for units of work.

use std::time::Duration;

/// Retry configuration for a unit of work.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per unit, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on exponential growth.
    pub max_delay: Duration,
    /// Multiplier applied to the delay on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Stateless policy — computes the delay before the next retry given how
/// many attempts have already failed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay to wait after `failures` failed attempts (1-based).
    /// Returns `None` once the attempt budget is spent.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        if failures >= self.config.max_attempts {
            return None;
        }
        let base_ms = self.config.base_delay.as_millis() as f64
            * self.config.multiplier.powi(failures.saturating_sub(1) as i32);
        let capped = base_ms.min(self.config.max_delay.as_millis() as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Returns `true` if another attempt is allowed after `failures` failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.config.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_failure() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        });
        assert_eq!(policy.next_delay(1).unwrap(), Duration::from_secs(5));
        assert_eq!(policy.next_delay(2).unwrap(), Duration::from_secs(10));
        assert!(policy.next_delay(3).is_none());
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        });
        assert_eq!(policy.next_delay(4).unwrap(), Duration::from_secs(8));
    }

    #[test]
    fn should_retry_boundary() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            ..Default::default()
        });
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }
}
