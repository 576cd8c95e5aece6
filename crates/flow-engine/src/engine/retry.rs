//! Retry and backoff policy.

use std::sync::Arc;
use std::time::Duration;

use flow_steps::RetryConfig;
use rand::Rng;

/// Decides whether and when a failed step runs again.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Maximum number of attempts, including the first.
    fn max_attempts(&self) -> u32;

    /// Delay before the next attempt after `failures` consecutive failures.
    fn delay(&self, failures: u32) -> Duration;

    /// The same policy with deterministic delays.
    fn without_jitter(&self) -> Arc<dyn RetryPolicy>;

    /// `None` once the attempt budget is spent.
    fn next_retry(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_attempts() {
            None
        } else {
            Some(self.delay(failures))
        }
    }
}

/// Exponential backoff capped at `max_delay`, with proportional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Extra random delay as a fraction of the base delay (0.0 disables).
    pub jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// Policy described by a step's retry override.
    pub fn from_config(config: &RetryConfig, jitter: f64) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_multiplier,
        )
        .with_jitter(jitter)
    }

    fn base_delay_ms(&self, failures: u32) -> f64 {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        base.min(self.max_delay.as_millis() as f64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), 0.2)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    fn without_jitter(&self) -> Arc<dyn RetryPolicy> {
        Arc::new(self.clone().with_jitter(0.0))
    }

    fn delay(&self, failures: u32) -> Duration {
        let mut delay_ms = self.base_delay_ms(failures);
        if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
            delay_ms += delay_ms * factor;
        }
        let capped = delay_ms.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ExponentialBackoff {
        ExponentialBackoff::new(4, Duration::from_secs(2), Duration::from_secs(10), 2.0)
    }

    #[test]
    fn test_exponential_growth_and_ceiling() {
        let policy = policy();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = policy();
        assert!(policy.next_retry(1).is_some());
        assert!(policy.next_retry(3).is_some());
        assert!(policy.next_retry(4).is_none());
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = ExponentialBackoff::new(5, Duration::from_secs(1), Duration::from_secs(60), 2.0)
            .with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_without_jitter_is_deterministic() {
        let policy = ExponentialBackoff::new(5, Duration::from_secs(1), Duration::from_secs(60), 2.0)
            .with_jitter(0.5)
            .without_jitter();
        for _ in 0..20 {
            assert_eq!(policy.delay(3), Duration::from_secs(4));
        }
        assert_eq!(policy.max_attempts(), 5);
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_multiplier: 3.0,
        };
        let policy = ExponentialBackoff::from_config(&config, 0.0);
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay(2), Duration::from_millis(300));
    }
}
