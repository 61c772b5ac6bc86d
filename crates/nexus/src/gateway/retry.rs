//! Exponential backoff with jitter, applied only to transient failures.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_MAX_RETRIES,
            base: Duration::from_millis(crate::config::DEFAULT_RETRY_BASE_MS),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// plus up to 50% jitter to spread synchronized retries.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        if !self.jitter {
            return exp;
        }
        let spread = rand::thread_rng().gen_range(0.0..=0.5);
        exp + exp.mul_f64(spread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).without_jitter();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        for attempt in 0..3 {
            let exp = Duration::from_millis(100 * (1 << attempt));
            let delay = policy.backoff(attempt);
            assert!(delay >= exp);
            assert!(delay <= exp + exp.mul_f64(0.5));
        }
    }

    #[test]
    fn test_max_attempts_floor() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        assert_eq!(policy.max_attempts, 1);
    }
}
