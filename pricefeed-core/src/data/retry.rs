//! Bounded exponential backoff.

use rand::Rng;
use std::time::Duration;

/// How many times to try and how long to wait in between.
///
/// `max_attempts` counts every request, including the first. The delay before
/// attempt `n` (1-based, `n >= 2`) is `base_delay * 2^(n-2)`, capped at
/// `max_delay`, then stretched by up to `jitter` of itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `[0, 1]`.
    pub jitter: f64,
    /// Upper bound on a server-provided `Retry-After`.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
            max_retry_after: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter and with tiny delays, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
            max_retry_after: Duration::from_secs(5),
        }
    }

    /// Default delay to wait after `failed_attempt` (1-based) has failed.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        if self.jitter <= 0.0 {
            return capped;
        }
        let stretch = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        capped + capped.mul_f64(stretch)
    }

    /// Delay to honor for an explicit server hint.
    pub fn retry_after(&self, hint: Duration) -> Duration {
        hint.min(self.max_retry_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = no_jitter();
        assert_eq!(p.backoff(1), Duration::from_secs(5));
        assert_eq!(p.backoff(2), Duration::from_secs(10));
        assert_eq!(p.backoff(3), Duration::from_secs(20));
        assert_eq!(p.backoff(4), Duration::from_secs(30));
        assert_eq!(p.backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let d = p.backoff(1);
            assert!(d >= Duration::from_secs(5));
            assert!(d <= Duration::from_millis(7_500));
        }
    }

    #[test]
    fn retry_after_is_clamped() {
        let p = no_jitter();
        assert_eq!(p.retry_after(Duration::from_secs(7)), Duration::from_secs(7));
        assert_eq!(p.retry_after(Duration::from_secs(3600)), Duration::from_secs(120));
    }
}
