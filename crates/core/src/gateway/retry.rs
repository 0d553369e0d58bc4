use std::time::Duration;

use tokio_retry2::strategy::{jitter, ExponentialBackoff};

/// Bounded exponential backoff applied to transient gateway failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// No waiting between attempts. Used by tests and probes.
    pub const fn immediate(max_retries: usize) -> Self {
        Self::new(max_retries, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delays before each retry: `base`, `2 * base`, `4 * base`, ... capped at
    /// `max_delay`, each scaled by a random jitter factor.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        // the strategy yields factor * 2^n milliseconds
        let factor = u64::try_from(self.base_delay.as_millis() / 2).unwrap_or(u64::MAX);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_one_delay_per_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delays().count(), 3);
        assert_eq!(RetryPolicy::immediate(0).delays().count(), 0);
    }

    #[test]
    fn delays_stay_under_the_cap() {
        let policy = RetryPolicy::new(8, Duration::from_millis(400), Duration::from_secs(1));
        assert!(policy.delays().all(|delay| delay <= Duration::from_secs(1)));
    }

    #[test]
    fn immediate_policy_never_waits() {
        assert!(RetryPolicy::immediate(5)
            .delays()
            .all(|delay| delay == Duration::ZERO));
    }
}
