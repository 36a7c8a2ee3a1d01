use std::time::Duration;

use jobq_core::config::RetryConfig;

/// Decides how long a retry job waits before it becomes due.
///
/// `attempt` is the number of retries the original job already had before
/// this one was created, starting at 0.
pub trait RetryScheduler: Send + Sync {
    fn delay_for(&self, attempt: u32) -> Duration;
}

impl<F> RetryScheduler for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay_for(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// `base ^ attempt` seconds, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialRetryScheduler {
    base_secs: u64,
    max_delay: Duration,
}

impl ExponentialRetryScheduler {
    pub fn new(base_secs: u64, max_delay: Duration) -> Self {
        Self {
            base_secs,
            max_delay,
        }
    }
}

impl Default for ExponentialRetryScheduler {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for ExponentialRetryScheduler {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.base_secs, Duration::from_secs(config.max_delay_secs))
    }
}

impl RetryScheduler for ExponentialRetryScheduler {
    fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self
            .base_secs
            .checked_pow(attempt)
            .unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially() {
        let s = ExponentialRetryScheduler::new(5, Duration::from_secs(3600));
        assert_eq!(s.delay_for(0), Duration::from_secs(1));
        assert_eq!(s.delay_for(1), Duration::from_secs(5));
        assert_eq!(s.delay_for(2), Duration::from_secs(25));
        assert_eq!(s.delay_for(3), Duration::from_secs(125));
    }

    #[test]
    fn capped_and_overflow_safe() {
        let s = ExponentialRetryScheduler::new(5, Duration::from_secs(3600));
        assert_eq!(s.delay_for(6), Duration::from_secs(3600));
        assert_eq!(s.delay_for(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn closures_are_schedulers() {
        let immediate = |_attempt: u32| Duration::ZERO;
        assert_eq!(immediate.delay_for(4), Duration::ZERO);
    }
}
