//! Retry delays for deferred entries: capped exponential growth with equal jitter.
//!
//! The ceiling for retry `n` (1-based) is `base * 2^(n-1)`, capped at `max`. The actual delay is
//! drawn uniformly from `[ceiling/2, ceiling]` so retries from one burst do not land together.

use std::time::Duration;

use rand::{rng, Rng};

use crate::config::QueueConfig;

/// Capped exponential backoff with equal jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
}

impl RetryBackoff {
    /// Backoff starting at `base`; `max` below `base` is raised to `base`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base) }
    }

    /// Backoff from `retry_base_delay_ms` / `retry_max_delay_ms`.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// Delay before retry `retry` without jitter; zero for `retry == 0`.
    pub fn ceiling(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry - 1).min(63);
        let base = as_millis_saturated(self.base);
        let grown = base.saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(grown.min(as_millis_saturated(self.max)))
    }

    /// Jittered delay before retry `retry`.
    pub fn delay(&self, retry: u32) -> Duration {
        self.delay_with_rng(retry, &mut rng())
    }

    /// Jittered delay using a caller-supplied RNG.
    pub fn delay_with_rng<R: Rng>(&self, retry: u32, rng: &mut R) -> Duration {
        let millis = as_millis_saturated(self.ceiling(retry));
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.random_range(millis / 2..=millis))
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn ceiling_doubles_until_capped() {
        let backoff = RetryBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.ceiling(0), Duration::ZERO);
        assert_eq!(backoff.ceiling(1), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(2), Duration::from_secs(2));
        assert_eq!(backoff.ceiling(3), Duration::from_secs(4));
        assert_eq!(backoff.ceiling(4), Duration::from_secs(5));
        assert_eq!(backoff.ceiling(200), Duration::from_secs(5));
    }

    #[test]
    fn jittered_delay_stays_in_upper_half() {
        let backoff = RetryBackoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 1..8 {
            let ceiling = backoff.ceiling(retry);
            let delay = backoff.delay_with_rng(retry, &mut rng);
            assert!(delay <= ceiling, "retry {retry}: {delay:?} > {ceiling:?}");
            assert!(delay >= ceiling / 2, "retry {retry}: {delay:?} < half of {ceiling:?}");
        }
    }

    #[test]
    fn max_below_base_is_raised() {
        let backoff = RetryBackoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.ceiling(3), Duration::from_secs(2));
    }
}
