use rand::Rng;
use std::time::Duration;

use crate::MAX_RETRY_DELAY_MS;

/// `base_delay_ms * 2^retry_count`, capped at [`MAX_RETRY_DELAY_MS`].
#[must_use]
pub fn calculate_exponential_backoff(retry_count: u32, base_delay_ms: u64) -> u64 {
    calculate_exponential_backoff_capped(retry_count, base_delay_ms, MAX_RETRY_DELAY_MS)
}

#[must_use]
pub fn calculate_exponential_backoff_capped(
    retry_count: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(2u64.saturating_pow(retry_count));
    exponential.min(max_delay_ms)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl BackoffPolicy {
    /// Delay to wait before the retry that follows `retry_count` earlier retries.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let capped =
            calculate_exponential_backoff_capped(retry_count, self.base_delay_ms, self.max_delay_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        assert_eq!(calculate_exponential_backoff(0, 1000), 1000);
        assert_eq!(calculate_exponential_backoff(1, 1000), 2000);
        assert_eq!(calculate_exponential_backoff(3, 1000), 8000);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert!(calculate_exponential_backoff_capped(10, 1000, 30_000) <= 30_000);
        assert_eq!(calculate_exponential_backoff(10, 1000), 30_000);
        assert_eq!(calculate_exponential_backoff_capped(u32::MAX, u64::MAX, 5), 5);
    }

    #[test]
    fn test_policy_without_jitter_is_deterministic() {
        let policy = BackoffPolicy {
            base_delay_ms: 250,
            max_delay_ms: 1_000,
            jitter_ms: 0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
    }

    proptest! {
        #[test]
        fn prop_backoff_never_exceeds_cap(retry in 0u32..64, base in 1u64..100_000, cap in 1u64..1_000_000) {
            prop_assert!(calculate_exponential_backoff_capped(retry, base, cap) <= cap);
        }

        #[test]
        fn prop_backoff_is_monotonic(retry in 0u32..63, base in 1u64..100_000) {
            let a = calculate_exponential_backoff(retry, base);
            let b = calculate_exponential_backoff(retry + 1, base);
            prop_assert!(a <= b);
        }

        #[test]
        fn prop_jitter_stays_in_window(retry in 0u32..8, jitter in 1u64..5_000) {
            let policy = BackoffPolicy { base_delay_ms: 100, max_delay_ms: 10_000, jitter_ms: jitter };
            let delay = u64::try_from(policy.delay_for(retry).as_millis()).unwrap();
            let floor = calculate_exponential_backoff_capped(retry, 100, 10_000);
            prop_assert!(delay >= floor && delay <= floor + jitter);
        }
    }
}
