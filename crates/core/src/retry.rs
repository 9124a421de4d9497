use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff for infrastructural failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 50, multiplier: 2 }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (0-based), or `None` once attempts are spent.
    pub fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        if retry_count + 1 >= self.max_attempts {
            return None;
        }
        let factor = u64::from(self.multiplier).saturating_pow(retry_count);
        Some(Duration::from_millis(self.base_delay_ms.saturating_mul(factor)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;

    #[test]
    fn delays_grow_exponentially_until_attempts_run_out() {
        let policy = RetryPolicy { max_attempts: 4, base_delay_ms: 10, multiplier: 3 };

        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(30)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(90)));
        assert_eq!(policy.delay_for(3), None);
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let policy = RetryPolicy { max_attempts: 1, ..RetryPolicy::default() };

        assert_eq!(policy.delay_for(0), None);
    }
}
