use std::time::Duration;

/// Capped exponential backoff for failed uploads.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries per task before it settles as an error.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for the backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based): `base * 2^(attempt - 1)`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_capped_exponential() {
        let policy = RetryPolicy::default();
        let secs: Vec<u64> = (1..=6)
            .map(|n| policy.delay_for_attempt(n).as_secs())
            .collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn attempt_zero_clamps_to_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
    }

    #[test]
    fn huge_attempt_stays_at_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(10));
    }
}
