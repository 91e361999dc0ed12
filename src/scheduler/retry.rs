//! Per-job-type retry policies.

use std::time::Duration;

/// Backoff shape between attempts.
#[derive(Debug, Clone, Copy)]
enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration },
}

/// Bounded retry policy attached to a job type.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Fast engine jobs: cheap to re-run, short fixed delay.
    pub fn fast_engine() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::Fixed(Duration::from_secs(60)),
        }
    }

    /// Accurate engine jobs: recognition is costlier, so the delay doubles.
    pub fn accurate_engine() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::Fixed(Duration::from_secs(120)),
        }
    }

    /// Top-level orchestration: exponential backoff, 60s * 2^attempt.
    pub fn orchestration() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(60),
            },
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts including the first.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base } => base * 2u32.saturating_pow(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_policies_allow_three_attempts() {
        assert_eq!(RetryPolicy::fast_engine().attempts(), 3);
        assert_eq!(RetryPolicy::accurate_engine().attempts(), 3);
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::fast_engine();
        assert_eq!(policy.delay(0), Duration::from_secs(60));
        assert_eq!(policy.delay(1), Duration::from_secs(60));
    }

    #[test]
    fn exponential_delay_doubles() {
        let policy = RetryPolicy::orchestration();
        assert_eq!(policy.delay(0), Duration::from_secs(60));
        assert_eq!(policy.delay(1), Duration::from_secs(120));
        assert_eq!(policy.delay(2), Duration::from_secs(240));
    }
}
