//! Capped exponential backoff
//!
//! Shared by the upload pipeline (between retries), the network selector
//! (between failed acquisitions) and the controller (between failed cycles).

use embassy_time::Duration;

/// Shape of a backoff sequence: `initial * factor^n`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl BackoffPolicy {
    pub const fn new(initial: Duration, max: Duration, factor: u32) -> Self {
        Self {
            initial,
            max,
            factor,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.max.as_millis();
        let factor = u64::from(self.factor.max(1));
        let mut delay = self.initial.as_millis().min(cap);

        for _ in 0..attempt {
            delay = delay.saturating_mul(factor);
            if delay >= cap {
                return self.max;
            }
        }

        Duration::from_millis(delay)
    }
}

/// Stateful walk along a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay to wait now; the following call returns the next step.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay the next call to [`Self::next_delay`] would return.
    pub fn peek(&self) -> Duration {
        self.policy.delay_for(self.attempt)
    }

    /// Number of delays handed out since the last reset.
    pub fn steps(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(60), 2)
    }

    #[test]
    fn test_delays_double_until_cap() {
        let mut backoff = Backoff::new(policy());
        let delays: [u64; 6] = core::array::from_fn(|_| backoff.next_delay().as_secs());
        assert_eq!(delays, [5, 10, 20, 40, 60, 60]);
        assert_eq!(backoff.steps(), 6);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::new(policy());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.peek(), Duration::from_secs(5));
    }

    #[test]
    fn test_huge_attempt_count_saturates_at_cap() {
        assert_eq!(policy().delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_initial_above_cap_is_clamped() {
        let policy = BackoffPolicy::new(Duration::from_secs(90), Duration::from_secs(60), 2);
        assert_eq!(policy.delay_for(0), Duration::from_secs(60));
    }
}
