use std::time::Duration;
use tracing::warn;

/// Decision returned by the retry policy after a failed target lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for `delay`, then look up again (includes 1-based attempt number).
    Wait { attempt: u32, delay: Duration },
    /// Exhausted all attempts; stop looking.
    GiveUp,
}

/// Retry policy for target process lookup.
///
/// Fixed interval, no backoff. With `max_attempts` unset the policy never
/// gives up, so a missing target is waited for indefinitely.
pub struct RetryPolicy {
    interval: Duration,
    max_attempts: Option<u32>,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            interval,
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Record one failed lookup and decide what to do next.
    pub fn evaluate(&mut self) -> RetryDecision {
        self.current_attempt = self.current_attempt.saturating_add(1);

        match self.max_attempts {
            Some(max) if self.current_attempt >= max => {
                warn!(
                    attempts = self.current_attempt,
                    max_attempts = max,
                    "target lookup attempts exhausted"
                );
                RetryDecision::GiveUp
            }
            _ => RetryDecision::Wait {
                attempt: self.current_attempt,
                delay: self.interval,
            },
        }
    }

    /// Reset the attempt counter once the target has been found.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Failed lookups since the last reset.
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Calculate exponential backoff delay between tracer restarts.
///
/// Returns `initial * 2^consecutive_count`, capped at `max`.
pub fn backoff_delay(initial: Duration, consecutive_count: u32, max: Duration) -> Duration {
    let shift = 1u32.checked_shl(consecutive_count).unwrap_or(u32::MAX);
    initial.saturating_mul(shift).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALF_SECOND: Duration = Duration::from_millis(500);

    #[test]
    fn test_unbounded_policy_never_gives_up() {
        let mut policy = RetryPolicy::new(HALF_SECOND, None);
        for attempt in 1..=10_000 {
            assert_eq!(
                policy.evaluate(),
                RetryDecision::Wait {
                    attempt,
                    delay: HALF_SECOND
                }
            );
        }
    }

    #[test]
    fn test_interval_is_fixed() {
        let mut policy = RetryPolicy::new(HALF_SECOND, None);
        let delays: Vec<Duration> = (0..5)
            .map(|_| match policy.evaluate() {
                RetryDecision::Wait { delay, .. } => delay,
                RetryDecision::GiveUp => panic!("unbounded policy gave up"),
            })
            .collect();
        assert!(delays.iter().all(|d| *d == HALF_SECOND));
    }

    #[test]
    fn test_bounded_policy_gives_up_on_last_attempt() {
        let mut policy = RetryPolicy::new(HALF_SECOND, Some(3));
        assert!(matches!(policy.evaluate(), RetryDecision::Wait { attempt: 1, .. }));
        assert!(matches!(policy.evaluate(), RetryDecision::Wait { attempt: 2, .. }));
        assert_eq!(policy.evaluate(), RetryDecision::GiveUp);
        assert_eq!(policy.current_attempt(), 3);
    }

    #[test]
    fn test_single_attempt_gives_up_immediately() {
        let mut policy = RetryPolicy::new(HALF_SECOND, Some(1));
        assert_eq!(policy.evaluate(), RetryDecision::GiveUp);
    }

    #[test]
    fn test_reset_clears_attempt_counter() {
        let mut policy = RetryPolicy::new(HALF_SECOND, Some(3));
        policy.evaluate();
        policy.evaluate();
        assert_eq!(policy.current_attempt(), 2);

        policy.reset();
        assert_eq!(policy.current_attempt(), 0);
        assert!(matches!(policy.evaluate(), RetryDecision::Wait { attempt: 1, .. }));
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let initial = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(initial, 0, max), Duration::from_millis(500));
        assert_eq!(backoff_delay(initial, 1, max), Duration::from_millis(1000));
        assert_eq!(backoff_delay(initial, 2, max), Duration::from_millis(2000));
    }

    #[test]
    fn test_backoff_delay_capped() {
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(Duration::from_millis(500), 10, max), max);
    }

    #[test]
    fn test_backoff_delay_overflow_safe() {
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(Duration::from_millis(500), 63, max), max);
    }

    #[test]
    fn test_backoff_delay_zero_initial() {
        assert_eq!(
            backoff_delay(Duration::ZERO, 5, Duration::from_secs(30)),
            Duration::ZERO
        );
    }
}
