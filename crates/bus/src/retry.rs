use std::time::Duration;

/// Re-export so users configure backoff without their own dependency.
pub use exponential_backoff::Backoff;

/// Counted exponential backoff. `next_backoff` yields exactly `max_retries`
/// delays, then None; the delay curve comes from the backing `Backoff`,
/// clamped to `max`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    max: Duration,
    error_count: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: impl Into<Option<u32>>, min: Duration, max: Duration) -> RetryPolicy {
        let max_retries = max_retries.into().unwrap_or(u32::MAX);
        RetryPolicy {
            max_retries,
            max,
            error_count: 0,
            backoff: Backoff::new(u32::MAX, min, Some(max)),
        }
    }

    /// Unbounded variant used by reconnect loops: always yields a delay,
    /// capped at `max`.
    pub fn unbounded(min: Duration, max: Duration) -> RetryPolicy {
        RetryPolicy::new(None, min, max)
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
    }

    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.error_count >= self.max_retries {
            return None;
        }
        self.error_count += 1;
        Some(
            self.backoff
                .next(self.error_count)
                .unwrap_or(self.max)
                .min(self.max),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bounded_policy_exhausts() {
        let mut policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1));
        let mut delays = 0;
        while policy.next_backoff().is_some() {
            delays += 1;
            assert!(delays <= 3, "policy must stop after three retries");
        }
        assert_eq!(delays, 3);
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut policy = RetryPolicy::new(1, Duration::from_millis(10), Duration::from_secs(1));
        assert!(policy.next_backoff().is_some());
        assert!(policy.next_backoff().is_none());
        policy.reset();
        assert!(policy.next_backoff().is_some());
    }

    #[test]
    fn test_delays_never_exceed_the_ceiling() {
        let mut policy =
            RetryPolicy::unbounded(Duration::from_millis(10), Duration::from_millis(80));
        for _ in 0..32 {
            let delay = policy.next_backoff().expect("unbounded policy always yields");
            assert!(delay <= Duration::from_millis(80), "delay {delay:?}");
        }
    }
}
