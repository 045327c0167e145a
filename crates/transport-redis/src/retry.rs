//! Reconnect backoff.
//!
//! Delays grow exponentially with jitter:
//! - Base delay doubles with each attempt: `initial * 2^attempt`
//! - Delay is capped at `max`
//! - Random jitter of 0–50% of the computed delay is added so processes that
//!   lost the server together do not reconnect in lockstep

use std::time::Duration;

use rand::Rng;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = base.min(self.max);

        let jitter_range = capped.as_millis() as u64 / 2;
        if jitter_range > 0 {
            let jitter = rand::rng().random_range(0..=jitter_range);
            capped + Duration::from_millis(jitter)
        } else {
            capped
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_exponential() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));

        let d0 = backoff.delay(0);
        assert!(d0 >= Duration::from_millis(100));
        assert!(d0 <= Duration::from_millis(150));

        let d1 = backoff.delay(1);
        assert!(d1 >= Duration::from_millis(200));
        assert!(d1 <= Duration::from_millis(300));

        let d2 = backoff.delay(2);
        assert!(d2 >= Duration::from_millis(400));
        assert!(d2 <= Duration::from_millis(600));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let d = backoff.delay(5);
        assert!(d >= Duration::from_secs(5));
        assert!(d <= Duration::from_millis(7_500));
    }

    #[test]
    fn test_delay_survives_huge_attempt_counts() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let d = backoff.delay(u32::MAX);
        assert!(d >= Duration::from_secs(10));
        assert!(d <= Duration::from_secs(15));
    }

    #[test]
    fn test_delay_zero_initial() {
        let backoff = Backoff::new(Duration::ZERO, Duration::from_secs(5));
        assert_eq!(backoff.delay(0), Duration::ZERO);
    }
}
