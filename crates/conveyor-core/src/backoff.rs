//! Backoff policy: decides retry delays.

use std::time::Duration;

/// Exponential backoff with a cap and optional jitter.
///
/// Used in two places: computing the `ready_at` of a requeued item after a
/// retryable failure, and pacing claim retries while the store is down.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay for the first attempt.
    pub base_delay: Duration,

    /// Multiplier between consecutive attempts.
    pub multiplier: f64,

    /// Upper bound on the computed delay.
    pub max_delay: Duration,

    /// Fraction of the delay randomly shaved off, in `[0.0, 1.0]`.
    /// Zero keeps delays deterministic; concurrent pollers hammering the same
    /// store want a non-zero value so their retries fan out.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt number `attempt` (1-indexed).
    ///
    /// delay = min(base_delay * multiplier^(attempt - 1), max_delay),
    /// then reduced by up to `jitter` of itself.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            capped * (1.0 - self.jitter * rand::random::<f64>())
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(4, 16)]
    fn doubles_per_attempt(#[case] attempt: u32, #[case] expected_secs: u64) {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(attempt), Duration::from_secs(expected_secs));
    }

    #[test]
    fn caps_at_max_delay() {
        let policy = BackoffPolicy {
            max_delay: Duration::from_secs(10),
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay(30), Duration::from_secs(10));
        // Huge attempt numbers must not overflow the exponent.
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn jitter_only_shrinks_the_delay() {
        let policy = BackoffPolicy {
            jitter: 0.5,
            ..BackoffPolicy::default()
        };
        for attempt in 1..=5 {
            let full = BackoffPolicy::default().delay(attempt);
            let jittered = policy.delay(attempt);
            assert!(jittered <= full);
            assert!(jittered >= full / 2);
        }
    }
}
