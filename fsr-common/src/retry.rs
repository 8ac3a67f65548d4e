//! Bounded exponential backoff
//!
//! Shared by the server (lock and version-conflict retries) and by the sync
//! client (phase-2 upload retries). Attempts are 1-based: attempt 1 is the
//! first try and never waits.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting, for tests and in-process callers
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Whether another attempt is allowed after `attempts_made` tries
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before the given attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay with up to 20% random jitter subtracted, so that a fleet of
    /// clients reconnecting together does not retry in lockstep
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let base_ms = base.as_millis() as u64;
        if base_ms == 0 {
            return base;
        }
        let jitter = rng.gen_range(0..=base_ms / 5);
        Duration::from_millis(base_ms - jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_first_attempt_never_waits() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(1000));
    }

    #[test]
    fn test_attempt_bound() {
        let policy = RetryPolicy::immediate(3);
        assert!(policy.allows_another(0));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let d = policy.jittered_delay(3, &mut rng);
            assert!(d <= Duration::from_millis(2000));
            assert!(d >= Duration::from_millis(1600));
        }
    }
}
