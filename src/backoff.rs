//! Exponential backoff for reconnection

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with cap and jitter
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    /// 0 = unlimited attempts
    max_attempts: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    /// Next delay to wait before reconnecting, or None when attempts are
    /// exhausted. Delays double each attempt up to the cap, with ±50% jitter
    /// so a fleet of agents does not hammer the broker in lockstep.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts != 0 && self.attempt >= self.max_attempts {
            return None;
        }

        let exp = self.attempt.min(16);
        let base = self
            .initial
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .min(self.max);
        self.attempt += 1;

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Some(base.mul_f64(jitter).min(self.max))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_to_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(8), 0);
        for _ in 0..10 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= Duration::from_secs(8));
        }
        assert_eq!(backoff.attempt(), 10);
    }

    #[test]
    fn test_attempts_exhaust() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1), 3);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(60), 0);
        let delay = backoff.next_delay().unwrap();
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_secs(3));
    }
}
