//! Exponential backoff and poll interval jitter

use rand::Rng;
use std::time::Duration;

/// Doubling delay capped at a maximum
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Start at `initial`, never exceed `max`
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            max,
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; doubles the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        self.attempts += 1;
        delay
    }

    /// Delays handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// `interval` scaled by a random factor in `[0.5, 1.5)`
pub fn jittered(interval: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    interval.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_initial_above_max_is_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(20);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= Duration::from_secs(10) && d < Duration::from_secs(30));
        }
    }
}
