//! Exponential backoff for executable resolution retries

use std::time::Duration;

/// Multiplicative backoff without jitter.
///
/// The first delay is `min`, each following one is `factor` times the
/// previous, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    factor: f64,
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Default for Backoff {
    /// Factor 2, from one second up to one minute.
    fn default() -> Self {
        Self::new(2.0, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(factor: f64, min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            factor: factor.max(1.0),
            min,
            max,
            attempt: 0,
        }
    }

    /// Delay for the current attempt; advances to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let scaled = self.min.as_secs_f64() * self.factor.powi(self.attempt.min(64) as i32);
        self.attempt = self.attempt.saturating_add(1);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(scaled).max(self.min)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence() {
        let mut b = Backoff::default();
        let delays: Vec<u64> = (0..9).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
        assert_eq!(b.attempt(), 9);
    }

    #[test]
    fn test_reset() {
        let mut b = Backoff::default();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_never_exceeds_max_after_many_attempts() {
        let mut b = Backoff::new(2.0, Duration::from_millis(10), Duration::from_millis(500));
        for _ in 0..200 {
            assert!(b.next_delay() <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_max_below_min_is_clamped() {
        let mut b = Backoff::new(2.0, Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }
}
