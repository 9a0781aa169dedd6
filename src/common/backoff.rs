//! Exponential backoff with full jitter
//!
//! Retry delay is drawn uniformly from `[0, min(cap, base * 2^attempt))`.
//! The attempt counter resets on any terminal success and grows on every
//! retry-triggering response.

use rand::Rng;
use std::time::Duration;

pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Advance the attempt counter and draw the next delay.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(20));
        let ceiling = self.cap.min(exp).max(Duration::from_millis(1));
        rand::thread_rng().gen_range(Duration::ZERO..ceiling)
    }

    /// Sleep for the next jittered delay.
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    /// The client-facing retry profile: base 100ms, cap 1s.
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_within_bounds() {
        let mut backoff = Backoff::default();
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay < Duration::from_secs(1));
        }
    }

    #[test]
    fn test_ceiling_grows_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        // first attempt is bounded by base * 2
        let first = backoff.next_delay();
        assert!(first < Duration::from_millis(200));
        backoff.reset();
        // after many attempts the draw can reach anywhere below the cap,
        // never above it
        for _ in 0..32 {
            let delay = backoff.next_delay();
            assert!(delay < Duration::from_secs(1));
        }
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..10 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_millis(200));
    }
}
