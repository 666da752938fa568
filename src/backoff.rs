//! Exponential backoff with full jitter, shared by the host observers and
//! the route reconciler.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: each failure multiplies the ceiling, each delay is
/// drawn uniformly from zero to the ceiling (full jitter), and the ceiling
/// never exceeds the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    multiplier: u32,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: u32, cap: Duration) -> Self {
        Self {
            base,
            multiplier,
            cap,
            attempt: 0,
        }
    }

    /// Observer reconnect schedule: 100 ms doubling to a 30 s cap.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_millis(100), 2, Duration::from_secs(30))
    }

    /// Reconciler retry schedule: 100 ms growing 4x to a 30 s cap.
    pub fn retry() -> Self {
        Self::new(Duration::from_millis(100), 4, Duration::from_secs(30))
    }

    /// Number of failures recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Ceiling for the next delay, before jitter.
    fn ceiling(&self) -> Duration {
        let factor = self.multiplier.saturating_pow(self.attempt.min(16));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Record a failure and return the jittered delay to sleep before the
    /// next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let millis = ceiling.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}
