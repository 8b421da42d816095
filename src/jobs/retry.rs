use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter.
///
/// The window for attempt `n` is `min(max, base * 2^(n-1))`; the actual delay
/// is drawn uniformly from the upper half of that window so that workers
/// retrying the same burst of failures spread out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(900),
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Upper bound of the delay after the `attempt`-th failure (1-based)
    pub fn window(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let window = self.window(attempt).as_millis() as u64;
        if window == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(window / 2..=window);
        Duration::from_millis(millis)
    }
}
