use std::time::Duration;

/// Exponential delay between autoplay retries, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// `base * 2^attempt`, never more than `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.ceiling_ms(attempt))
    }

    /// How many leading attempts get a strictly longer delay than the one
    /// before. Always at least 1.
    pub fn growing_attempts(&self) -> u32 {
        let mut attempts = 1;
        while attempts < 64 && self.ceiling_ms(attempts) > self.ceiling_ms(attempts - 1) {
            attempts += 1;
        }
        attempts
    }

    fn ceiling_ms(&self, attempt: u32) -> u64 {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(63);
        base_ms
            .checked_mul(1u64 << shift)
            .unwrap_or(u64::MAX)
            .min(max_ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(8))
    }
}
