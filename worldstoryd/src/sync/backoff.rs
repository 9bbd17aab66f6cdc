use std::time::Duration;

use rand::Rng;

/// Exponential delay between reachability probes while the API is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeBackoff {
    initial: Duration,
    ceiling: Duration,
    jitter: bool,
}

impl ProbeBackoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            initial,
            ceiling: ceiling.max(initial),
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the next probe after `failures` consecutive failed probes.
    pub fn next_delay(&self, failures: u32) -> Duration {
        self.next_delay_with_rng(failures, &mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let doublings = failures.saturating_sub(1).min(20);
        let grown = self
            .initial
            .checked_mul(1u32 << doublings)
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        if !self.jitter || grown.is_zero() {
            return grown;
        }
        // Jitter keeps the delay within [grown / 2, grown].
        let half = grown / 2;
        let spread_ms = u64::try_from(half.as_millis()).unwrap_or(u64::MAX);
        half + Duration::from_millis(rng.gen_range(0..=spread_ms))
    }
}
