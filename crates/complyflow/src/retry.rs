//! Exponential backoff with jitter, shared by the model invoker and the
//! stage-level re-enqueue.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Un-jittered delay before retry number `retry` (1-based):
    /// `base * 2^(retry - 1)`, capped at `max`.
    pub fn ceiling(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Jittered delay: a random point in `[ceiling / 2, ceiling]`.
    pub fn delay(&self, retry: u32) -> Duration {
        self.delay_with(retry, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(retry);
        let factor: f64 = 0.5 + rng.gen::<f64>() * 0.5;
        ceiling.mul_f64(factor)
    }
}
