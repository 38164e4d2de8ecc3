//! Exponential backoff with jitter: the
//! gap between successive retryable-failure schedules grows monotonically
//! up to a configured cap, modulo a jitter band.

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: std::time::Duration,
    pub cap: std::time::Duration,
    /// Fraction of the computed delay randomized away, e.g. `0.2` for ±20%.
    pub jitter: f64,
    pub max_attempts: i32,
}

pub const DEFAULT_BACKOFF: BackoffPolicy = BackoffPolicy {
    base: std::time::Duration::from_secs(2),
    cap: std::time::Duration::from_secs(300),
    jitter: 0.2,
    max_attempts: 8,
};

impl BackoffPolicy {
    /// Delay before the `attempt`-th retry (1-indexed: the first retry
    /// after an initial failed attempt). Deterministic up to the jitter
    /// term, which the caller supplies an `rng` for so tests can pin it.
    pub fn delay(&self, attempt: i32, rng: &mut impl Rng) -> std::time::Duration {
        let attempt = attempt.max(1) as u32;
        let unjittered = self.base.saturating_mul(1 << attempt.min(20).saturating_sub(1)).min(self.cap);
        let jitter_span = unjittered.as_secs_f64() * self.jitter;
        let offset = rng.gen_range(-jitter_span..=jitter_span);
        let jittered = (unjittered.as_secs_f64() + offset).max(0.0);
        std::time::Duration::from_secs_f64(jittered)
    }

    pub fn should_dead_letter(&self, attempts: i32) -> bool {
        attempts >= self.max_attempts
    }
}
