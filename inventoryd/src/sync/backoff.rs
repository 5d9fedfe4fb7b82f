use rand::Rng;
use std::time::Duration;

/// Exponential retry delay with optional full jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    /// Delay before retry number `attempt` (zero-based). With jitter the
    /// result is uniform in `0..=ceiling`.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self
            .base
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max);
        if !self.jitter {
            return ceiling;
        }
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rng.gen_range(0..=ceiling_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), true)
    }
}

const MIN_FLOOR: Duration = Duration::from_millis(300);
const MIN_CAP: Duration = Duration::from_secs(10);
const MAX_FLOOR: Duration = Duration::from_secs(10);
const MAX_CAP: Duration = Duration::from_secs(120);

/// Pacing window for the one-at-a-time fetch mode.
///
/// `min_interval` spaces consecutive requests; a request still outstanding
/// after `slow_after` counts as slow. Slow replies widen both bounds, timely
/// ones narrow them again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptivePacing {
    min_interval: Duration,
    slow_after: Duration,
    min_floor: Duration,
    slow_floor: Duration,
}

impl Default for AdaptivePacing {
    fn default() -> Self {
        Self::new(MIN_FLOOR, MAX_FLOOR)
    }
}

impl AdaptivePacing {
    /// Starts at, and never narrows below, the given bounds.
    pub fn new(min_interval: Duration, slow_after: Duration) -> Self {
        Self {
            min_interval,
            slow_after,
            min_floor: min_interval,
            slow_floor: slow_after,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn slow_after(&self) -> Duration {
        self.slow_after
    }

    pub fn on_slow(&mut self) {
        self.min_interval = (self.min_interval * 2).min(MIN_CAP.max(self.min_floor));
        self.slow_after = (self.slow_after * 2).min(MAX_CAP.max(self.slow_floor));
    }

    pub fn on_fast(&mut self) {
        self.min_interval = (self.min_interval / 2).max(self.min_floor);
        self.slow_after = (self.slow_after / 2).max(self.slow_floor);
    }
}
