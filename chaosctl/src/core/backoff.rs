//! Poll scheduling helpers for long-running fault runs.

use std::time::{Duration, Instant};

/// Exponential backoff with a ceiling and symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the base delay that jitter may add or remove (0.0..=1.0).
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before poll `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay for `attempt` with jitter applied.
    ///
    /// `sample` is a uniform draw in `[-1.0, 1.0]`; callers supply it so the
    /// schedule stays reproducible under test.
    pub fn delay_for(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let jittered = base * (1.0 + ratio * sample.clamp(-1.0, 1.0));
        Duration::from_secs_f64(jittered.max(0.0)).min(self.max)
    }
}

/// Time left until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant, now: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(now)
        .filter(|remaining| !remaining.is_zero())
}

/// Never sleep past the deadline.
pub fn next_sleep(policy: &BackoffPolicy, attempt: u32, sample: f64, remaining: Duration) -> Duration {
    policy.delay_for(attempt, sample).min(remaining)
}
