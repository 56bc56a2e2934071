//! Retry delay policy shared by the event retry loop (fixed) and the
//! startup dependency waits (exponential, capped).

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub ceiling: Duration,
    /// Upper bound on attempts; `None` leaves the bound to the caller (e.g. a wall-clock budget).
    pub max_attempts: Option<u32>,
}

impl Backoff {
    /// Same delay between every attempt.
    pub fn fixed(interval: Duration) -> Self {
        Self { initial: interval, factor: 1.0, ceiling: interval, max_attempts: None }
    }

    /// Doubling delay starting at `initial`, capped at `ceiling`, at most `max_attempts` tries.
    pub fn exponential(initial: Duration, ceiling: Duration, max_attempts: u32) -> Self {
        Self { initial, factor: 2.0, ceiling: ceiling.max(initial), max_attempts: Some(max_attempts) }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let base = self.initial.as_secs_f64() * self.factor.max(1.0).powi(exp);
        let capped = base.min(self.ceiling.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }
}

impl Default for Backoff {
    /// Startup waits: 12 tries, 1s doubling up to 30s.
    fn default() -> Self { Self::exponential(Duration::from_secs(1), Duration::from_secs(30), 12) }
}
