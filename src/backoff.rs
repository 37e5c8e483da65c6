//! Linear, capped retry backoff shared by the delivery queue and the
//! attribution reconciler.
//!
//! The n-th consecutive failure waits `min(n * step, max)`; with the default
//! config that is 100ms, 200ms, 300ms, 300ms, ...

use crate::config::BackoffConfig;
use std::time::Duration;

/// Delay before retry number `attempt` (1-based). Attempt 0 never waits.
pub fn delay_for(config: &BackoffConfig, attempt: u32) -> Duration {
    let step = config.step_ms.saturating_mul(attempt as u64);
    Duration::from_millis(step.min(config.max_ms))
}

/// Tracks consecutive failures for one retrying actor.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        delay_for(&self.config, self.attempts)
    }

    /// Forget previous failures after a success.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
