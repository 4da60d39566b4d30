//! Retry pacing for recovery loops.
//!
//! Recovery never gives up on its own: the policy only decides how long to
//! wait before the next attempt. The first few attempts use a short
//! randomized delay so a fleet of sidecars does not redial in lockstep; later
//! attempts grow exponentially until the window's upper bound.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::StreamError;

/// Inclusive `[min, max]` delay window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffWindow {
    pub min: Duration,
    pub max: Duration,
}

impl BackoffWindow {
    pub const fn from_millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    /// Returns whether the window is usable (non-zero upper bound, ordered bounds).
    pub fn is_valid(&self) -> bool {
        !self.max.is_zero() && self.min <= self.max
    }

    /// Picks a uniformly random delay inside the window.
    pub fn jittered(&self) -> Duration {
        jitter_between(self.min, self.max)
    }
}

/// Configuration of a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts paced with a short randomized delay before exponential growth starts.
    pub immediate_retries: u32,
    /// Bounds applied to every computed delay.
    pub window: BackoffWindow,
}

impl Default for RetryConfig {
    /// 5 quick attempts inside a 500 ms – 15 s window.
    fn default() -> Self {
        Self {
            immediate_retries: 5,
            window: BackoffWindow::from_millis(500, 15_000),
        }
    }
}

/// Tracks attempts of one recovery episode and paces the next one.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempts: u32,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Registers a failed attempt and returns how long to wait before the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let window = self.config.window;
        if self.attempts <= self.config.immediate_retries {
            let upper = window.min.saturating_mul(2).min(window.max);
            return jitter_between(window.min, upper);
        }

        let exponent = (self.attempts - self.config.immediate_retries).min(16);
        let ceiling = window
            .min
            .saturating_mul(1u32 << exponent)
            .clamp(window.min, window.max);
        // Keep the upper half of the exponential step so waits keep growing.
        jitter_between((ceiling / 2).max(window.min), ceiling)
    }

    /// Sleeps for the next delay unless `cancel` fires first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), StreamError> {
        let delay = self.next_delay();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StreamError::Shutdown),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Starts a new episode.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

fn jitter_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(fastrand::u64(min_ms..=max_ms))
}
