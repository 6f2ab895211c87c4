//! Reconnect pacing of the session engine.

use std::time::Duration;

use rand::RngExt;

/// Exponential backoff settings, taken from [`ClientConfig`](crate::ClientConfig).
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BackoffConfig {
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) factor: f64,
    pub(crate) jitter: f64,
}

impl BackoffConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("Initial reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("Max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// Grows by `factor` up to `max_delay`; jitter pulls the delay towards a
    /// random point below it.
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let growth = self.factor.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let capped = (self.initial_delay.as_secs_f64() * growth).min(self.max_delay.as_secs_f64());
        if self.jitter == 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let random = rand::rng().random_range(0.0..=capped);
        Duration::from_secs_f64(capped + (random - capped) * self.jitter)
    }
}

/// Consecutive failed connect cycles of one session.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; grows until [`reset`](Self::reset).
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Called once a connection has been established.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }
}
