//! Retry policy for failed jobs.
//!
//! Implements exponential backoff with configurable parameters.

use crate::config::RetrySettings;

/// Exponential backoff applied when a failed job is requeued.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Cap for the exponential growth, in milliseconds.
    pub max_backoff_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            initial_backoff_ms: settings.initial_backoff_ms,
            max_backoff_ms: settings.max_backoff_ms,
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// Requeue immediately. Used by tests and by deployments that rely on
    /// the poll interval alone.
    pub fn immediate() -> Self {
        Self {
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before the next attempt, given how many retries already happened.
    ///
    /// `initial_backoff * multiplier^retry_count`, capped at `max_backoff_ms`.
    pub fn backoff_ms(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.min(64) as i32;
        let backoff = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_backoff_ms as f64).max(0.0) as u64
    }

    /// Timestamp (ms) at which a job that failed `retry_count` times may run again.
    pub fn next_attempt_at(&self, now: i64, retry_count: u32) -> i64 {
        now.saturating_add(self.backoff_ms(retry_count) as i64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetrySettings::default())
    }
}
