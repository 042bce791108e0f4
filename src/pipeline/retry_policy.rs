//! Retry policy for failed artifact jobs.
//!
//! Implements exponential backoff with configurable parameters.

use crate::config::PipelineSettings;
use crate::pipeline::models::ArtifactErrorKind;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts before the key is permanently failed.
    pub max_attempts: u32,
    /// Initial backoff duration in seconds.
    pub initial_backoff_secs: u64,
    /// Maximum backoff duration in seconds (cap for exponential growth).
    pub max_backoff_secs: u64,
    /// Multiplier applied to backoff after each attempt.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(config: &PipelineSettings) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff_secs: config.initial_backoff_secs,
            max_backoff_secs: config.max_backoff_secs,
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// Check if a failed attempt should be retried.
    ///
    /// Returns true if the error kind is retryable and fewer than
    /// `max_attempts` attempts have been made.
    pub fn should_retry(&self, kind: ArtifactErrorKind, attempts: u32) -> bool {
        kind.is_retryable() && attempts < self.max_attempts
    }

    /// Backoff duration in seconds before the given attempt number re-runs.
    ///
    /// Uses exponential backoff: `initial * multiplier^(attempts - 1)`,
    /// capped at `max_backoff_secs`.
    pub fn backoff_secs(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_backoff_secs as f64) as u64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 5,
            max_backoff_secs: 300, // 5 minutes
            backoff_multiplier: 2.0,
        }
    }
}
