use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capped exponential backoff between attempts of one call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_base: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 250,
            backoff_base: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based)
    ///
    /// `min(initial * base^(attempt - 1), max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_base.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);

        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempt` failed
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
