//! Deterministic, capped backoff schedule
//!
//! Every reconnect attempt in the relay sleeps according to the same
//! schedule. The schedule is a pure function of the attempt number so that
//! tests can assert on it exactly; there is no jitter.

use crate::error::StageError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff bounded by `max_delay`
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay for the first attempt
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Growth factor per attempt (values below 1.0 are treated as 1.0)
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::five_sec()
    }
}

impl Backoff {
    /// Schedule starting at 500ms and capped at five seconds
    pub fn five_sec() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 1.5,
        }
    }

    /// Delay before retry number `attempt` (1-indexed)
    ///
    /// Attempt 0 returns zero. The sequence is non-decreasing and never
    /// exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = self.multiplier.max(1.0);
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let base_us = self.initial_delay.as_micros() as f64 * multiplier.powi(exponent);
        let capped_us = base_us.min(self.max_delay.as_micros() as f64);

        Duration::from_micros(capped_us as u64)
    }

    /// Sleep for the attempt's delay unless `cancel` fires first
    ///
    /// Returns [`StageError::Cancelled`] as soon as cancellation is observed,
    /// including when it was already active before the call.
    pub async fn sleep(&self, cancel: &CancellationToken, attempt: u32) -> Result<(), StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let delay = self.delay_for_attempt(attempt);
        tokio::select! {
            _ = cancel.cancelled() => Err(StageError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
