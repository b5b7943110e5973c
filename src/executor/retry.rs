//! Retry budget and backoff curve.

use std::time::Duration;

use super::task::TaskError;

/// Capped exponential backoff: `base * 2^(attempt - 1)`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub base: Duration,
  pub max: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base: Duration::from_millis(500),
      max: Duration::from_secs(60),
    }
  }
}

impl RetryPolicy {
  pub fn new(base: Duration, max: Duration) -> Self {
    Self { base, max }
  }

  /// Delay before the retry that follows failed attempt `attempt` (1-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    self
      .base
      .checked_mul(1u32 << exponent)
      .map_or(self.max, |delay| delay.min(self.max))
  }

  /// Whether a task that just failed attempt `attempt` gets another one.
  ///
  /// `max_retries` counts retries, so a task runs at most `max_retries + 1`
  /// times. Fatal errors and cancellations never retry.
  pub fn should_retry(&self, attempt: u32, max_retries: u32, error: &TaskError) -> bool {
    error.is_retryable() && attempt <= max_retries
  }
}
