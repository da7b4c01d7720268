/*!
 * Retry logic with exponential backoff for individual part operations
 */

use crate::error::{Result, TransferError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear increase in delay
    Linear,

    /// Exponential increase in delay (2^n)
    Exponential,

    /// Exponential with random jitter
    #[default]
    ExponentialWithJitter,
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per part, including the first (1 = no retry)
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Backoff strategy to use
    pub backoff: BackoffStrategy,

    /// Jitter factor (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// A policy that runs every operation exactly once
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Reject settings that cannot produce a delay
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TransferError::InvalidArgument(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(TransferError::InvalidArgument(format!(
                "retry jitter_factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }

    /// Calculate delay before retry number `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_delay_ms);
        let base_delay = match self.backoff {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Linear => initial * attempt,
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(multiplier)
            }
        };

        let capped_delay = base_delay.min(Duration::from_millis(self.max_delay_ms));

        if self.backoff == BackoffStrategy::ExponentialWithJitter
            && self.jitter_factor.is_finite()
            && self.jitter_factor > 0.0
        {
            let jitter = rand::rng().random_range(0.0..self.jitter_factor.min(1.0));
            capped_delay + Duration::from_secs_f64(capped_delay.as_secs_f64() * jitter)
        } else {
            capped_delay
        }
    }
}

/// Run `operation`, repeating it while it fails with a retryable error.
///
/// The closure receives the 1-based attempt number. Non-retryable errors and
/// the last attempt's error are returned as-is.
pub fn with_retry<T, F>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.calculate_delay(attempt);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient failure"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
