//! Bounded exponential backoff with jitter

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::RetryConfig;
use crate::llm::LlmError;

/// Why a retried operation stopped
#[derive(Debug)]
pub enum RetryError {
    /// All permitted attempts failed; carries the last primary error
    Exhausted { last_error: LlmError, attempts: u32 },

    /// The stage budget (or request deadline) would be overrun
    DeadlineExceeded,

    /// The request was cancelled between attempts
    Cancelled,
}

/// Retry policy wrapping one guarded provider call
///
/// Delays grow as `base * multiplier^(attempt-1)`, jittered by the
/// configured fraction. A provider-supplied retry-after hint wins when it
/// is larger than the computed backoff. Rate-limited attempts consume
/// retry budget like any other retryable failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Backoff delay before the attempt following `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.config.base_delay_ms as f64 * exp;
        let jitter = 1.0 + self.config.jitter_fraction * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_millis((base * jitter).max(0.0) as u64)
    }

    /// Run `op` until it succeeds, a non-retryable error surfaces, the
    /// attempt budget is spent, or the deadline/cancellation fires
    pub async fn run<T, F, Fut>(&self, cancel: &CancelToken, deadline: Instant, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let max_attempts = self.max_attempts();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(RetryError::DeadlineExceeded);
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retryable() || attempt == max_attempts {
                        debug!(attempt, %error, "Retries stopped");
                        return Err(RetryError::Exhausted {
                            last_error: error,
                            attempts: attempt,
                        });
                    }

                    let backoff = self.backoff_delay(attempt);
                    let delay = error.retry_after().map_or(backoff, |hint| hint.max(backoff));

                    if Instant::now() + delay >= deadline {
                        warn!(attempt, ?delay, "Deadline before next attempt");
                        return Err(RetryError::DeadlineExceeded);
                    }

                    debug!(attempt, ?delay, %error, "Retrying after delay");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    }
                }
            }
        }

        // max_attempts >= 1, so the loop always returns
        unreachable!("retry loop exited without a result")
    }
}
