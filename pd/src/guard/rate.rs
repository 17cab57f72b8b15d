//! Per-provider token-bucket rate limiter

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::RateLimiterConfig;
use crate::llm::ProviderKind;

/// Why an acquisition did not produce a permit
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcquireError {
    /// Waiter queue is at the high-water mark; fail fast instead of
    /// queueing. Counts as a circuit-breaker failure.
    #[error("provider-overloaded")]
    Overloaded,

    /// The caller's request was cancelled while waiting
    #[error("cancelled")]
    Cancelled,
}

struct Waiter {
    id: u64,
    notify: Arc<Notify>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

impl Bucket {
    fn refill(&mut self, now: Instant, config: &RateLimiterConfig) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_per_sec).min(config.capacity as f64);
        self.last_refill = now;
    }
}

/// Token bucket for one provider
///
/// `acquire` suspends until a permit is available, serving waiters
/// first-come-first-served; `try_acquire` never suspends. The bucket
/// starts empty and fills at the configured rate, which is the
/// conservative restart default for [`crate::llm::ProviderKind`] state.
pub struct RateLimiter {
    provider: ProviderKind,
    config: RateLimiterConfig,
    inner: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(provider: ProviderKind, config: RateLimiterConfig) -> Self {
        Self {
            provider,
            inner: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
                queue: VecDeque::new(),
                next_waiter_id: 0,
            }),
            config,
        }
    }

    /// Take a permit without waiting; false when none is available or
    /// other callers are already queued
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.inner.lock().expect("rate limiter lock poisoned");
        bucket.refill(Instant::now(), &self.config);

        if bucket.queue.is_empty() && bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return true;
        }
        false
    }

    /// Wait for a permit, honoring cancellation
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<(), AcquireError> {
        // Fast path, or join the queue
        let (id, notify) = {
            let mut bucket = self.inner.lock().expect("rate limiter lock poisoned");
            bucket.refill(Instant::now(), &self.config);

            if bucket.queue.is_empty() && bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return Ok(());
            }

            if bucket.queue.len() >= self.config.high_water {
                warn!(provider = %self.provider, waiters = bucket.queue.len(), "Rate limiter overloaded");
                return Err(AcquireError::Overloaded);
            }

            let id = bucket.next_waiter_id;
            bucket.next_waiter_id += 1;
            let notify = Arc::new(Notify::new());
            bucket.queue.push_back(Waiter {
                id,
                notify: notify.clone(),
            });
            debug!(provider = %self.provider, waiter = id, queued = bucket.queue.len(), "Waiting for permit");
            (id, notify)
        };

        loop {
            let sleep_for = {
                let mut bucket = self.inner.lock().expect("rate limiter lock poisoned");
                bucket.refill(Instant::now(), &self.config);

                let front_is_me = bucket.queue.front().map(|w| w.id == id).unwrap_or(false);
                if front_is_me && bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    bucket.queue.pop_front();
                    // Pass any surplus on to the next in line
                    if bucket.tokens >= 1.0
                        && let Some(next) = bucket.queue.front()
                    {
                        next.notify.notify_one();
                    }
                    return Ok(());
                }

                // Sleep until roughly when our queue position is funded
                let position = bucket.queue.iter().position(|w| w.id == id).unwrap_or(0);
                let needed = (position as f64 + 1.0) - bucket.tokens;
                let secs = if self.config.refill_per_sec > 0.0 {
                    (needed / self.config.refill_per_sec).max(0.005)
                } else {
                    60.0
                };
                Duration::from_secs_f64(secs.min(60.0))
            };

            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => {
                    let mut bucket = self.inner.lock().expect("rate limiter lock poisoned");
                    bucket.queue.retain(|w| w.id != id);
                    // Our wakeup may have been consumed; pass it along
                    if let Some(next) = bucket.queue.front() {
                        next.notify.notify_one();
                    }
                    debug!(provider = %self.provider, waiter = id, "Acquire cancelled");
                    return Err(AcquireError::Cancelled);
                }
            }
        }
    }

    /// Current waiter-queue depth
    pub fn waiters(&self) -> usize {
        self.inner.lock().expect("rate limiter lock poisoned").queue.len()
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }
}
