//! Per-provider circuit breaker

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::llm::ProviderKind;

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; outcomes fill a sliding window
    Closed,
    /// Calls fail fast until the cool-down elapses
    Open,
    /// A bounded number of probes test the provider
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// How a guarded call turned out, from the breaker's point of view
///
/// Rate limiting and validation failures are not health signals: the
/// provider answered. They are `Neutral` / `Success` respectively so a
/// noisy-but-alive provider never trips the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Provider answered but the outcome says nothing about health (429,
    /// exhausted quota)
    Neutral,
}

struct BreakerInner {
    state: CircuitState,
    /// Sliding window of outcomes in the closed state; true = failure
    window: VecDeque<bool>,
    opened_at: Instant,
    cool_down: Duration,
    probes_in_flight: usize,
    probe_successes: usize,
}

/// Three-state circuit breaker guarding one provider
///
/// State is process-wide and shared by every request; on restart the
/// breaker begins closed with an empty window.
pub struct CircuitBreaker {
    provider: ProviderKind,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: ProviderKind, config: BreakerConfig) -> Self {
        let cool_down = config.cool_down();
        Self {
            provider,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: Instant::now(),
                cool_down,
                probes_in_flight: 0,
                probe_successes: 0,
            }),
        }
    }

    /// Ask whether a call may proceed
    ///
    /// In the open state this flips to half-open once the cool-down has
    /// elapsed, and the asking call becomes the first probe. Callers that
    /// receive `true` must report the call's outcome via [`Self::record`].
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.opened_at.elapsed() >= inner.cool_down {
                    info!(provider = %self.provider, "Breaker half-open, probing");
                    inner.state = CircuitState::HalfOpen;
                    inner.probes_in_flight = 1;
                    inner.probe_successes = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_probes {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Report the outcome of an allowed call
    pub fn record(&self, outcome: Outcome) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match inner.state {
            CircuitState::Closed => {
                let failed = match outcome {
                    Outcome::Failure => true,
                    Outcome::Success => false,
                    Outcome::Neutral => return,
                };

                inner.window.push_back(failed);
                while inner.window.len() > self.config.window_size {
                    inner.window.pop_front();
                }

                if inner.window.len() >= self.config.window_size {
                    let failures = inner.window.iter().filter(|f| **f).count();
                    let ratio = failures as f64 / inner.window.len() as f64;
                    if ratio >= self.config.failure_threshold {
                        warn!(
                            provider = %self.provider,
                            failures,
                            window = inner.window.len(),
                            "Breaker opened"
                        );
                        inner.state = CircuitState::Open;
                        inner.opened_at = Instant::now();
                        inner.cool_down = self.config.cool_down();
                        inner.window.clear();
                    }
                }
            }
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                match outcome {
                    Outcome::Success => {
                        inner.probe_successes += 1;
                        if inner.probe_successes >= self.config.half_open_probes {
                            info!(provider = %self.provider, "Breaker closed");
                            inner.state = CircuitState::Closed;
                            inner.window.clear();
                            inner.cool_down = self.config.cool_down();
                        }
                    }
                    Outcome::Failure => {
                        let doubled = inner.cool_down * 2;
                        inner.cool_down = doubled.min(self.config.cool_down_ceiling());
                        warn!(
                            provider = %self.provider,
                            cool_down = ?inner.cool_down,
                            "Probe failed, breaker re-opened"
                        );
                        inner.state = CircuitState::Open;
                        inner.opened_at = Instant::now();
                    }
                    Outcome::Neutral => {}
                }
            }
            CircuitState::Open => {
                // Late result from a call that started before the circuit
                // opened; nothing to account
                debug!(provider = %self.provider, ?outcome, "Outcome after open, ignored");
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(window_size: usize, probes: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            ProviderKind::Anthropic,
            BreakerConfig {
                window_size,
                failure_threshold: 0.5,
                cool_down_ms: 30_000,
                cool_down_ceiling_ms: 300_000,
                half_open_probes: probes,
            },
        )
    }

    fn trip(b: &CircuitBreaker, calls: usize) {
        for _ in 0..calls {
            assert!(b.allow());
            b.record(Outcome::Failure);
        }
    }

    #[tokio::test]
    async fn test_stays_closed_below_window() {
        let b = breaker(20, 3);
        // 19 failures: window not yet full, circuit holds
        trip(&b, 19);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let b = breaker(20, 3);
        trip(&b, 20);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allow());
    }

    #[tokio::test]
    async fn test_failure_ratio_below_threshold_holds() {
        let b = breaker(4, 3);
        assert!(b.allow());
        b.record(Outcome::Failure);
        // One failure in a window of four stays under the 0.5 threshold
        for _ in 0..10 {
            assert!(b.allow());
            b.record(Outcome::Success);
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failure_ratio_at_threshold_opens() {
        let b = breaker(4, 3);
        for outcome in [Outcome::Failure, Outcome::Failure, Outcome::Success, Outcome::Success] {
            assert!(b.allow());
            b.record(outcome);
        }
        // 2/4 meets the >= 0.5 threshold exactly
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_neutral_outcomes_do_not_trip() {
        let b = breaker(4, 3);
        for _ in 0..50 {
            assert!(b.allow());
            b.record(Outcome::Neutral);
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cool_down() {
        let b = breaker(4, 3);
        trip(&b, 4);
        assert!(!b.allow());

        tokio::time::advance(Duration::from_secs(31)).await;

        // First allow after cool-down is a probe
        assert!(b.allow());
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_limit() {
        let b = breaker(4, 2);
        trip(&b, 4);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(b.allow());
        assert!(b.allow());
        // Probe quota spent
        assert!(!b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_close_circuit() {
        let b = breaker(4, 2);
        trip(&b, 4);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(b.allow());
        assert!(b.allow());
        b.record(Outcome::Success);
        b.record(Outcome::Success);

        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_doubles_cool_down() {
        let b = breaker(4, 2);
        trip(&b, 4);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(b.allow());
        b.record(Outcome::Failure);
        assert_eq!(b.state(), CircuitState::Open);

        // Old cool-down is no longer enough
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!b.allow());

        // Doubled cool-down (60s) has now elapsed
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cool_down_ceiling() {
        let b = CircuitBreaker::new(
            ProviderKind::Anthropic,
            BreakerConfig {
                window_size: 2,
                failure_threshold: 0.5,
                cool_down_ms: 30_000,
                cool_down_ceiling_ms: 60_000,
                half_open_probes: 1,
            },
        );
        trip(&b, 2);

        // Fail probes repeatedly; cool-down saturates at the ceiling
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(61)).await;
            assert!(b.allow());
            b.record(Outcome::Failure);
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_resets_failure_window() {
        let b = breaker(4, 1);
        trip(&b, 4);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(b.allow());
        b.record(Outcome::Success);
        assert_eq!(b.state(), CircuitState::Closed);

        // The pre-open failures are gone; fresh failures must fill a
        // whole new window before the circuit opens again
        for _ in 0..3 {
            assert!(b.allow());
            b.record(Outcome::Failure);
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
