//! Provider guards: rate limiting, circuit breaking, retry
//!
//! One [`RateLimiter`] and one [`CircuitBreaker`] exist per configured
//! provider, shared process-wide across every pipeline request. The
//! [`RetryPolicy`] is stateless and shared by all agents.

mod breaker;
mod rate;
mod retry;

pub use breaker::{CircuitBreaker, CircuitState, Outcome};
pub use rate::{AcquireError, RateLimiter};
pub use retry::{RetryError, RetryPolicy};

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::llm::ProviderKind;

/// Process-wide guard state for every enabled provider
pub struct ProviderGuards {
    limiters: HashMap<ProviderKind, Arc<RateLimiter>>,
    breakers: HashMap<ProviderKind, Arc<CircuitBreaker>>,
}

impl ProviderGuards {
    /// Build guards for the providers enabled in config
    pub fn from_config(config: &Config) -> Self {
        let mut limiters = HashMap::new();
        let mut breakers = HashMap::new();

        for kind in config.enabled_providers() {
            limiters.insert(kind, Arc::new(RateLimiter::new(kind, config.limiter(kind))));
            breakers.insert(kind, Arc::new(CircuitBreaker::new(kind, config.breaker(kind))));
        }

        Self { limiters, breakers }
    }

    pub fn limiter(&self, kind: ProviderKind) -> Option<Arc<RateLimiter>> {
        self.limiters.get(&kind).cloned()
    }

    pub fn breaker(&self, kind: ProviderKind) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(&kind).cloned()
    }
}
