//! Provider error types and classification

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by provider adapters
///
/// Every adapter maps its wire-level failures into this taxonomy; the
/// retry policy and circuit breaker route on the variant, never on
/// provider-specific details.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network faults, 5xx responses - retryable
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Explicit 429; retry after the provider-supplied delay when present
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Billing-period quota exhausted - not retryable this period
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Caller bug (malformed request) - not retryable
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Structural provider failure, or the circuit is open - skip retries
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Response failed schema validation - retryable, never falls back
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Per-call timeout elapsed
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Produced by the guard layer, not adapters: the limiter's waiter
    /// queue hit its high-water mark
    #[error("rate limiter overloaded: {0}")]
    Overloaded(String),

    /// Produced by the guard layer, not adapters: the request was
    /// cancelled during the call
    #[error("call cancelled")]
    Cancelled,
}

impl LlmError {
    /// Whether the retry policy may attempt this call again
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Transient(_) => true,
            LlmError::RateLimited { .. } => true,
            LlmError::InvalidResponse(_) => true,
            LlmError::Timeout(_) => true,
            LlmError::Network(_) => true,
            LlmError::Overloaded(_) => true,
            LlmError::QuotaExhausted(_) => false,
            LlmError::InvalidRequest(_) => false,
            LlmError::Unavailable(_) => false,
            LlmError::Cancelled => false,
        }
    }

    /// Whether exhaustion of this error may route to the fallback agent
    ///
    /// Invalid responses never fall back: the local model would face the
    /// same output schema. Caller bugs are surfaced, not papered over.
    pub fn allows_fallback(&self) -> bool {
        match self {
            LlmError::Transient(_) => true,
            LlmError::RateLimited { .. } => true,
            LlmError::QuotaExhausted(_) => true,
            LlmError::Unavailable(_) => true,
            LlmError::Timeout(_) => true,
            LlmError::Network(_) => true,
            LlmError::Overloaded(_) => true,
            LlmError::InvalidResponse(_) => false,
            LlmError::InvalidRequest(_) => false,
            LlmError::Cancelled => false,
        }
    }

    /// Whether this outcome counts as a failure for the circuit breaker
    ///
    /// A 429 means the provider answered, so it is breaker-neutral; a
    /// validation failure means the provider answered with *something*,
    /// which counts as breaker success.
    pub fn counts_for_breaker(&self) -> bool {
        match self {
            LlmError::Transient(_) => true,
            LlmError::Timeout(_) => true,
            LlmError::Network(_) => true,
            LlmError::Unavailable(_) => true,
            LlmError::Overloaded(_) => true,
            LlmError::RateLimited { .. } => false,
            LlmError::QuotaExhausted(_) => false,
            LlmError::InvalidRequest(_) => false,
            LlmError::InvalidResponse(_) => false,
            LlmError::Cancelled => false,
        }
    }

    /// Provider-indicated retry delay, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Stable slug used in task error text and stage results
    pub fn reason(&self) -> &'static str {
        match self {
            LlmError::Transient(_) | LlmError::Network(_) | LlmError::Timeout(_) => {
                "provider-transient"
            }
            LlmError::RateLimited { .. } => "provider-rate-limited",
            LlmError::QuotaExhausted(_) => "provider-quota-exhausted",
            LlmError::InvalidRequest(_) => "invalid-input",
            LlmError::Unavailable(_) => "provider-unavailable",
            LlmError::InvalidResponse(_) => "invalid-response",
            LlmError::Overloaded(_) => "provider-overloaded",
            LlmError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::Transient("502".into()).is_retryable());
        assert!(LlmError::RateLimited { retry_after: None }.is_retryable());
        assert!(LlmError::InvalidResponse("bad json".into()).is_retryable());
        assert!(LlmError::Timeout(Duration::from_secs(60)).is_retryable());

        assert!(!LlmError::QuotaExhausted("billing".into()).is_retryable());
        assert!(!LlmError::InvalidRequest("bad prompt".into()).is_retryable());
        assert!(!LlmError::Unavailable("circuit open".into()).is_retryable());
    }

    #[test]
    fn test_fallback_routing() {
        assert!(LlmError::Transient("503".into()).allows_fallback());
        assert!(LlmError::QuotaExhausted("billing".into()).allows_fallback());
        assert!(LlmError::Unavailable("circuit open".into()).allows_fallback());

        // Same schema on the local model - no point falling back
        assert!(!LlmError::InvalidResponse("bad json".into()).allows_fallback());
        assert!(!LlmError::InvalidRequest("caller bug".into()).allows_fallback());
    }

    #[test]
    fn test_breaker_accounting() {
        assert!(LlmError::Transient("500".into()).counts_for_breaker());
        assert!(LlmError::Timeout(Duration::from_secs(60)).counts_for_breaker());
        assert!(LlmError::Overloaded("queue full".into()).counts_for_breaker());

        // The provider responded - not a health signal
        assert!(!LlmError::RateLimited { retry_after: None }.counts_for_breaker());
        assert!(!LlmError::InvalidResponse("bad".into()).counts_for_breaker());
    }

    #[test]
    fn test_retry_after() {
        let err = LlmError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(LlmError::Transient("x".into()).retry_after(), None);
    }

    #[test]
    fn test_reason_slugs() {
        assert_eq!(LlmError::Transient("x".into()).reason(), "provider-transient");
        assert_eq!(
            LlmError::RateLimited { retry_after: None }.reason(),
            "provider-rate-limited"
        );
        assert_eq!(LlmError::Unavailable("x".into()).reason(), "provider-unavailable");
    }
}
