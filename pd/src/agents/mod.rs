//! Pipeline agents
//!
//! Each stage kind has one [`StageLogic`] implementation (prompt
//! construction + response validation). The shared [`runner`] wraps every
//! logic with the behavior common to all agents: task-store replay,
//! fingerprint memoization, guarded provider calls, and settlement.
//! Shared behaviors are composed here rather than inherited.

mod citations;
mod concepts;
mod discovery;
mod extract;
mod fallback;
mod metadata;
mod quality;
mod runner;
mod summarize;

pub use citations::CitationLogic;
pub use concepts::ConceptLogic;
pub use discovery::DiscoveryLogic;
pub use extract::ExtractLogic;
pub use fallback::{FALLBACK_STAGES, FallbackRegistry};
pub use metadata::{CrossrefResolver, Identifier, IdentifierResolver, MetadataLogic};
pub use quality::QualityLogic;
pub use runner::{CallError, GuardedCall, ProviderAgent};
pub use summarize::SummaryLogic;

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use paperstore::AgentTask;

use crate::cancel::CancelToken;
use crate::llm::TokenUsage;
use crate::pipeline::AgentKind;

/// Per-dispatch context handed to an agent
///
/// Carries only what one stage execution needs: cancellation, the
/// effective deadline (the tightest of stage budget and request
/// deadline), and a usage accumulator.
#[derive(Clone)]
pub struct StageContext {
    pub cancel: CancelToken,
    pub deadline: tokio::time::Instant,
    usage: Arc<Mutex<TokenUsage>>,
}

impl StageContext {
    pub fn new(cancel: CancelToken, deadline: tokio::time::Instant) -> Self {
        Self {
            cancel,
            deadline,
            usage: Arc::new(Mutex::new(TokenUsage::default())),
        }
    }

    pub fn add_usage(&self, usage: TokenUsage) {
        self.usage.lock().expect("usage lock poisoned").add(usage);
    }

    pub fn usage(&self) -> TokenUsage {
        *self.usage.lock().expect("usage lock poisoned")
    }
}

/// A stage failure as a value
#[derive(Debug, Clone)]
pub struct StageFailure {
    /// Stable slug from the error taxonomy ("provider-transient", ...)
    pub reason: String,

    /// Human-readable detail
    pub message: String,

    /// Whether the retry policy may route this to a fallback agent
    pub fallback_eligible: bool,
}

impl StageFailure {
    pub fn new(reason: impl Into<String>, message: impl Into<String>, fallback_eligible: bool) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
            fallback_eligible,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new("invalid-input", message, false)
    }

    pub fn cancelled() -> Self {
        Self::new("cancelled", "", false)
    }

    pub fn deadline_exceeded() -> Self {
        Self::new("deadline-exceeded", "", false)
    }

    pub fn upstream_failed(dep: AgentKind) -> Self {
        Self::new("upstream-failed", format!("dependency {dep} failed"), false)
    }

    /// Error text persisted on the task record
    pub fn task_error(&self) -> String {
        if self.message.is_empty() {
            self.reason.clone()
        } else {
            format!("{}: {}", self.reason, self.message)
        }
    }
}

/// Outcome of one stage execution
#[derive(Debug, Clone)]
pub struct StageResult {
    pub kind: AgentKind,
    pub payload: Option<serde_json::Value>,
    pub failure: Option<StageFailure>,
    pub used_fallback: bool,
    pub primary_failure_reason: Option<String>,
    pub usage: TokenUsage,
    pub elapsed: Duration,
}

impl StageResult {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn success(kind: AgentKind, payload: serde_json::Value, usage: TokenUsage, elapsed: Duration) -> Self {
        Self {
            kind,
            payload: Some(payload),
            failure: None,
            used_fallback: false,
            primary_failure_reason: None,
            usage,
            elapsed,
        }
    }

    pub fn failed(kind: AgentKind, failure: StageFailure, usage: TokenUsage, elapsed: Duration) -> Self {
        Self {
            kind,
            payload: None,
            failure: Some(failure),
            used_fallback: false,
            primary_failure_reason: None,
            usage,
            elapsed,
        }
    }
}

/// A single pipeline stage
#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Run one task to a settled stage result
    ///
    /// The only permitted side effects are task-store upserts for this
    /// task id (and the memoization write on success).
    async fn process(&self, task: &AgentTask, ctx: &StageContext) -> StageResult;
}

/// Stage-specific behavior behind the shared runner
#[async_trait]
pub trait StageLogic: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Reject malformed input before any provider call
    fn validate_input(&self, input: &serde_json::Value) -> Result<(), String>;

    /// Content fingerprint for memoization; None disables memoization
    async fn fingerprint(&self, input: &serde_json::Value) -> Result<Option<String>, StageFailure>;

    /// Produce the stage payload via guarded provider calls
    async fn execute(
        &self,
        input: &serde_json::Value,
        provider: &GuardedCall,
        ctx: &StageContext,
    ) -> Result<serde_json::Value, StageFailure>;
}

/// Hex fingerprint over raw bytes
pub fn fingerprint_bytes(data: &[u8]) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Hex fingerprint over a stage input, namespaced by stage kind
///
/// serde_json maps are sorted, so serialization is canonical for
/// equal values.
pub fn fingerprint_value(kind: AgentKind, value: &serde_json::Value) -> String {
    let serialized = serde_json::to_string(value).unwrap_or_default();
    format!("{}:{}", kind.as_str(), fingerprint_bytes(serialized.as_bytes()))
}

/// Truncate to a character budget on a char boundary
pub fn truncate_chars(text: &str, cap: usize) -> &str {
    match text.char_indices().nth(cap) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Truncate every string field of an input object (fallback-path cap)
pub fn truncate_input_strings(input: &serde_json::Value, cap: usize) -> serde_json::Value {
    match input {
        serde_json::Value::String(s) => serde_json::Value::String(truncate_chars(s, cap).to_string()),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_input_strings(v, cap)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| truncate_input_strings(v, cap)).collect())
        }
        other => other.clone(),
    }
}

/// Extract a JSON value from model output
///
/// Models wrap JSON in prose or code fences often enough that direct
/// parsing is only the first try.
pub fn parse_json_response(text: &str) -> Result<serde_json::Value, String> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    // Fenced block
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```")
            && let Ok(value) = serde_json::from_str(after[..end].trim())
        {
            return Ok(value);
        }
    }

    // First bracketed span
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let Some(start) = trimmed.find(open)
            && let Some(end) = trimmed.rfind(close)
            && start < end
            && let Ok(value) = serde_json::from_str(&trimmed[start..=end])
        {
            return Ok(value);
        }
    }

    Err(format!("no parseable JSON in response ({} chars)", text.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_stable_and_distinct() {
        let a = fingerprint_bytes(b"hello");
        assert_eq!(a, fingerprint_bytes(b"hello"));
        assert_ne!(a, fingerprint_bytes(b"world"));
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_fingerprint_value_namespaced() {
        let input = json!({"paper-id": "p-1"});
        let a = fingerprint_value(AgentKind::Summarizer, &input);
        let b = fingerprint_value(AgentKind::QualityChecker, &input);
        assert_ne!(a, b);
        assert!(a.starts_with("summarizer:"));
    }

    #[test]
    fn test_fingerprint_value_ignores_key_order() {
        let a = serde_json::from_str::<serde_json::Value>(r#"{"a": 1, "b": 2}"#).unwrap();
        let b = serde_json::from_str::<serde_json::Value>(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(
            fingerprint_value(AgentKind::Summarizer, &a),
            fingerprint_value(AgentKind::Summarizer, &b)
        );
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("hello", 10), "hello");
        // Multi-byte chars are not split
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }

    #[test]
    fn test_truncate_input_strings_recurses() {
        let input = json!({
            "full-text": "abcdefgh",
            "nested": {"summary": "12345678"},
            "count": 7,
        });
        let truncated = truncate_input_strings(&input, 4);
        assert_eq!(truncated["full-text"], "abcd");
        assert_eq!(truncated["nested"]["summary"], "1234");
        assert_eq!(truncated["count"], 7);
    }

    #[test]
    fn test_parse_json_direct() {
        assert_eq!(parse_json_response(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_parse_json_fenced() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nanything else?";
        assert_eq!(parse_json_response(text).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_parse_json_embedded() {
        let text = "The result is {\"score\": 0.9, \"issues\": []} as requested.";
        assert_eq!(
            parse_json_response(text).unwrap(),
            json!({"score": 0.9, "issues": []})
        );
    }

    #[test]
    fn test_parse_json_array() {
        let text = "[{\"title\": \"t\"}]";
        assert!(parse_json_response(text).unwrap().is_array());
    }

    #[test]
    fn test_parse_json_garbage_errors() {
        assert!(parse_json_response("no json here").is_err());
    }

    #[test]
    fn test_task_error_format() {
        assert_eq!(StageFailure::cancelled().task_error(), "cancelled");
        assert_eq!(
            StageFailure::invalid_input("missing paper-id").task_error(),
            "invalid-input: missing paper-id"
        );
    }
}
