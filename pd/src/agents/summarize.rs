//! Summarization stage
//!
//! Produces brief/standard/detailed summaries from a single prompt
//! round-trip. The three levels must grow strictly in length; a response
//! violating that is an invalid-response and re-enters the retry loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{GuardedCall, StageContext, StageFailure, StageLogic, fingerprint_value, truncate_chars};
use crate::config::StageConfig;
use crate::llm::CompletionRequest;
use crate::pipeline::AgentKind;
use crate::prompts::PromptSet;

/// Characters of paper text shown to the summary prompt
const SUMMARY_TEXT_CAP: usize = 40_000;

pub struct SummaryLogic {
    prompts: Arc<PromptSet>,
    stage: StageConfig,
}

impl SummaryLogic {
    pub fn new(prompts: Arc<PromptSet>, stage: StageConfig) -> Self {
        Self { prompts, stage }
    }
}

#[async_trait]
impl StageLogic for SummaryLogic {
    fn kind(&self) -> AgentKind {
        AgentKind::Summarizer
    }

    fn validate_input(&self, input: &Value) -> Result<(), String> {
        match input.get("full-text").and_then(Value::as_str) {
            Some(text) if !text.trim().is_empty() => Ok(()),
            _ => Err("input requires non-empty full-text".to_string()),
        }
    }

    async fn fingerprint(&self, input: &Value) -> Result<Option<String>, StageFailure> {
        Ok(Some(fingerprint_value(self.kind(), input)))
    }

    async fn execute(
        &self,
        input: &Value,
        provider: &GuardedCall,
        ctx: &StageContext,
    ) -> Result<Value, StageFailure> {
        let text = input.get("full-text").and_then(Value::as_str).unwrap_or_default();
        let metadata = input.get("metadata").cloned().unwrap_or(Value::Null);

        let title = metadata.get("title").and_then(Value::as_str).unwrap_or("Untitled");
        let authors = metadata
            .get("authors")
            .and_then(Value::as_array)
            .map(|authors| {
                authors
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();

        let system = self
            .prompts
            .render("summary-system", &json!({}))
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;
        let prompt = self
            .prompts
            .render(
                "summary-user",
                &json!({
                    "title": title,
                    "authors": authors,
                    "text": truncate_chars(text, SUMMARY_TEXT_CAP),
                }),
            )
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;

        let request = CompletionRequest {
            system_prompt: system,
            prompt,
            max_tokens: self.stage.max_tokens,
            temperature: self.stage.temperature,
        };

        provider
            .complete_parsed(&request, ctx, |text| {
                let value = super::parse_json_response(text)?;
                validate_summaries(&value)?;
                Ok(value)
            })
            .await
            .map_err(|e| e.into_failure())
    }
}

/// Whitespace-token estimate for the length ordering check
fn token_estimate(text: &str) -> usize {
    text.split_whitespace().count()
}

fn validate_summaries(value: &Value) -> Result<(), String> {
    let mut lengths = Vec::with_capacity(3);
    for level in ["brief", "standard", "detailed"] {
        let summary = value
            .get(level)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("summary missing {level}"))?;
        if summary.trim().is_empty() {
            return Err(format!("{level} summary is empty"));
        }
        lengths.push(token_estimate(summary));
    }

    if !(lengths[0] <= lengths[1] && lengths[1] <= lengths[2]) {
        return Err(format!(
            "summary lengths not increasing: brief={} standard={} detailed={}",
            lengths[0], lengths[1], lengths[2]
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_summaries_accepts_increasing() {
        let value = json!({
            "brief": "one two",
            "standard": "one two three four",
            "detailed": "one two three four five six",
        });
        assert!(validate_summaries(&value).is_ok());
    }

    #[test]
    fn test_validate_summaries_rejects_shrinking() {
        let value = json!({
            "brief": "one two three four five",
            "standard": "one two",
            "detailed": "one two three",
        });
        assert!(validate_summaries(&value).is_err());
    }

    #[test]
    fn test_validate_summaries_rejects_missing_level() {
        let value = json!({"brief": "a", "standard": "a b"});
        let err = validate_summaries(&value).unwrap_err();
        assert!(err.contains("detailed"));
    }

    #[test]
    fn test_validate_summaries_rejects_empty() {
        let value = json!({"brief": " ", "standard": "a b", "detailed": "a b c"});
        assert!(validate_summaries(&value).is_err());
    }

    #[test]
    fn test_equal_lengths_allowed() {
        // brief <= standard <= detailed permits ties
        let value = json!({"brief": "a b", "standard": "a b", "detailed": "a b c"});
        assert!(validate_summaries(&value).is_ok());
    }
}
