//! Quality assessment stage
//!
//! Scores a summary against the paper text. Low scores warn but never
//! fail the stage; a bad summary is information, not an error.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use super::{GuardedCall, StageContext, StageFailure, StageLogic, fingerprint_value, truncate_chars};
use crate::config::StageConfig;
use crate::llm::CompletionRequest;
use crate::pipeline::AgentKind;
use crate::prompts::PromptSet;

/// Characters of paper text shown to the quality prompt
const QUALITY_TEXT_CAP: usize = 30_000;

pub struct QualityLogic {
    prompts: Arc<PromptSet>,
    stage: StageConfig,
    /// Scores below this log a soft warning
    floor: f64,
}

impl QualityLogic {
    pub fn new(prompts: Arc<PromptSet>, stage: StageConfig, floor: f64) -> Self {
        Self { prompts, stage, floor }
    }
}

#[async_trait]
impl StageLogic for QualityLogic {
    fn kind(&self) -> AgentKind {
        AgentKind::QualityChecker
    }

    fn validate_input(&self, input: &Value) -> Result<(), String> {
        let has_summary = input
            .get("summary")
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        let has_text = input
            .get("full-text")
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);

        if !has_summary {
            return Err("input requires non-empty summary".to_string());
        }
        if !has_text {
            return Err("input requires non-empty full-text".to_string());
        }
        Ok(())
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
        let summary = input.get("summary").and_then(Value::as_str).unwrap_or_default();
        let text = input.get("full-text").and_then(Value::as_str).unwrap_or_default();

        let system = self
            .prompts
            .render("quality-system", &json!({}))
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;
        let prompt = self
            .prompts
            .render(
                "quality-user",
                &json!({
                    "summary": summary,
                    "text": truncate_chars(text, QUALITY_TEXT_CAP),
                }),
            )
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;

        let request = CompletionRequest {
            system_prompt: system,
            prompt,
            max_tokens: self.stage.max_tokens,
            temperature: self.stage.temperature,
        };

        let (score, issues) = provider
            .complete_parsed(&request, ctx, |text| {
                let value = super::parse_json_response(text)?;
                let score = value.get("score").and_then(Value::as_f64).ok_or("missing score")?;
                let issues = value
                    .get("issues")
                    .and_then(Value::as_array)
                    .ok_or("missing issues array")?;

                let issues: Vec<String> = issues
                    .iter()
                    .map(|issue| issue.as_str().map(str::to_string).ok_or("issue is not a string"))
                    .collect::<Result<_, _>>()?;

                Ok((score.clamp(0.0, 1.0), issues))
            })
            .await
            .map_err(|e| e.into_failure())?;

        if score < self.floor {
            warn!(score, floor = self.floor, issue_count = issues.len(), "Summary quality below floor");
        }

        Ok(json!({"score": score, "issues": issues}))
    }
}
