//! Concept explanation stage
//!
//! Maps technical terms to explanations. Output iterates in sorted term
//! order, so identical input yields identical payloads byte-for-byte.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{GuardedCall, StageContext, StageFailure, StageLogic, fingerprint_value, truncate_chars};
use crate::config::StageConfig;
use crate::llm::CompletionRequest;
use crate::pipeline::AgentKind;
use crate::prompts::PromptSet;

/// Characters of paper text shown to the concepts prompt
const CONCEPTS_TEXT_CAP: usize = 30_000;

pub struct ConceptLogic {
    prompts: Arc<PromptSet>,
    stage: StageConfig,
}

impl ConceptLogic {
    pub fn new(prompts: Arc<PromptSet>, stage: StageConfig) -> Self {
        Self { prompts, stage }
    }
}

#[async_trait]
impl StageLogic for ConceptLogic {
    fn kind(&self) -> AgentKind {
        AgentKind::ConceptExplainer
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
        let key_terms = input
            .get("key-terms")
            .and_then(Value::as_array)
            .map(|terms| {
                terms
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .filter(|joined| !joined.is_empty());

        let system = self
            .prompts
            .render("concepts-system", &json!({}))
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;
        let prompt = self
            .prompts
            .render(
                "concepts-user",
                &json!({
                    "key_terms": key_terms,
                    "text": truncate_chars(text, CONCEPTS_TEXT_CAP),
                }),
            )
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;

        let request = CompletionRequest {
            system_prompt: system,
            prompt,
            max_tokens: self.stage.max_tokens,
            temperature: self.stage.temperature,
        };

        let explanations = provider
            .complete_parsed(&request, ctx, |text| {
                let value = super::parse_json_response(text)?;
                let object = value.as_object().ok_or("concept map is not an object")?;
                if object.is_empty() {
                    return Err("concept map is empty".to_string());
                }

                // BTreeMap gives the deterministic iteration order the
                // payload promises
                let mut sorted = BTreeMap::new();
                for (term, explanation) in object {
                    let explanation = explanation.as_str().ok_or("explanation is not a string")?;
                    if explanation.trim().is_empty() {
                        return Err(format!("empty explanation for {term}"));
                    }
                    sorted.insert(term.clone(), explanation.to_string());
                }
                Ok(sorted)
            })
            .await
            .map_err(|e| e.into_failure())?;

        Ok(json!({"concepts": explanations}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_input() {
        let logic = ConceptLogic::new(
            Arc::new(crate::prompts::PromptSet::embedded()),
            StageConfig::for_stage(AgentKind::ConceptExplainer),
        );
        assert!(logic.validate_input(&json!({"full-text": "t"})).is_ok());
        assert!(logic.validate_input(&json!({"full-text": ""})).is_err());
    }

    #[test]
    fn test_deterministic_order_via_sorted_map() {
        // Same payload regardless of model output order
        let a: BTreeMap<String, String> = [("zeta", "z"), ("alpha", "a")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let b: BTreeMap<String, String> = [("alpha", "a"), ("zeta", "z")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        assert_eq!(
            serde_json::to_string(&json!({"concepts": a})).unwrap(),
            serde_json::to_string(&json!({"concepts": b})).unwrap()
        );
    }
}
