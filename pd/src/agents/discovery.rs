//! Related-paper discovery stage
//!
//! Suggests papers connected to the analyzed one. Suggestions are
//! deduplicated by DOI when present, else by a normalized-title
//! fingerprint, and carry a relationship kind plus a relevance score.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{GuardedCall, StageContext, StageFailure, StageLogic, fingerprint_value};
use crate::config::StageConfig;
use crate::llm::CompletionRequest;
use crate::pipeline::AgentKind;
use crate::prompts::PromptSet;

/// Accepted relationship kinds
pub const RELATIONSHIPS: [&str; 6] = [
    "citing",
    "cited-by",
    "semantic",
    "author-network",
    "venue-network",
    "topic-network",
];

pub struct DiscoveryLogic {
    prompts: Arc<PromptSet>,
    stage: StageConfig,
}

impl DiscoveryLogic {
    pub fn new(prompts: Arc<PromptSet>, stage: StageConfig) -> Self {
        Self { prompts, stage }
    }
}

#[async_trait]
impl StageLogic for DiscoveryLogic {
    fn kind(&self) -> AgentKind {
        AgentKind::Discoverer
    }

    fn validate_input(&self, input: &Value) -> Result<(), String> {
        let title = input
            .get("metadata")
            .and_then(|metadata| metadata.get("title"))
            .and_then(Value::as_str);
        match title {
            Some(title) if !title.trim().is_empty() => Ok(()),
            _ => Err("input requires metadata with a title".to_string()),
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
        let metadata = input.get("metadata").cloned().unwrap_or(Value::Null);
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
            .render("discovery-system", &json!({}))
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;
        let prompt = self
            .prompts
            .render(
                "discovery-user",
                &json!({
                    "title": metadata.get("title").and_then(Value::as_str).unwrap_or_default(),
                    "authors": authors,
                    "venue": metadata.get("venue").and_then(Value::as_str),
                    "year": metadata.get("year").and_then(Value::as_i64),
                }),
            )
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;

        let request = CompletionRequest {
            system_prompt: system,
            prompt,
            max_tokens: self.stage.max_tokens,
            temperature: self.stage.temperature,
        };

        let papers = provider
            .complete_parsed(&request, ctx, |text| {
                let value = super::parse_json_response(text)?;
                let entries = value.as_array().ok_or("discovery result is not an array")?;

                let mut validated = Vec::with_capacity(entries.len());
                for entry in entries {
                    let title = entry
                        .get("title")
                        .and_then(Value::as_str)
                        .ok_or("discovered paper missing title")?;
                    let relationship = entry
                        .get("relationship")
                        .and_then(Value::as_str)
                        .ok_or("discovered paper missing relationship")?;
                    if !RELATIONSHIPS.contains(&relationship) {
                        return Err(format!("unknown relationship kind: {relationship}"));
                    }
                    let relevance = entry
                        .get("relevance")
                        .and_then(Value::as_f64)
                        .ok_or("discovered paper missing relevance")?;

                    validated.push(json!({
                        "title": title,
                        "authors": entry.get("authors").cloned().unwrap_or(json!([])),
                        "doi": entry.get("doi").and_then(Value::as_str),
                        "relationship": relationship,
                        "relevance": relevance.clamp(0.0, 1.0),
                    }));
                }
                Ok(validated)
            })
            .await
            .map_err(|e| e.into_failure())?;

        Ok(json!({"discovered-papers": dedup_papers(papers)}))
    }
}

/// Drop duplicate suggestions: by DOI when present, else by
/// normalized-title fingerprint
fn dedup_papers(papers: Vec<Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    papers
        .into_iter()
        .filter(|paper| {
            let key = match paper.get("doi").and_then(Value::as_str) {
                Some(doi) => format!("doi:{}", doi.to_lowercase()),
                None => format!(
                    "title:{}",
                    normalize_title(paper.get("title").and_then(Value::as_str).unwrap_or_default())
                ),
            };
            seen.insert(key)
        })
        .collect()
}

/// Lowercased alphanumeric collapse for title comparison
fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}
