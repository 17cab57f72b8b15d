//! Text extraction stage
//!
//! Pulls raw text out of the stored paper through the PDF seam, cleans
//! it with the LLM, and builds a section index. Input larger than the
//! content cap is cleaned in overlapping windows and reassembled here;
//! the orchestrator never sees chunks.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{GuardedCall, StageContext, StageFailure, StageLogic, fingerprint_bytes, truncate_chars};
use crate::config::StageConfig;
use crate::llm::CompletionRequest;
use crate::papers::{PaperStore, PdfExtractor};
use crate::pipeline::AgentKind;
use crate::prompts::PromptSet;

/// Overlap between adjacent cleanup windows, in characters
const CHUNK_OVERLAP: usize = 200;

pub struct ExtractLogic {
    papers: Arc<dyn PaperStore>,
    pdf: Arc<dyn PdfExtractor>,
    prompts: Arc<PromptSet>,
    stage: StageConfig,
    /// Maximum characters per provider call
    content_cap: usize,
}

impl ExtractLogic {
    pub fn new(
        papers: Arc<dyn PaperStore>,
        pdf: Arc<dyn PdfExtractor>,
        prompts: Arc<PromptSet>,
        stage: StageConfig,
        content_cap: usize,
    ) -> Self {
        Self {
            papers,
            pdf,
            prompts,
            stage,
            content_cap: content_cap.max(CHUNK_OVERLAP * 2),
        }
    }

    fn request(&self, system: String, prompt: String) -> CompletionRequest {
        CompletionRequest {
            system_prompt: system,
            prompt,
            max_tokens: self.stage.max_tokens,
            temperature: self.stage.temperature,
        }
    }

    async fn clean_text(
        &self,
        raw: &str,
        provider: &GuardedCall,
        ctx: &StageContext,
    ) -> Result<String, StageFailure> {
        let chunks = chunk_text(raw, self.content_cap, CHUNK_OVERLAP);
        let total = chunks.len();
        debug!(total, raw_chars = raw.len(), "Cleaning extracted text");

        let system = self
            .prompts
            .render("extract-system", &json!({}))
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;

        let mut cleaned = Vec::with_capacity(total);
        for (index, chunk) in chunks.iter().enumerate() {
            let prompt = self
                .prompts
                .render(
                    "extract-chunk-user",
                    &json!({"part": index + 1, "total": total, "chunk": chunk}),
                )
                .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;

            let part = provider
                .complete_parsed(&self.request(system.clone(), prompt), ctx, |text| {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        Err("empty cleaned chunk".to_string())
                    } else {
                        Ok(trimmed.to_string())
                    }
                })
                .await
                .map_err(|e| e.into_failure())?;

            cleaned.push(part);
        }

        Ok(cleaned.join("\n\n"))
    }

    async fn section_index(
        &self,
        cleaned: &str,
        provider: &GuardedCall,
        ctx: &StageContext,
    ) -> Result<Value, StageFailure> {
        let system = self
            .prompts
            .render("extract-system", &json!({}))
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;
        let prompt = self
            .prompts
            .render(
                "extract-sections-user",
                &json!({"text": truncate_chars(cleaned, self.content_cap)}),
            )
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;

        provider
            .complete_parsed(&self.request(system, prompt), ctx, |text| {
                let value = super::parse_json_response(text)?;
                let sections = value.as_array().ok_or("section index is not an array")?;
                for section in sections {
                    if !section.get("title").map(Value::is_string).unwrap_or(false) {
                        return Err("section entry missing title".to_string());
                    }
                }
                Ok(value)
            })
            .await
            .map_err(|e| e.into_failure())
    }
}

#[async_trait]
impl StageLogic for ExtractLogic {
    fn kind(&self) -> AgentKind {
        AgentKind::TextExtractor
    }

    fn validate_input(&self, input: &Value) -> Result<(), String> {
        match input.get("paper-id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => Ok(()),
            _ => Err("input requires a non-empty paper-id".to_string()),
        }
    }

    /// Memoization key is the hash of the raw file bytes, so re-uploads
    /// of identical papers reuse prior extractions regardless of id
    async fn fingerprint(&self, input: &Value) -> Result<Option<String>, StageFailure> {
        let paper_id = input.get("paper-id").and_then(Value::as_str).unwrap_or_default();
        let bytes = self
            .papers
            .load_bytes(paper_id)
            .await
            .map_err(|e| StageFailure::invalid_input(e.to_string()))?;
        Ok(Some(format!("{}:{}", self.kind(), fingerprint_bytes(&bytes))))
    }

    async fn execute(
        &self,
        input: &Value,
        provider: &GuardedCall,
        ctx: &StageContext,
    ) -> Result<Value, StageFailure> {
        let paper_id = input.get("paper-id").and_then(Value::as_str).unwrap_or_default();

        let bytes = self
            .papers
            .load_bytes(paper_id)
            .await
            .map_err(|e| StageFailure::invalid_input(e.to_string()))?;

        let raw = self
            .pdf
            .extract_text(&bytes)
            .map_err(|e| StageFailure::invalid_input(format!("paper text extraction failed: {e}")))?;

        if raw.trim().is_empty() {
            return Err(StageFailure::invalid_input("paper contains no extractable text"));
        }

        let cleaned = self.clean_text(&raw, provider, ctx).await?;
        let sections = self.section_index(&cleaned, provider, ctx).await?;

        Ok(json!({
            "full-text": cleaned,
            "section-index": sections,
            "token-count": estimate_tokens(&cleaned),
        }))
    }
}

/// Rough token estimate used for accounting fields
fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Split text into overlapping character windows
fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size {
        return vec![text.to_string()];
    }

    let stride = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_text_small_input_single_chunk() {
        let chunks = chunk_text("short", 100, 10);
        assert_eq!(chunks, vec!["short".to_string()]);
    }

    #[test]
    fn test_chunk_text_overlap() {
        let text: String = ('a'..='z').collect();
        let chunks = chunk_text(&text, 10, 4);

        assert!(chunks.len() > 1);
        // Adjacent chunks share the overlap region
        let first = &chunks[0];
        let second = &chunks[1];
        assert_eq!(&first[first.len() - 4..], &second[..4]);
        // Reassembly covers the full text
        assert!(chunks.last().unwrap().ends_with('z'));
    }

    #[test]
    fn test_chunk_text_multibyte_safe() {
        let text = "é".repeat(50);
        let chunks = chunk_text(&text, 20, 5);
        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(total >= 50);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }
}
