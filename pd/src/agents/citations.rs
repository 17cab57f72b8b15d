//! Citation formatting stage
//!
//! The LLM extracts structured reference entries; bibliography rendering
//! for the supported styles is plain code, so formatting is deterministic
//! and testable without a model.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{GuardedCall, StageContext, StageFailure, StageLogic, fingerprint_value, truncate_chars};
use crate::config::StageConfig;
use crate::llm::CompletionRequest;
use crate::pipeline::AgentKind;
use crate::prompts::PromptSet;

/// Characters of paper text shown to the citations prompt
const CITATIONS_TEXT_CAP: usize = 40_000;

/// Supported bibliography styles
pub const STYLES: [&str; 4] = ["apa", "mla", "chicago", "ieee"];

/// One structured reference entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    #[serde(default)]
    pub authors: Vec<String>,
    pub title: String,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default)]
    pub doi: Option<String>,
}

pub struct CitationLogic {
    prompts: Arc<PromptSet>,
    stage: StageConfig,
}

impl CitationLogic {
    pub fn new(prompts: Arc<PromptSet>, stage: StageConfig) -> Self {
        Self { prompts, stage }
    }
}

#[async_trait]
impl StageLogic for CitationLogic {
    fn kind(&self) -> AgentKind {
        AgentKind::CitationFormatter
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

        let system = self
            .prompts
            .render("citations-system", &json!({}))
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;
        let prompt = self
            .prompts
            .render("citations-user", &json!({"text": truncate_chars(text, CITATIONS_TEXT_CAP)}))
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;

        let request = CompletionRequest {
            system_prompt: system,
            prompt,
            max_tokens: self.stage.max_tokens,
            temperature: self.stage.temperature,
        };

        let citations: Vec<Citation> = provider
            .complete_parsed(&request, ctx, |text| {
                let value = super::parse_json_response(text)?;
                let entries: Vec<Citation> =
                    serde_json::from_value(value).map_err(|e| format!("citation entries malformed: {e}"))?;
                if entries.iter().any(|c| c.title.trim().is_empty()) {
                    return Err("citation with empty title".to_string());
                }
                Ok(entries)
            })
            .await
            .map_err(|e| e.into_failure())?;

        let bibliography: serde_json::Map<String, Value> = STYLES
            .iter()
            .map(|style| {
                let formatted: Vec<String> = citations
                    .iter()
                    .enumerate()
                    .map(|(index, citation)| format_citation(citation, style, index + 1))
                    .collect();
                (style.to_string(), json!(formatted))
            })
            .collect();

        Ok(json!({
            "citations": citations,
            "bibliography": bibliography,
        }))
    }
}

/// Render one citation in the given style
///
/// `index` is the 1-based bibliography position (IEEE numbers entries).
pub fn format_citation(citation: &Citation, style: &str, index: usize) -> String {
    let year = citation.year.map(|y| y.to_string()).unwrap_or_else(|| "n.d.".to_string());
    let venue = citation.venue.as_deref().unwrap_or("");

    let mut formatted = match style {
        "apa" => {
            let authors = join_authors(&citation.authors, ", ", " & ");
            let mut s = format!("{authors} ({year}). {}.", citation.title);
            if !venue.is_empty() {
                s.push_str(&format!(" {venue}."));
            }
            s
        }
        "mla" => {
            let authors = join_authors(&citation.authors, ", ", ", and ");
            let mut s = format!("{authors}. \"{}.\"", citation.title);
            if !venue.is_empty() {
                s.push_str(&format!(" {venue},"));
            }
            s.push_str(&format!(" {year}."));
            s
        }
        "chicago" => {
            let authors = join_authors(&citation.authors, ", ", ", and ");
            let mut s = format!("{authors}. \"{}.\"", citation.title);
            if !venue.is_empty() {
                s.push_str(&format!(" {venue}"));
            }
            s.push_str(&format!(" ({year})."));
            s
        }
        "ieee" => {
            let authors = abbreviate_authors(&citation.authors);
            let mut s = format!("[{index}] {authors}, \"{},\"", citation.title);
            if !venue.is_empty() {
                s.push_str(&format!(" {venue},"));
            }
            s.push_str(&format!(" {year}."));
            s
        }
        _ => format!("{} ({year}). {}.", join_authors(&citation.authors, ", ", " & "), citation.title),
    };

    if let Some(doi) = &citation.doi {
        formatted.push_str(&format!(" https://doi.org/{doi}"));
    }
    formatted
}

fn join_authors(authors: &[String], separator: &str, last_separator: &str) -> String {
    match authors.len() {
        0 => "Unknown".to_string(),
        1 => authors[0].clone(),
        n => format!(
            "{}{last_separator}{}",
            authors[..n - 1].join(separator),
            authors[n - 1]
        ),
    }
}

/// IEEE-style initials: "Ada Lovelace" -> "A. Lovelace"
fn abbreviate_authors(authors: &[String]) -> String {
    if authors.is_empty() {
        return "Unknown".to_string();
    }
    let abbreviated: Vec<String> = authors
        .iter()
        .map(|author| {
            let mut parts = author.split_whitespace().collect::<Vec<_>>();
            match parts.len() {
                0 => String::new(),
                1 => parts[0].to_string(),
                _ => {
                    let last = parts.pop().unwrap_or_default();
                    let initials: Vec<String> = parts
                        .iter()
                        .filter_map(|part| part.chars().next())
                        .map(|initial| format!("{initial}."))
                        .collect();
                    format!("{} {last}", initials.join(" "))
                }
            }
        })
        .collect();
    abbreviated.join(", ")
}
