//! Metadata enrichment stage
//!
//! The LLM extracts bibliographic fields from the paper text; external
//! identifier lookup (DOI) goes through its own resolver with an
//! independent retry, so a flaky catalog cannot consume the LLM retry
//! budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{GuardedCall, StageContext, StageFailure, StageLogic, fingerprint_value, truncate_chars};
use crate::config::StageConfig;
use crate::llm::CompletionRequest;
use crate::pipeline::AgentKind;
use crate::prompts::PromptSet;

/// Characters of paper text shown to the metadata prompt
const METADATA_TEXT_CAP: usize = 12_000;

/// Attempts against the identifier catalog, independent of the LLM retry
const RESOLVER_ATTEMPTS: u32 = 2;

/// One external identifier for a paper
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identifier {
    pub kind: String,
    pub value: String,
}

/// External identifier lookup (DOI registries, preprint servers)
#[async_trait]
pub trait IdentifierResolver: Send + Sync {
    async fn resolve(&self, title: &str) -> eyre::Result<Vec<Identifier>>;
}

/// Crossref works-search resolver
pub struct CrossrefResolver {
    http: reqwest::Client,
    base_url: String,
}

impl CrossrefResolver {
    pub fn new() -> eyre::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
            base_url: "https://api.crossref.org".to_string(),
        })
    }
}

#[async_trait]
impl IdentifierResolver for CrossrefResolver {
    async fn resolve(&self, title: &str) -> eyre::Result<Vec<Identifier>> {
        let url = format!("{}/works", self.base_url);
        let response = self
            .http
            .get(url)
            .query(&[("query.title", title), ("rows", "3")])
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        let mut identifiers = Vec::new();

        if let Some(items) = body["message"]["items"].as_array() {
            for item in items {
                if let Some(doi) = item["DOI"].as_str() {
                    identifiers.push(Identifier {
                        kind: "doi".to_string(),
                        value: doi.to_string(),
                    });
                }
            }
        }

        Ok(identifiers)
    }
}

pub struct MetadataLogic {
    resolver: Arc<dyn IdentifierResolver>,
    prompts: Arc<PromptSet>,
    stage: StageConfig,
}

impl MetadataLogic {
    pub fn new(resolver: Arc<dyn IdentifierResolver>, prompts: Arc<PromptSet>, stage: StageConfig) -> Self {
        Self {
            resolver,
            prompts,
            stage,
        }
    }

    /// Look up identifiers, retried independently of the LLM call;
    /// failure leaves the metadata without identifiers rather than
    /// failing the stage
    async fn resolve_identifiers(&self, title: &str, ctx: &StageContext) -> Vec<Identifier> {
        for attempt in 1..=RESOLVER_ATTEMPTS {
            if ctx.cancel.is_cancelled() {
                return Vec::new();
            }
            match self.resolver.resolve(title).await {
                Ok(identifiers) => {
                    debug!(count = identifiers.len(), "Identifier lookup succeeded");
                    return identifiers;
                }
                Err(e) if attempt < RESOLVER_ATTEMPTS => {
                    debug!(attempt, error = %e, "Identifier lookup failed, retrying");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(e) => {
                    warn!(error = %e, "Identifier lookup failed, continuing without identifiers");
                }
            }
        }
        Vec::new()
    }
}

#[async_trait]
impl StageLogic for MetadataLogic {
    fn kind(&self) -> AgentKind {
        AgentKind::MetadataEnhancer
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
        let title_hint = input.get("title-hint").and_then(Value::as_str);

        let system = self
            .prompts
            .render("metadata-system", &json!({}))
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;
        let prompt = self
            .prompts
            .render(
                "metadata-user",
                &json!({"title_hint": title_hint, "text": truncate_chars(text, METADATA_TEXT_CAP)}),
            )
            .map_err(|e| StageFailure::new("invalid-input", e.to_string(), false))?;

        let request = CompletionRequest {
            system_prompt: system,
            prompt,
            max_tokens: self.stage.max_tokens,
            temperature: self.stage.temperature,
        };

        let extracted = provider
            .complete_parsed(&request, ctx, |text| {
                let value = super::parse_json_response(text)?;
                let title = value
                    .get("title")
                    .and_then(Value::as_str)
                    .ok_or("metadata missing title")?;
                if title.trim().is_empty() {
                    return Err("metadata title is empty".to_string());
                }
                if !value.get("authors").map(Value::is_array).unwrap_or(false) {
                    return Err("metadata missing authors array".to_string());
                }
                Ok(value)
            })
            .await
            .map_err(|e| e.into_failure())?;

        let title = extracted["title"].as_str().unwrap_or_default().to_string();
        let identifiers = self.resolve_identifiers(&title, ctx).await;
        let doi = identifiers.iter().find(|i| i.kind == "doi").map(|i| i.value.clone());

        Ok(json!({
            "title": extracted["title"],
            "authors": extracted["authors"],
            "venue": extracted.get("venue").cloned().unwrap_or(Value::Null),
            "year": extracted.get("year").cloned().unwrap_or(Value::Null),
            "doi": doi,
            "identifiers": identifiers,
        }))
    }
}
