//! Prompt templates for the pipeline agents
//!
//! Templates are Handlebars strings embedded in the binary; a file in
//! `~/.config/paperflow/prompts/<name>.hbs` overrides the embedded
//! version at startup.

mod embedded;

use std::collections::HashMap;

use eyre::{Context, Result};
use handlebars::Handlebars;
use tracing::{debug, info};

/// Registry of rendered prompt templates
pub struct PromptSet {
    registry: Handlebars<'static>,
}

/// (name, template) pairs compiled into the binary
const EMBEDDED: &[(&str, &str)] = &[
    ("extract-system", embedded::EXTRACT_SYSTEM),
    ("extract-chunk-user", embedded::EXTRACT_CHUNK_USER),
    ("extract-sections-user", embedded::EXTRACT_SECTIONS_USER),
    ("metadata-system", embedded::METADATA_SYSTEM),
    ("metadata-user", embedded::METADATA_USER),
    ("summary-system", embedded::SUMMARY_SYSTEM),
    ("summary-user", embedded::SUMMARY_USER),
    ("concepts-system", embedded::CONCEPTS_SYSTEM),
    ("concepts-user", embedded::CONCEPTS_USER),
    ("quality-system", embedded::QUALITY_SYSTEM),
    ("quality-user", embedded::QUALITY_USER),
    ("citations-system", embedded::CITATIONS_SYSTEM),
    ("citations-user", embedded::CITATIONS_USER),
    ("discovery-system", embedded::DISCOVERY_SYSTEM),
    ("discovery-user", embedded::DISCOVERY_USER),
];

impl PromptSet {
    /// Load templates: embedded defaults, then user overrides
    pub fn load() -> Result<Self> {
        let mut overrides = HashMap::new();

        if let Some(config_dir) = dirs::config_dir() {
            let prompt_dir = config_dir.join("paperflow").join("prompts");
            if prompt_dir.is_dir() {
                for (name, _) in EMBEDDED {
                    let path = prompt_dir.join(format!("{name}.hbs"));
                    if path.is_file() {
                        let content =
                            std::fs::read_to_string(&path).context(format!("Failed to read {}", path.display()))?;
                        info!(template = name, path = %path.display(), "Prompt override loaded");
                        overrides.insert(*name, content);
                    }
                }
            }
        }

        Self::with_overrides(overrides)
    }

    /// Embedded templates only (tests, demo runs)
    pub fn embedded() -> Self {
        Self::with_overrides(HashMap::new()).expect("embedded templates are valid")
    }

    fn with_overrides(overrides: HashMap<&'static str, String>) -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);

        for (name, template) in EMBEDDED {
            let body = overrides.get(name).map(String::as_str).unwrap_or(template);
            registry
                .register_template_string(name, body)
                .context(format!("Failed to compile template {name}"))?;
        }

        debug!(templates = EMBEDDED.len(), "Prompt set ready");
        Ok(Self { registry })
    }

    /// Render a template with the given values
    pub fn render(&self, name: &str, values: &serde_json::Value) -> Result<String> {
        self.registry
            .render(name, values)
            .context(format!("Failed to render template {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_all_templates_compile() {
        let prompts = PromptSet::embedded();
        for (name, _) in EMBEDDED {
            // Rendering with empty values must not fail (missing values
            // render as empty strings in non-strict mode)
            prompts.render(name, &json!({})).unwrap();
        }
    }

    #[test]
    fn test_render_substitutes_values() {
        let prompts = PromptSet::embedded();
        let rendered = prompts
            .render("extract-chunk-user", &json!({"part": 2, "total": 3, "chunk": "abc"}))
            .unwrap();

        assert!(rendered.contains("part 2 of 3"));
        assert!(rendered.contains("abc"));
    }

    #[test]
    fn test_conditional_sections() {
        let prompts = PromptSet::embedded();

        let with_hint = prompts
            .render("metadata-user", &json!({"title_hint": "Attention Is All You Need", "text": "t"}))
            .unwrap();
        assert!(with_hint.contains("Attention Is All You Need"));

        let without_hint = prompts.render("metadata-user", &json!({"text": "t"})).unwrap();
        assert!(!without_hint.contains("uploader"));
    }

    #[test]
    fn test_no_html_escaping() {
        let prompts = PromptSet::embedded();
        let rendered = prompts
            .render("summary-user", &json!({"title": "A<B & C", "text": ""}))
            .unwrap();
        assert!(rendered.contains("A<B & C"));
    }

    #[test]
    fn test_unknown_template_errors() {
        let prompts = PromptSet::embedded();
        assert!(prompts.render("nonexistent", &json!({})).is_err());
    }
}
