//! Paper storage collaborator
//!
//! The core reads paper bytes and metadata through this trait and writes
//! stage results back exactly once per successful stage. The real
//! implementation lives in the platform's storage layer; an in-memory
//! variant backs tests and the demo CLI.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use eyre::{Result, eyre};

use crate::pipeline::AgentKind;

/// Read/write access to stored papers
///
/// `save_results` must be idempotent on (paper, stage); the orchestrator
/// calls it exactly once per successful stage per request, but replays
/// after a crash are possible.
#[async_trait]
pub trait PaperStore: Send + Sync {
    /// Raw bytes of the uploaded paper
    async fn load_bytes(&self, paper_id: &str) -> Result<Vec<u8>>;

    /// Platform-held metadata (upload title, source)
    async fn load_metadata(&self, paper_id: &str) -> Result<serde_json::Value>;

    /// Persist one stage's payload for the paper
    async fn save_results(&self, paper_id: &str, stage: AgentKind, payload: &serde_json::Value) -> Result<()>;
}

/// Extracts raw text from paper bytes
///
/// The actual PDF parser is outside the core; the text-extraction agent
/// only ever sees this seam.
pub trait PdfExtractor: Send + Sync {
    fn extract_text(&self, bytes: &[u8]) -> Result<String>;
}

/// Treats paper bytes as UTF-8 text; used by tests and the demo CLI
pub struct PlainTextExtractor;

impl PdfExtractor for PlainTextExtractor {
    fn extract_text(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| eyre!("paper bytes are not UTF-8 text: {e}"))
    }
}

/// In-memory paper store for tests and the demo CLI
#[derive(Default)]
pub struct InMemoryPaperStore {
    papers: Mutex<HashMap<String, Vec<u8>>>,
    metadata: Mutex<HashMap<String, serde_json::Value>>,
    results: Mutex<HashMap<(String, AgentKind), serde_json::Value>>,
    save_calls: Mutex<Vec<(String, AgentKind)>>,
}

impl InMemoryPaperStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_paper(&self, paper_id: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.papers.lock().unwrap().insert(paper_id.into(), bytes.into());
    }

    pub fn put_metadata(&self, paper_id: impl Into<String>, metadata: serde_json::Value) {
        self.metadata.lock().unwrap().insert(paper_id.into(), metadata);
    }

    pub fn result(&self, paper_id: &str, stage: AgentKind) -> Option<serde_json::Value> {
        self.results
            .lock()
            .unwrap()
            .get(&(paper_id.to_string(), stage))
            .cloned()
    }

    /// How many times save_results was called for (paper, stage)
    pub fn save_count(&self, paper_id: &str, stage: AgentKind) -> usize {
        self.save_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, s)| p == paper_id && *s == stage)
            .count()
    }
}

#[async_trait]
impl PaperStore for InMemoryPaperStore {
    async fn load_bytes(&self, paper_id: &str) -> Result<Vec<u8>> {
        self.papers
            .lock()
            .unwrap()
            .get(paper_id)
            .cloned()
            .ok_or_else(|| eyre!("unknown paper: {paper_id}"))
    }

    async fn load_metadata(&self, paper_id: &str) -> Result<serde_json::Value> {
        Ok(self
            .metadata
            .lock()
            .unwrap()
            .get(paper_id)
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn save_results(&self, paper_id: &str, stage: AgentKind, payload: &serde_json::Value) -> Result<()> {
        self.save_calls.lock().unwrap().push((paper_id.to_string(), stage));
        self.results
            .lock()
            .unwrap()
            .insert((paper_id.to_string(), stage), payload.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let store = InMemoryPaperStore::new();
        store.put_paper("p-1", b"hello".to_vec());

        assert_eq!(store.load_bytes("p-1").await.unwrap(), b"hello");
        assert!(store.load_bytes("p-2").await.is_err());

        store
            .save_results("p-1", AgentKind::Summarizer, &json!({"brief": "b"}))
            .await
            .unwrap();
        assert_eq!(
            store.result("p-1", AgentKind::Summarizer),
            Some(json!({"brief": "b"}))
        );
        assert_eq!(store.save_count("p-1", AgentKind::Summarizer), 1);
        assert_eq!(store.save_count("p-1", AgentKind::Discoverer), 0);
    }

    #[test]
    fn test_plain_text_extractor() {
        let extractor = PlainTextExtractor;
        assert_eq!(extractor.extract_text(b"abc").unwrap(), "abc");
        assert!(extractor.extract_text(&[0xff, 0xfe]).is_err());
    }
}
