//! LlmClient trait and completion types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::LlmError;

/// Known provider endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Gemini,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anthropic" => Some(ProviderKind::Anthropic),
            "openai" => Some(ProviderKind::OpenAi),
            "gemini" => Some(ProviderKind::Gemini),
            "local" => Some(ProviderKind::Local),
            _ => None,
        }
    }

    /// All providers the core can be configured with
    pub fn all() -> [ProviderKind; 4] {
        [
            ProviderKind::Anthropic,
            ProviderKind::OpenAi,
            ProviderKind::Gemini,
            ProviderKind::Local,
        ]
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A completion request - everything needed for one provider call
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt (rendered from the agent's Handlebars template)
    pub system_prompt: String,

    /// User prompt carrying the stage input
    pub prompt: String,

    /// Max tokens for the response
    pub max_tokens: u32,

    /// Sampling temperature; providers use their default when unset
    pub temperature: Option<f32>,
}

/// Response from a completion request
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    /// Generated text
    pub text: String,

    /// Token usage for accounting
    pub usage: TokenUsage,
}

/// Token usage for cost accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Stateless LLM client - each call is independent
///
/// This is the single seam between the pipeline core and a provider's
/// wire protocol. Adapters own timeouts and error classification; callers
/// see only [`CompletionResponse`] or a classified [`LlmError`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Which provider this client talks to
    fn provider(&self) -> ProviderKind;

    /// Send a single completion request
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted outcome for one mock call
    pub enum MockOutcome {
        Ok(String),
        Err(fn() -> LlmError),
    }

    /// Mock LLM client for unit tests
    ///
    /// Plays back a script of outcomes; once the script is exhausted the
    /// last entry repeats.
    pub struct MockLlmClient {
        provider: ProviderKind,
        script: Mutex<Vec<MockOutcome>>,
        call_count: AtomicUsize,
    }

    impl MockLlmClient {
        pub fn new(provider: ProviderKind, script: Vec<MockOutcome>) -> Self {
            Self {
                provider,
                script: Mutex::new(script),
                call_count: AtomicUsize::new(0),
            }
        }

        /// A client that always answers with the same text
        pub fn always(provider: ProviderKind, text: impl Into<String>) -> Self {
            Self::new(provider, vec![MockOutcome::Ok(text.into())])
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        fn provider(&self) -> ProviderKind {
            self.provider
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            let script = self.script.lock().unwrap();
            let outcome = script.get(idx).or_else(|| script.last());

            match outcome {
                Some(MockOutcome::Ok(text)) => Ok(CompletionResponse {
                    text: text.clone(),
                    usage: TokenUsage {
                        input_tokens: 100,
                        output_tokens: 50,
                    },
                }),
                Some(MockOutcome::Err(make)) => Err(make()),
                None => Err(LlmError::InvalidResponse("empty mock script".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_roundtrip() {
        for kind in ProviderKind::all() {
            assert_eq!(ProviderKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ProviderKind::parse("mistral"), None);
    }

    #[test]
    fn test_usage_accumulates() {
        let mut usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        };
        usage.add(TokenUsage {
            input_tokens: 3,
            output_tokens: 2,
        });
        assert_eq!(usage.input_tokens, 13);
        assert_eq!(usage.output_tokens, 7);
    }

    #[tokio::test]
    async fn test_mock_script_playback() {
        use mock::{MockLlmClient, MockOutcome};

        let client = MockLlmClient::new(
            ProviderKind::Anthropic,
            vec![
                MockOutcome::Err(|| LlmError::Transient("503".into())),
                MockOutcome::Ok("hello".into()),
            ],
        );

        let request = CompletionRequest {
            system_prompt: "sys".into(),
            prompt: "hi".into(),
            max_tokens: 100,
            temperature: None,
        };

        assert!(client.complete(request.clone()).await.is_err());
        let response = client.complete(request.clone()).await.unwrap();
        assert_eq!(response.text, "hello");

        // Script exhausted - last entry repeats
        let response = client.complete(request).await.unwrap();
        assert_eq!(response.text, "hello");
        assert_eq!(client.call_count(), 3);
    }
}
