//! Local model adapter (Ollama-compatible HTTP endpoint)
//!
//! The degraded-path provider: slower, smaller context window, but free
//! of cloud quotas. No API key is required.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError, ProviderKind, TokenUsage};
use crate::config::ProviderConfig;

/// Client for an Ollama-compatible local endpoint
pub struct LocalClient {
    model: String,
    base_url: String,
    http: Client,
    timeout: Duration,
}

impl LocalClient {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, LlmError> {
        let timeout = config.timeout();
        let http = Client::builder().timeout(timeout).build().map_err(LlmError::Network)?;

        Ok(Self {
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            http,
            timeout,
        })
    }
}

#[async_trait]
impl LlmClient for LocalClient {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "system": request.system_prompt,
            "prompt": request.prompt,
            "stream": false,
            "options": { "num_predict": request.max_tokens },
        });

        let response = self.http.post(url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.timeout)
            } else if e.is_connect() {
                // The local daemon not running is a structural failure,
                // not a transient one
                LlmError::Unavailable(format!("local endpoint unreachable: {e}"))
            } else {
                LlmError::Network(e)
            }
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status {
                s if s >= 500 => LlmError::Transient(format!("HTTP {s}: {text}")),
                404 => LlmError::Unavailable(format!("model {} not loaded: {text}", self.model)),
                _ => LlmError::InvalidRequest(format!("HTTP {status}: {text}")),
            });
        }

        let api_response: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        if api_response.response.is_empty() {
            return Err(LlmError::InvalidResponse("empty completion".to_string()));
        }

        Ok(CompletionResponse {
            text: api_response.response,
            usage: TokenUsage {
                input_tokens: api_response.prompt_eval_count.unwrap_or(0),
                output_tokens: api_response.eval_count.unwrap_or(0),
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_needs_no_api_key() {
        let config = ProviderConfig::for_provider(ProviderKind::Local);
        let client = LocalClient::from_config(&config).unwrap();
        assert_eq!(client.provider(), ProviderKind::Local);
        assert_eq!(client.model, "llama3.1:8b");
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{"response": "ok", "prompt_eval_count": 11, "eval_count": 6, "done": true}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.response, "ok");
        assert_eq!(parsed.prompt_eval_count, Some(11));
    }
}
