//! paperflow configuration types and loading

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::llm::ProviderKind;
use crate::pipeline::AgentKind;

/// Main paperflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider adapters, keyed by provider name
    pub providers: BTreeMap<ProviderKind, ProviderConfig>,

    /// Per-stage execution parameters, keyed by stage kind
    pub stages: BTreeMap<AgentKind, StageConfig>,

    /// Token buckets, keyed by provider name
    #[serde(rename = "rate-limiter")]
    pub rate_limiter: BTreeMap<ProviderKind, RateLimiterConfig>,

    /// Circuit breakers, keyed by provider name
    pub breaker: BTreeMap<ProviderKind, BreakerConfig>,

    /// Retry policy shared by all agents
    pub retry: RetryConfig,

    /// Local-model fallback registry
    pub fallback: FallbackConfig,

    /// Orchestrator timeouts
    pub pipeline: PipelineConfig,

    /// Task store location and limits
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        let mut rate_limiter = BTreeMap::new();
        let mut breaker = BTreeMap::new();
        for kind in ProviderKind::all() {
            providers.insert(kind, ProviderConfig::for_provider(kind));
            rate_limiter.insert(kind, RateLimiterConfig::default());
            breaker.insert(kind, BreakerConfig::default());
        }

        let stages = AgentKind::all()
            .into_iter()
            .map(|kind| (kind, StageConfig::for_stage(kind)))
            .collect();

        Self {
            providers,
            stages,
            rate_limiter,
            breaker,
            retry: RetryConfig::default(),
            fallback: FallbackConfig::default(),
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .paperflow.yml
        let local_config = PathBuf::from(".paperflow.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/paperflow/paperflow.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("paperflow").join("paperflow.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Adapter config for one provider, defaulted when not configured
    pub fn provider(&self, kind: ProviderKind) -> ProviderConfig {
        self.providers
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| ProviderConfig::for_provider(kind))
    }

    /// Bucket parameters for one provider
    pub fn limiter(&self, kind: ProviderKind) -> RateLimiterConfig {
        self.rate_limiter.get(&kind).cloned().unwrap_or_default()
    }

    /// Breaker parameters for one provider
    pub fn breaker(&self, kind: ProviderKind) -> BreakerConfig {
        self.breaker.get(&kind).cloned().unwrap_or_default()
    }

    /// Execution parameters for one stage, defaulted when not configured
    pub fn stage(&self, kind: AgentKind) -> StageConfig {
        self.stages
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| StageConfig::for_stage(kind))
    }

    /// Providers that are enabled, local included
    pub fn enabled_providers(&self) -> Vec<ProviderKind> {
        ProviderKind::all()
            .into_iter()
            .filter(|kind| self.provider(*kind).enabled)
            .collect()
    }
}

/// One provider adapter's parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Whether to register this adapter at startup
    pub enabled: bool,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// Model identifier
    pub model: String,

    /// Per-call timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::for_provider(ProviderKind::Anthropic)
    }
}

impl ProviderConfig {
    /// Sensible defaults per provider
    pub fn for_provider(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Anthropic => Self {
                enabled: true,
                base_url: "https://api.anthropic.com".to_string(),
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                model: "claude-sonnet-4-20250514".to_string(),
                timeout_ms: 60_000,
                max_tokens: 8192,
            },
            ProviderKind::OpenAi => Self {
                enabled: true,
                base_url: "https://api.openai.com".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                model: "gpt-4o".to_string(),
                timeout_ms: 60_000,
                max_tokens: 8192,
            },
            ProviderKind::Gemini => Self {
                enabled: true,
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                api_key_env: "GEMINI_API_KEY".to_string(),
                model: "gemini-2.0-flash".to_string(),
                timeout_ms: 60_000,
                max_tokens: 8192,
            },
            ProviderKind::Local => Self {
                enabled: false,
                base_url: "http://localhost:11434".to_string(),
                api_key_env: String::new(),
                model: "llama3.1:8b".to_string(),
                timeout_ms: 120_000,
                max_tokens: 4096,
            },
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Execution parameters for one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Which provider serves this stage's primary agent
    pub provider: ProviderKind,

    /// Response token budget for this stage's calls
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Sampling temperature; provider default when unset
    pub temperature: Option<f32>,
}

impl Default for StageConfig {
    fn default() -> Self {
        StageConfig::for_stage(AgentKind::Summarizer)
    }
}

impl StageConfig {
    /// Default provider assignment per stage
    ///
    /// Extraction and summarization lean on the strongest model;
    /// structured-extraction stages run on cheaper endpoints.
    pub fn for_stage(kind: AgentKind) -> Self {
        match kind {
            AgentKind::TextExtractor => Self {
                provider: ProviderKind::Anthropic,
                max_tokens: 8192,
                temperature: Some(0.0),
            },
            AgentKind::MetadataEnhancer => Self {
                provider: ProviderKind::Gemini,
                max_tokens: 1024,
                temperature: Some(0.0),
            },
            AgentKind::Summarizer => Self {
                provider: ProviderKind::Anthropic,
                max_tokens: 4096,
                temperature: Some(0.3),
            },
            AgentKind::ConceptExplainer => Self {
                provider: ProviderKind::OpenAi,
                max_tokens: 4096,
                temperature: Some(0.3),
            },
            AgentKind::QualityChecker => Self {
                provider: ProviderKind::OpenAi,
                max_tokens: 1024,
                temperature: Some(0.0),
            },
            AgentKind::CitationFormatter => Self {
                provider: ProviderKind::Gemini,
                max_tokens: 8192,
                temperature: Some(0.0),
            },
            AgentKind::Discoverer => Self {
                provider: ProviderKind::Gemini,
                max_tokens: 2048,
                temperature: Some(0.5),
            },
        }
    }
}

/// Token-bucket parameters for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Bucket capacity
    pub capacity: u32,

    /// Tokens refilled per second
    #[serde(rename = "refill-per-sec")]
    pub refill_per_sec: f64,

    /// Waiter queue high-water mark; acquires beyond this fail fast
    #[serde(rename = "high-water")]
    pub high_water: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 2.0,
            high_water: 1_000,
        }
    }
}

/// Circuit-breaker parameters for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Sliding window of recorded outcomes
    #[serde(rename = "window-size")]
    pub window_size: usize,

    /// Failure ratio at or above which the circuit opens
    #[serde(rename = "failure-threshold")]
    pub failure_threshold: f64,

    /// Initial open-state cool-down in milliseconds
    #[serde(rename = "cool-down-ms")]
    pub cool_down_ms: u64,

    /// Cool-down doubling ceiling in milliseconds
    #[serde(rename = "cool-down-ceiling-ms")]
    pub cool_down_ceiling_ms: u64,

    /// Concurrent probes permitted while half-open
    #[serde(rename = "half-open-probes")]
    pub half_open_probes: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            failure_threshold: 0.5,
            cool_down_ms: 30_000,
            cool_down_ceiling_ms: 300_000,
            half_open_probes: 3,
        }
    }
}

impl BreakerConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    pub fn cool_down_ceiling(&self) -> Duration {
        Duration::from_millis(self.cool_down_ceiling_ms)
    }
}

/// Retry policy parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts against the primary provider before fallback
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts in milliseconds
    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: u64,

    /// Exponential multiplier
    pub multiplier: f64,

    /// Jitter fraction applied to each delay (0.2 = +/-20%)
    #[serde(rename = "jitter-fraction")]
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            jitter_fraction: 0.2,
        }
    }
}

/// Fallback registry parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Register local-provider fallbacks at startup
    pub enabled: bool,

    /// Additional input truncation for the local model's context window
    #[serde(rename = "local-content-cap")]
    pub local_content_cap: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            local_content_cap: 8_000,
        }
    }
}

/// Orchestrator timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Default per-request deadline in milliseconds; 0 means none
    #[serde(rename = "default-deadline-ms")]
    pub default_deadline_ms: u64,

    /// Per-stage budget in milliseconds, retries included
    #[serde(rename = "default-stage-budget-ms")]
    pub default_stage_budget_ms: u64,

    /// Content cap in characters before the extractor chunks input
    #[serde(rename = "content-cap-chars")]
    pub content_cap_chars: usize,

    /// Quality scores below this raise a soft warning
    #[serde(rename = "quality-floor")]
    pub quality_floor: f64,
}

impl PipelineConfig {
    pub fn default_deadline(&self) -> Option<Duration> {
        (self.default_deadline_ms > 0).then(|| Duration::from_millis(self.default_deadline_ms))
    }

    pub fn stage_budget(&self) -> Duration {
        Duration::from_millis(self.default_stage_budget_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 0,
            default_stage_budget_ms: 300_000,
            content_cap_chars: 48_000,
            quality_floor: 0.5,
        }
    }
}

/// Task store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database
    pub path: String,

    /// Retained memoization entries
    #[serde(rename = "memory-cap")]
    pub memory_cap: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: ".paperflow/tasks.db".to_string(),
            memory_cap: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.providers.len(), 4);
        assert!(config.provider(ProviderKind::Anthropic).enabled);
        assert!(!config.provider(ProviderKind::Local).enabled);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.breaker(ProviderKind::OpenAi).window_size, 20);
        assert!(!config.fallback.enabled);
    }

    #[test]
    fn test_enabled_providers_excludes_local_by_default() {
        let config = Config::default();
        let enabled = config.enabled_providers();
        assert!(enabled.contains(&ProviderKind::Anthropic));
        assert!(!enabled.contains(&ProviderKind::Local));
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
providers:
  anthropic:
    model: claude-opus-4
    api-key-env: MY_API_KEY
    timeout-ms: 30000
  local:
    enabled: true
    base-url: http://localhost:8080

rate-limiter:
  anthropic:
    capacity: 5
    refill-per-sec: 0.5

breaker:
  anthropic:
    window-size: 10
    failure-threshold: 0.3

retry:
  max-attempts: 5
  base-delay-ms: 250

fallback:
  enabled: true
  local-content-cap: 4000

pipeline:
  default-deadline-ms: 600000
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.provider(ProviderKind::Anthropic).model, "claude-opus-4");
        assert_eq!(config.provider(ProviderKind::Anthropic).api_key_env, "MY_API_KEY");
        assert_eq!(config.provider(ProviderKind::Anthropic).timeout_ms, 30_000);
        assert!(config.provider(ProviderKind::Local).enabled);
        assert_eq!(config.limiter(ProviderKind::Anthropic).capacity, 5);
        assert_eq!(config.breaker(ProviderKind::Anthropic).failure_threshold, 0.3);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.fallback.enabled);
        assert_eq!(config.fallback.local_content_cap, 4_000);
        assert_eq!(
            config.pipeline.default_deadline(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
retry:
  max-attempts: 7
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.retry.max_attempts, 7);
        // Defaults for unspecified
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.pipeline.default_stage_budget_ms, 300_000);
        assert_eq!(config.pipeline.default_deadline(), None);
    }

    #[test]
    fn test_stage_assignments() {
        let config = Config::default();
        assert_eq!(config.stage(AgentKind::Summarizer).provider, ProviderKind::Anthropic);
        assert_eq!(config.stage(AgentKind::Discoverer).provider, ProviderKind::Gemini);

        let yaml = r#"
stages:
  summarizer:
    provider: openai
    max-tokens: 2048
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.stage(AgentKind::Summarizer).provider, ProviderKind::OpenAi);
        assert_eq!(config.stage(AgentKind::Summarizer).max_tokens, 2048);
        // Unlisted stages keep their defaults
        assert_eq!(config.stage(AgentKind::QualityChecker).provider, ProviderKind::OpenAi);
    }

    #[test]
    fn test_unconfigured_provider_falls_back_to_defaults() {
        let yaml = r#"
providers:
  anthropic:
    enabled: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert!(!config.provider(ProviderKind::Anthropic).enabled);
        // Map now only carries the configured provider; lookups still work
        assert_eq!(
            config.provider(ProviderKind::Gemini).api_key_env,
            "GEMINI_API_KEY"
        );
        assert_eq!(config.limiter(ProviderKind::Gemini).capacity, 10);
    }
}
