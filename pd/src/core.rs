//! The Core handle
//!
//! Wires adapters, guards, agents, the fallback registry, the state
//! actor, and the orchestrator together once at startup, and exposes the
//! four inbound operations: submit, status, subscribe, cancel. There are
//! no globals; everything the pipeline needs hangs off this handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eyre::{Result, eyre};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::agents::{
    Agent, CitationLogic, ConceptLogic, CrossrefResolver, DiscoveryLogic, ExtractLogic, FALLBACK_STAGES,
    FallbackRegistry, GuardedCall, IdentifierResolver, MetadataLogic, ProviderAgent, QualityLogic, StageLogic,
    SummaryLogic,
};
use crate::cancel::{CancelHandle, cancel_pair};
use crate::config::Config;
use crate::credits::CreditLedger;
use crate::guard::{ProviderGuards, RetryPolicy};
use crate::llm::{LlmClient, ProviderKind};
use crate::papers::{PaperStore, PdfExtractor};
use crate::pipeline::{
    AgentKind, Orchestrator, PipelineRequest, PipelineResult, PipelineStatus, ProgressBroadcaster, ProgressEvent,
    StatusBoard, validate_stages,
};
use crate::prompts::PromptSet;
use crate::state::StateManager;

/// Rejection of a pipeline submission; the only failure surfaced to the
/// submit caller - runtime failures travel through status and progress
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid pipeline request: {0}")]
    InvalidInput(String),
}

/// Counters exposed on the handle
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CoreMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub fallbacks_used: u64,
}

struct ActiveRequest {
    board: StatusBoard,
    progress: Arc<ProgressBroadcaster>,
    cancel: CancelHandle,
    result: Arc<Mutex<Option<PipelineResult>>>,
}

struct CoreInner {
    orchestrator: Arc<Orchestrator>,
    state: StateManager,
    default_deadline: Option<Duration>,
    active: Mutex<HashMap<String, ActiveRequest>>,
    /// fingerprint -> request id, held only while the request runs
    in_flight: Mutex<HashMap<String, String>>,
    metrics: Mutex<CoreMetrics>,
}

/// Explicitly-constructed entry point to the pipeline core
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// Wire the core from injected collaborators
    ///
    /// `clients` carries one adapter per enabled provider; stage
    /// assignments referencing a missing provider fail construction.
    pub fn new(
        config: Config,
        clients: HashMap<ProviderKind, Arc<dyn LlmClient>>,
        state: StateManager,
        papers: Arc<dyn PaperStore>,
        pdf: Arc<dyn PdfExtractor>,
        resolver: Arc<dyn IdentifierResolver>,
        credits: Arc<dyn CreditLedger>,
    ) -> Result<Self> {
        let guards = ProviderGuards::from_config(&config);
        let retry = RetryPolicy::new(config.retry.clone());
        let prompts = Arc::new(PromptSet::load()?);

        let make_call = |provider: ProviderKind| -> Result<GuardedCall> {
            let client = clients
                .get(&provider)
                .cloned()
                .ok_or_else(|| eyre!("no adapter for provider {provider}"))?;
            let limiter = guards
                .limiter(provider)
                .ok_or_else(|| eyre!("provider {provider} is not enabled"))?;
            let breaker = guards
                .breaker(provider)
                .ok_or_else(|| eyre!("provider {provider} is not enabled"))?;
            Ok(GuardedCall::new(
                client,
                limiter,
                breaker,
                retry.clone(),
                config.provider(provider).timeout(),
            ))
        };

        let make_logic = |kind: AgentKind| -> Arc<dyn StageLogic> {
            let stage = config.stage(kind);
            match kind {
                AgentKind::TextExtractor => Arc::new(ExtractLogic::new(
                    papers.clone(),
                    pdf.clone(),
                    prompts.clone(),
                    stage,
                    config.pipeline.content_cap_chars,
                )),
                AgentKind::MetadataEnhancer => Arc::new(MetadataLogic::new(resolver.clone(), prompts.clone(), stage)),
                AgentKind::Summarizer => Arc::new(SummaryLogic::new(prompts.clone(), stage)),
                AgentKind::ConceptExplainer => Arc::new(ConceptLogic::new(prompts.clone(), stage)),
                AgentKind::QualityChecker => Arc::new(QualityLogic::new(
                    prompts.clone(),
                    stage,
                    config.pipeline.quality_floor,
                )),
                AgentKind::CitationFormatter => Arc::new(CitationLogic::new(prompts.clone(), stage)),
                AgentKind::Discoverer => Arc::new(DiscoveryLogic::new(prompts.clone(), stage)),
            }
        };

        // Fallback registry: local-provider agents, conditional on config
        let local_available = config.fallback.enabled
            && config.provider(ProviderKind::Local).enabled
            && clients.contains_key(&ProviderKind::Local);

        let mut registry = FallbackRegistry::empty();
        if local_available {
            for kind in FALLBACK_STAGES {
                let call = make_call(ProviderKind::Local)?;
                let agent = ProviderAgent::degraded(
                    make_logic(kind),
                    call,
                    state.clone(),
                    config.fallback.local_content_cap,
                );
                registry.register(Arc::new(agent));
            }
        } else if config.fallback.enabled {
            warn!("Fallback enabled in config but the local provider is not available");
        }
        let registry = Arc::new(registry);

        let mut agents: HashMap<AgentKind, Arc<dyn Agent>> = HashMap::new();
        for kind in AgentKind::all() {
            let stage = config.stage(kind);
            let call = make_call(stage.provider)
                .map_err(|e| eyre!("stage {kind} cannot be served: {e}"))?;
            let agent = ProviderAgent::primary(make_logic(kind), call, state.clone(), Some(registry.clone()));
            agents.insert(kind, Arc::new(agent));
        }

        let orchestrator = Arc::new(Orchestrator::new(
            agents,
            state.clone(),
            papers,
            credits,
            config.pipeline.clone(),
        ));

        info!(
            providers = clients.len(),
            fallbacks = registry.len(),
            "Core constructed"
        );

        Ok(Self {
            inner: Arc::new(CoreInner {
                orchestrator,
                state,
                default_deadline: config.pipeline.default_deadline(),
                active: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                metrics: Mutex::new(CoreMetrics::default()),
            }),
        })
    }

    /// Construct adapters from config and wire the core
    pub fn from_config(
        config: Config,
        state: StateManager,
        papers: Arc<dyn PaperStore>,
        pdf: Arc<dyn PdfExtractor>,
        credits: Arc<dyn CreditLedger>,
    ) -> Result<Self> {
        let mut clients: HashMap<ProviderKind, Arc<dyn LlmClient>> = HashMap::new();
        for kind in config.enabled_providers() {
            let client = crate::llm::create_client(kind, &config.provider(kind))
                .map_err(|e| eyre!("failed to create {kind} adapter: {e}"))?;
            clients.insert(kind, client);
        }

        let resolver: Arc<dyn IdentifierResolver> = Arc::new(CrossrefResolver::new()?);
        Self::new(config, clients, state, papers, pdf, resolver, credits)
    }

    /// Submit a paper-processing job; returns the request id
    ///
    /// Re-submitting an identical (user, paper, stages) request while the
    /// original is still running returns the original id.
    pub async fn submit_pipeline(
        &self,
        user_id: &str,
        paper_id: &str,
        stages: Vec<AgentKind>,
        deadline: Option<Duration>,
    ) -> Result<String, SubmitError> {
        if user_id.is_empty() || paper_id.is_empty() {
            return Err(SubmitError::InvalidInput("user and paper ids are required".to_string()));
        }

        // Dependencies must be requested or satisfied by a cached
        // upstream payload
        let mut cached = std::collections::BTreeSet::new();
        for kind in AgentKind::all() {
            if stages.contains(&kind) {
                continue;
            }
            let key = format!("stage:{kind}:{paper_id}");
            if let Ok(Some(_)) = self.inner.state.memo_get(&key).await {
                cached.insert(kind);
            }
        }
        validate_stages(&stages, &cached).map_err(SubmitError::InvalidInput)?;

        let request = PipelineRequest::new(user_id, paper_id, stages, deadline.or(self.inner.default_deadline));
        let fingerprint = request.fingerprint();

        // Dedup on the request fingerprint while the original runs
        {
            let in_flight = self.inner.in_flight.lock().expect("in-flight lock poisoned");
            if let Some(existing) = in_flight.get(&fingerprint) {
                info!(request_id = %existing, "Duplicate submission, returning original");
                return Ok(existing.clone());
            }
        }

        let board = StatusBoard::new(&request);
        let progress = Arc::new(ProgressBroadcaster::new());
        let (cancel_handle, cancel_token) = cancel_pair();
        let result_slot = Arc::new(Mutex::new(None));

        {
            let mut active = self.inner.active.lock().expect("active lock poisoned");
            active.insert(
                request.id.clone(),
                ActiveRequest {
                    board: board.clone(),
                    progress: progress.clone(),
                    cancel: cancel_handle,
                    result: result_slot.clone(),
                },
            );
        }
        self.inner
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .insert(fingerprint.clone(), request.id.clone());
        self.inner.metrics.lock().expect("metrics lock poisoned").submitted += 1;

        let inner = self.inner.clone();
        let request_id = request.id.clone();
        tokio::spawn(async move {
            let result = inner
                .orchestrator
                .run(&request, cancel_token, &progress, &board)
                .await;

            {
                let mut metrics = inner.metrics.lock().expect("metrics lock poisoned");
                if result.success {
                    metrics.completed += 1;
                } else {
                    metrics.failed += 1;
                }
                metrics.fallbacks_used += result.stages.values().filter(|s| s.used_fallback).count() as u64;
            }

            *result_slot.lock().expect("result lock poisoned") = Some(result);
            inner
                .in_flight
                .lock()
                .expect("in-flight lock poisoned")
                .remove(&fingerprint);
        });

        Ok(request_id)
    }

    /// Per-stage states and overall progress for a request
    pub fn pipeline_status(&self, request_id: &str) -> Option<PipelineStatus> {
        let active = self.inner.active.lock().expect("active lock poisoned");
        active.get(request_id).map(|request| request.board.snapshot())
    }

    /// Lazy stream of stage transitions for a request
    pub fn subscribe_progress(&self, request_id: &str) -> Option<mpsc::Receiver<ProgressEvent>> {
        let active = self.inner.active.lock().expect("active lock poisoned");
        active.get(request_id).map(|request| request.progress.subscribe())
    }

    /// Cancel a running request; idempotent, true if the request exists
    pub fn cancel_pipeline(&self, request_id: &str) -> bool {
        let active = self.inner.active.lock().expect("active lock poisoned");
        match active.get(request_id) {
            Some(request) => {
                request.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Final result once the request has settled
    pub fn pipeline_result(&self, request_id: &str) -> Option<PipelineResult> {
        let active = self.inner.active.lock().expect("active lock poisoned");
        active
            .get(request_id)
            .and_then(|request| request.result.lock().expect("result lock poisoned").clone())
    }

    /// Counter snapshot
    pub fn metrics(&self) -> CoreMetrics {
        *self.inner.metrics.lock().expect("metrics lock poisoned")
    }

    /// Block until the given request settles (demo CLI, tests)
    pub async fn wait_for(&self, request_id: &str) -> Option<PipelineResult> {
        loop {
            if let Some(result) = self.pipeline_result(request_id) {
                return Some(result);
            }
            if !self
                .inner
                .active
                .lock()
                .expect("active lock poisoned")
                .contains_key(request_id)
            {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default() {
        let metrics = CoreMetrics::default();
        assert_eq!(metrics.submitted, 0);
        assert_eq!(metrics.fallbacks_used, 0);
    }
}
