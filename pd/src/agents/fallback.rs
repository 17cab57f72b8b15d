//! Fallback registry
//!
//! Maps stage kinds to local-provider agents, used exactly once per
//! stage after the primary path is exhausted. The registry is empty when
//! the local provider is not configured, in which case exhaustion
//! surfaces the primary error.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::Agent;
use crate::pipeline::AgentKind;

/// Stages eligible for a local fallback
///
/// Text extraction needs the full document and the PDF seam, and
/// discovery depends on external catalogs; neither degrades to a small
/// local model.
pub const FALLBACK_STAGES: [AgentKind; 5] = [
    AgentKind::MetadataEnhancer,
    AgentKind::Summarizer,
    AgentKind::ConceptExplainer,
    AgentKind::QualityChecker,
    AgentKind::CitationFormatter,
];

/// Stage kind -> degraded local agent
#[derive(Default)]
pub struct FallbackRegistry {
    agents: HashMap<AgentKind, Arc<dyn Agent>>,
}

impl FallbackRegistry {
    /// An empty registry; fallback is effectively disabled
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register a fallback agent for an eligible stage
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let kind = agent.kind();
        debug_assert!(FALLBACK_STAGES.contains(&kind), "stage {kind} has no fallback path");
        info!(stage = %kind, "Fallback registered");
        self.agents.insert(kind, agent);
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn Agent>> {
        self.agents.get(&kind).cloned()
    }

    pub fn is_registered(&self, kind: AgentKind) -> bool {
        self.agents.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
