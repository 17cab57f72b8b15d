//! Pipeline request and result types

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use paperstore::{TaskStatus, now_ms};

use super::stage::AgentKind;
use crate::agents::fingerprint_bytes;

/// One paper-processing job; immutable after creation
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub id: String,
    pub paper_id: String,
    pub user_id: String,
    /// Requested stage kinds, dependency order not required
    pub stages: Vec<AgentKind>,
    pub created_at: i64,
    /// Overall deadline; None means unbounded
    pub deadline: Option<Duration>,
}

impl PipelineRequest {
    pub fn new(
        user_id: impl Into<String>,
        paper_id: impl Into<String>,
        stages: Vec<AgentKind>,
        deadline: Option<Duration>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            paper_id: paper_id.into(),
            user_id: user_id.into(),
            stages,
            created_at: now_ms(),
            deadline,
        }
    }

    /// Stable fingerprint over (user, paper, stages) for request
    /// deduplication; stage order does not matter
    pub fn fingerprint(&self) -> String {
        let mut stages = self.stages.clone();
        stages.sort();
        let key = format!(
            "{}|{}|{}",
            self.user_id,
            self.paper_id,
            stages.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")
        );
        fingerprint_bytes(key.as_bytes())
    }

    /// Durable task id for one stage of this request
    pub fn task_id(&self, kind: AgentKind) -> String {
        format!("{}:{}", self.id, kind)
    }
}

/// Terminal record of one stage inside a pipeline result
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub status: TaskStatus,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
    pub used_fallback: bool,
    pub primary_failure_reason: Option<String>,
    pub elapsed_ms: u64,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Final result of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub request_id: String,
    /// True iff every requested stage succeeded (directly or via fallback)
    pub success: bool,
    pub stages: BTreeMap<AgentKind, StageOutcome>,
}

impl PipelineResult {
    pub fn stage(&self, kind: AgentKind) -> Option<&StageOutcome> {
        self.stages.get(&kind)
    }
}

/// Live view of one stage for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct StageState {
    pub kind: AgentKind,
    pub status: TaskStatus,
    pub elapsed_ms: u64,
    pub used_fallback: bool,
    pub error: Option<String>,
}

/// Snapshot answer for status queries
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub request_id: String,
    pub stages: Vec<StageState>,
    /// Settled fraction in [0, 1]
    pub overall_progress: f64,
    pub done: bool,
}
