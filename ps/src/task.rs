//! AgentTask - the durable record of one stage execution

use serde::{Deserialize, Serialize};

use crate::now_ms;

/// Lifecycle status of an agent task
///
/// `pending -> running -> (completed | failed)`. Terminal states are
/// absorbing; there is no transition back into `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parse from the persisted column value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal outcome passed to [`crate::Store::settle`]
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Completed(serde_json::Value),
    Failed(String),
}

impl Settlement {
    pub fn status(&self) -> TaskStatus {
        match self {
            Settlement::Completed(_) => TaskStatus::Completed,
            Settlement::Failed(_) => TaskStatus::Failed,
        }
    }
}

/// One durable unit of pipeline work
///
/// Invariants enforced by the store:
/// - `status == Completed` implies `result` is set and `error` is not
/// - `status == Failed` implies `error` is set
/// - `started_at <= completed_at` when both are present
/// - ids are unique store-wide
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    /// Unique task id
    pub id: String,

    /// Stage kind slug (e.g. "summarizer")
    pub agent_id: String,

    /// Owning user
    pub user_id: String,

    /// Opaque input payload
    pub input: serde_json::Value,

    /// Lifecycle status
    pub status: TaskStatus,

    /// Failure reason when status is Failed
    pub error: Option<String>,

    /// Result payload when status is Completed
    pub result: Option<serde_json::Value>,

    /// Unix-ms timestamps
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl AgentTask {
    /// Create a new pending task
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            input,
            status: TaskStatus::Pending,
            error: None,
            result: None,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Verify the payload/status invariants hold on this record
    pub fn invariants_hold(&self) -> bool {
        let payload_ok = match self.status {
            TaskStatus::Completed => self.result.is_some() && self.error.is_none(),
            TaskStatus::Failed => self.error.is_some(),
            _ => true,
        };
        let order_ok = match (self.started_at, self.completed_at) {
            (Some(s), Some(c)) => s <= c,
            _ => true,
        };
        payload_ok && order_ok
    }
}
