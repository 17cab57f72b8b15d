//! State actor protocol

use thiserror::Error;
use tokio::sync::oneshot;

use paperstore::{AgentTask, MemoryEntry, Settlement, StoreError, TaskStatus};

/// Errors surfaced by state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state actor channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands processed by the state actor
pub enum StateCommand {
    CreateTask {
        task: AgentTask,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    MarkRunning {
        id: String,
        started_at: i64,
        reply: oneshot::Sender<StateResponse<AgentTask>>,
    },
    Settle {
        id: String,
        settlement: Settlement,
        completed_at: i64,
        reply: oneshot::Sender<StateResponse<AgentTask>>,
    },
    GetTask {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<AgentTask>>>,
    },
    CountByStatus {
        status: TaskStatus,
        reply: oneshot::Sender<StateResponse<u64>>,
    },
    MemoGet {
        key: String,
        reply: oneshot::Sender<StateResponse<Option<MemoryEntry>>>,
    },
    MemoPut {
        key: String,
        value: serde_json::Value,
        reply: oneshot::Sender<StateResponse<()>>,
    },
}
