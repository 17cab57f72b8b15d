//! paperstore - durable agent-task state for the paperflow pipeline
//!
//! Two logical tables back the pipeline core:
//!
//! - `agent_tasks` - one row per stage execution, with an append-only
//!   status lifecycle: `pending -> running -> (completed | failed)`
//! - `agent_memory` - content-addressed memoization entries, trimmed by
//!   least-recently-written beyond a configurable cap
//!
//! All mutation goes through [`Store`], which enforces the lifecycle:
//! terminal states are absorbing, `mark_running` and `settle` are
//! idempotent for identical arguments, and duplicate ids are rejected at
//! creation.

mod error;
mod store;
mod task;

pub use error::StoreError;
pub use store::{MemoryEntry, Store, StoreConfig};
pub use task::{AgentTask, Settlement, TaskStatus};

/// Current unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
