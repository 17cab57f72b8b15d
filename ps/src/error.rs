//! Store error types

use thiserror::Error;

/// Errors surfaced by [`crate::Store`] operations
///
/// `DuplicateId` and `IllegalTransition` are invariant violations on the
/// caller's side; the orchestration core treats them as bugs rather than
/// runtime conditions.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate task id: {0}")]
    DuplicateId(String),

    #[error("illegal transition for task {id}: {from} -> {to}")]
    IllegalTransition { id: String, from: String, to: String },

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// True for errors that indicate a caller bug rather than runtime state
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, StoreError::DuplicateId(_) | StoreError::IllegalTransition { .. })
    }
}
