//! StateManager - actor that owns the task store
//!
//! All task and memoization writes flow through one actor task, which
//! serializes them; per-task-id and per-memo-key write ordering follow
//! from the single writer.

use std::path::Path;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use paperstore::{AgentTask, MemoryEntry, Settlement, Store, StoreConfig, TaskStatus};

use super::messages::{StateCommand, StateError, StateResponse};

/// Handle to the state actor; cheap to clone
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Open the store and spawn the actor
    pub fn spawn(store_path: impl AsRef<Path>, config: StoreConfig) -> eyre::Result<Self> {
        debug!(store_path = %store_path.as_ref().display(), "spawn: called");
        let store = Store::open(store_path.as_ref(), config)?;
        Ok(Self::spawn_with_store(store))
    }

    /// Spawn over an in-memory store (tests, demo runs)
    pub fn spawn_in_memory() -> eyre::Result<Self> {
        let store = Store::in_memory(StoreConfig::default())?;
        Ok(Self::spawn_with_store(store))
    }

    fn spawn_with_store(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StateError::ChannelClosed)?;
        reply_rx.await.map_err(|_| StateError::ChannelClosed)?
    }

    /// Insert a new pending task
    pub async fn create_task(&self, task: AgentTask) -> StateResponse<()> {
        debug!(task_id = %task.id, agent_id = %task.agent_id, "create_task: called");
        self.send(|reply| StateCommand::CreateTask { task, reply }).await
    }

    /// Transition a task to running
    pub async fn mark_running(&self, id: &str, started_at: i64) -> StateResponse<AgentTask> {
        debug!(task_id = %id, "mark_running: called");
        self.send(|reply| StateCommand::MarkRunning {
            id: id.to_string(),
            started_at,
            reply,
        })
        .await
    }

    /// Settle a task to a terminal state
    pub async fn settle(&self, id: &str, settlement: Settlement, completed_at: i64) -> StateResponse<AgentTask> {
        debug!(task_id = %id, status = %settlement.status(), "settle: called");
        self.send(|reply| StateCommand::Settle {
            id: id.to_string(),
            settlement,
            completed_at,
            reply,
        })
        .await
    }

    /// Fetch a task by id
    pub async fn get_task(&self, id: &str) -> StateResponse<Option<AgentTask>> {
        self.send(|reply| StateCommand::GetTask {
            id: id.to_string(),
            reply,
        })
        .await
    }

    /// Count tasks in one status
    pub async fn count_by_status(&self, status: TaskStatus) -> StateResponse<u64> {
        self.send(|reply| StateCommand::CountByStatus { status, reply }).await
    }

    /// Look up a memoization entry
    pub async fn memo_get(&self, key: &str) -> StateResponse<Option<MemoryEntry>> {
        self.send(|reply| StateCommand::MemoGet {
            key: key.to_string(),
            reply,
        })
        .await
    }

    /// Write a memoization entry (last writer wins)
    pub async fn memo_put(&self, key: &str, value: serde_json::Value) -> StateResponse<()> {
        self.send(|reply| StateCommand::MemoPut {
            key: key.to_string(),
            value,
            reply,
        })
        .await
    }
}

/// The actor: drains commands until every handle is dropped
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("State actor started");

    while let Some(command) = rx.recv().await {
        match command {
            StateCommand::CreateTask { task, reply } => {
                let result = store.create(&task).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::MarkRunning { id, started_at, reply } => {
                let result = store.mark_running(&id, started_at).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::Settle {
                id,
                settlement,
                completed_at,
                reply,
            } => {
                let result = store.settle(&id, settlement, completed_at).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::GetTask { id, reply } => {
                let result = store.get(&id).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::CountByStatus { status, reply } => {
                let result = store.count_by_status(status).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::MemoGet { key, reply } => {
                let result = store.memo_get(&key).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::MemoPut { key, value, reply } => {
                let result = store.memo_put(&key, &value).map_err(StateError::from);
                let _ = reply.send(result);
            }
        }
    }

    debug!("State actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_task_lifecycle_through_actor() {
        let state = StateManager::spawn_in_memory().unwrap();

        let task = AgentTask::new("t-1", "summarizer", "user-1", json!({"k": 1}));
        state.create_task(task).await.unwrap();

        let running = state.mark_running("t-1", 100).await.unwrap();
        assert_eq!(running.status, TaskStatus::Running);

        let settled = state
            .settle("t-1", Settlement::Completed(json!({"out": 1})), 200)
            .await
            .unwrap();
        assert_eq!(settled.status, TaskStatus::Completed);

        let fetched = state.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(fetched.result, Some(json!({"out": 1})));
    }

    #[tokio::test]
    async fn test_duplicate_create_surfaces_store_error() {
        let state = StateManager::spawn_in_memory().unwrap();

        let task = AgentTask::new("t-1", "summarizer", "user-1", json!({}));
        state.create_task(task.clone()).await.unwrap();

        let err = state.create_task(task).await.unwrap_err();
        assert!(matches!(
            err,
            StateError::Store(paperstore::StoreError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn test_memo_through_actor() {
        let state = StateManager::spawn_in_memory().unwrap();

        assert!(state.memo_get("fp").await.unwrap().is_none());
        state.memo_put("fp", json!({"cached": true})).await.unwrap();

        let entry = state.memo_get("fp").await.unwrap().unwrap();
        assert_eq!(entry.data, json!({"cached": true}));
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let state = StateManager::spawn_in_memory().unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let task = AgentTask::new(format!("t-{i}"), "summarizer", "user-1", json!({}));
                state.create_task(task).await.unwrap();
                state.mark_running(&format!("t-{i}"), 100).await.unwrap();
                state
                    .settle(&format!("t-{i}"), Settlement::Completed(json!({"i": i})), 200)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(state.count_by_status(TaskStatus::Completed).await.unwrap(), 20);
    }
}
