//! SQLite-backed store for agent tasks and memoization entries

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::now_ms;
use crate::task::{AgentTask, Settlement, TaskStatus};

/// Store tuning knobs
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum retained memoization entries; least-recently-written
    /// entries beyond this are trimmed on write
    pub memory_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { memory_cap: 10_000 }
    }
}

/// One memoization entry, keyed by a content fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub data: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Durable store over the `agent_tasks` and `agent_memory` tables
///
/// The store itself is synchronous; the pipeline core wraps it in a
/// single-writer actor, which gives per-task-id serialization for free.
pub struct Store {
    conn: Connection,
    config: StoreConfig,
}

impl Store {
    /// Open (or create) a store at the given path
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Opening store");
        Self::init(conn, config)
    }

    /// Open an in-memory store (tests, demo runs)
    pub fn in_memory(config: StoreConfig) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, config)
    }

    fn init(conn: Connection, config: StoreConfig) -> Result<Self, StoreError> {
        // WAL keeps settled tasks durable across a crash without
        // serializing readers behind writers.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agent_tasks (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                input_json TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                result_json TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_agent_tasks_user ON agent_tasks(user_id);
            CREATE INDEX IF NOT EXISTS idx_agent_tasks_agent ON agent_tasks(agent_id);
            CREATE INDEX IF NOT EXISTS idx_agent_tasks_status ON agent_tasks(status);

            CREATE TABLE IF NOT EXISTS agent_memory (
                key TEXT PRIMARY KEY,
                data_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_memory_updated ON agent_memory(updated_at);
            "#,
        )?;

        info!("Store schema ready");
        Ok(Self { conn, config })
    }

    // === agent_tasks ===

    /// Insert a new pending task; fails with `DuplicateId` if the id exists
    pub fn create(&mut self, task: &AgentTask) -> Result<(), StoreError> {
        let input_json = serde_json::to_string(&task.input)?;
        let result_json = task.result.as_ref().map(serde_json::to_string).transpose()?;

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO agent_tasks
             (id, agent_id, user_id, input_json, status, error, result_json, created_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id,
                task.agent_id,
                task.user_id,
                input_json,
                task.status.as_str(),
                task.error,
                result_json,
                task.created_at,
                task.started_at,
                task.completed_at,
            ],
        )?;

        if inserted == 0 {
            return Err(StoreError::DuplicateId(task.id.clone()));
        }

        debug!(task_id = %task.id, agent_id = %task.agent_id, "Task created");
        Ok(())
    }

    /// Transition `pending -> running`
    ///
    /// Idempotent: if the task is already running, the earlier `started_at`
    /// is kept. Transitions out of a terminal state are rejected.
    pub fn mark_running(&mut self, id: &str, started_at: i64) -> Result<AgentTask, StoreError> {
        let task = self.get_required(id)?;

        match task.status {
            TaskStatus::Pending => {
                self.conn.execute(
                    "UPDATE agent_tasks SET status = 'running', started_at = ?2 WHERE id = ?1",
                    params![id, started_at],
                )?;
                debug!(task_id = %id, started_at, "Task running");
                self.get_required(id)
            }
            TaskStatus::Running => {
                // Keep the earlier start time
                let earlier = task.started_at.map(|s| s.min(started_at)).unwrap_or(started_at);
                if task.started_at != Some(earlier) {
                    self.conn.execute(
                        "UPDATE agent_tasks SET started_at = ?2 WHERE id = ?1",
                        params![id, earlier],
                    )?;
                }
                self.get_required(id)
            }
            terminal => Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: terminal.as_str().to_string(),
                to: "running".to_string(),
            }),
        }
    }

    /// Settle a task to a terminal state
    ///
    /// Idempotent when re-settling to the same terminal state with the same
    /// payload; any other re-settlement is an `IllegalTransition`.
    pub fn settle(&mut self, id: &str, settlement: Settlement, completed_at: i64) -> Result<AgentTask, StoreError> {
        let task = self.get_required(id)?;
        let target = settlement.status();

        if task.is_terminal() {
            let same = match (&settlement, &task) {
                (Settlement::Completed(result), t) => {
                    t.status == TaskStatus::Completed && t.result.as_ref() == Some(result)
                }
                (Settlement::Failed(error), t) => t.status == TaskStatus::Failed && t.error.as_deref() == Some(error),
            };
            if same {
                debug!(task_id = %id, status = %target, "Settle replayed, no-op");
                return Ok(task);
            }
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: task.status.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }

        // started_at <= completed_at must hold once both are present
        let completed_at = task.started_at.map(|s| s.max(completed_at)).unwrap_or(completed_at);

        match settlement {
            Settlement::Completed(result) => {
                let result_json = serde_json::to_string(&result)?;
                self.conn.execute(
                    "UPDATE agent_tasks
                     SET status = 'completed', result_json = ?2, error = NULL, completed_at = ?3
                     WHERE id = ?1",
                    params![id, result_json, completed_at],
                )?;
            }
            Settlement::Failed(error) => {
                self.conn.execute(
                    "UPDATE agent_tasks
                     SET status = 'failed', error = ?2, completed_at = ?3
                     WHERE id = ?1",
                    params![id, error, completed_at],
                )?;
            }
        }

        debug!(task_id = %id, status = %target, "Task settled");
        self.get_required(id)
    }

    /// Fetch a task by id
    pub fn get(&self, id: &str) -> Result<Option<AgentTask>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, agent_id, user_id, input_json, status, error, result_json,
                        created_at, started_at, completed_at
                 FROM agent_tasks WHERE id = ?1",
                params![id],
                Self::row_to_task,
            )
            .optional()?;

        Ok(row)
    }

    fn get_required(&self, id: &str) -> Result<AgentTask, StoreError> {
        self.get(id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// List tasks for a user, newest first
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<AgentTask>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, user_id, input_json, status, error, result_json,
                    created_at, started_at, completed_at
             FROM agent_tasks WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id], Self::row_to_task)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Count tasks per status (metrics snapshot)
    pub fn count_by_status(&self, status: TaskStatus) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM agent_tasks WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentTask> {
        let json_err = |idx: usize| {
            move |e: serde_json::Error| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            }
        };

        let input_json: String = row.get(3)?;
        let status_str: String = row.get(4)?;
        let result_json: Option<String> = row.get(6)?;

        Ok(AgentTask {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            user_id: row.get(2)?,
            input: serde_json::from_str(&input_json).map_err(json_err(3))?,
            status: TaskStatus::parse(&status_str).unwrap_or_default(),
            error: row.get(5)?,
            result: result_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(json_err(6))?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    // === agent_memory ===

    /// Look up a memoization entry by fingerprint
    pub fn memo_get(&self, key: &str) -> Result<Option<MemoryEntry>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT key, data_json, created_at, updated_at FROM agent_memory WHERE key = ?1",
                params![key],
                |row| {
                    let data_json: String = row.get(1)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        data_json,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((key, data_json, created_at, updated_at)) => Ok(Some(MemoryEntry {
                key,
                data: serde_json::from_str(&data_json)?,
                created_at,
                updated_at,
            })),
            None => Ok(None),
        }
    }

    /// Upsert a memoization entry; concurrent writers converge to the
    /// last written value
    pub fn memo_put(&mut self, key: &str, data: &serde_json::Value) -> Result<(), StoreError> {
        let data_json = serde_json::to_string(data)?;
        let now = now_ms();

        self.conn.execute(
            "INSERT INTO agent_memory (key, data_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(key) DO UPDATE SET data_json = ?2, updated_at = ?3",
            params![key, data_json, now],
        )?;

        self.trim_memory()?;
        Ok(())
    }

    /// Trim least-recently-written entries beyond the cap
    fn trim_memory(&mut self) -> Result<(), StoreError> {
        // rowid breaks millisecond ties in insertion order
        let trimmed = self.conn.execute(
            "DELETE FROM agent_memory WHERE key NOT IN
             (SELECT key FROM agent_memory ORDER BY updated_at DESC, rowid DESC LIMIT ?1)",
            params![self.config.memory_cap as i64],
        )?;
        if trimmed > 0 {
            warn!(trimmed, cap = self.config.memory_cap, "Trimmed memoization entries");
        }
        Ok(())
    }

    /// Number of retained memoization entries
    pub fn memo_len(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM agent_memory", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Store {
        Store::in_memory(StoreConfig::default()).unwrap()
    }

    fn task(id: &str) -> AgentTask {
        AgentTask::new(id, "summarizer", "user-1", json!({"paper-id": "p-1"}))
    }

    #[test]
    fn test_create_and_get() {
        let mut store = store();
        store.create(&task("t-1")).unwrap();

        let fetched = store.get("t-1").unwrap().unwrap();
        assert_eq!(fetched.id, "t-1");
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert_eq!(fetched.input, json!({"paper-id": "p-1"}));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut store = store();
        store.create(&task("t-1")).unwrap();

        let err = store.create(&task("t-1")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "t-1"));
    }

    #[test]
    fn test_get_absent() {
        let store = store();
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_full_lifecycle() {
        let mut store = store();
        store.create(&task("t-1")).unwrap();

        let running = store.mark_running("t-1", 100).unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.started_at, Some(100));

        let settled = store
            .settle("t-1", Settlement::Completed(json!({"brief": "b"})), 200)
            .unwrap();
        assert_eq!(settled.status, TaskStatus::Completed);
        assert_eq!(settled.result, Some(json!({"brief": "b"})));
        assert_eq!(settled.error, None);
        assert_eq!(settled.completed_at, Some(200));
        assert!(settled.invariants_hold());
    }

    #[test]
    fn test_mark_running_keeps_earlier_start() {
        let mut store = store();
        store.create(&task("t-1")).unwrap();

        store.mark_running("t-1", 100).unwrap();
        let replayed = store.mark_running("t-1", 500).unwrap();
        assert_eq!(replayed.started_at, Some(100));

        // An earlier replay wins too
        let replayed = store.mark_running("t-1", 50).unwrap();
        assert_eq!(replayed.started_at, Some(50));
    }

    #[test]
    fn test_mark_running_after_settle_rejected() {
        let mut store = store();
        store.create(&task("t-1")).unwrap();
        store.mark_running("t-1", 100).unwrap();
        store.settle("t-1", Settlement::Failed("boom".into()), 200).unwrap();

        let err = store.mark_running("t-1", 300).unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn test_settle_idempotent_same_payload() {
        let mut store = store();
        store.create(&task("t-1")).unwrap();
        store.mark_running("t-1", 100).unwrap();

        store
            .settle("t-1", Settlement::Completed(json!({"n": 1})), 200)
            .unwrap();
        let replay = store
            .settle("t-1", Settlement::Completed(json!({"n": 1})), 999)
            .unwrap();

        // Replay is a no-op; original completion time kept
        assert_eq!(replay.completed_at, Some(200));
    }

    #[test]
    fn test_settle_conflicting_payload_rejected() {
        let mut store = store();
        store.create(&task("t-1")).unwrap();
        store.mark_running("t-1", 100).unwrap();
        store
            .settle("t-1", Settlement::Completed(json!({"n": 1})), 200)
            .unwrap();

        let err = store
            .settle("t-1", Settlement::Completed(json!({"n": 2})), 300)
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        let err = store.settle("t-1", Settlement::Failed("late".into()), 300).unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[test]
    fn test_settle_from_pending_allowed() {
        // Upstream failures settle tasks that never ran
        let mut store = store();
        store.create(&task("t-1")).unwrap();

        let settled = store
            .settle("t-1", Settlement::Failed("upstream-failed".into()), 200)
            .unwrap();
        assert_eq!(settled.status, TaskStatus::Failed);
        assert_eq!(settled.error.as_deref(), Some("upstream-failed"));
        assert!(settled.invariants_hold());
    }

    #[test]
    fn test_settle_clamps_completed_at() {
        let mut store = store();
        store.create(&task("t-1")).unwrap();
        store.mark_running("t-1", 500).unwrap();

        // Clock skew: completion reported before start
        let settled = store
            .settle("t-1", Settlement::Completed(json!({})), 100)
            .unwrap();
        assert!(settled.started_at.unwrap() <= settled.completed_at.unwrap());
    }

    #[test]
    fn test_list_for_user() {
        let mut store = store();
        store.create(&task("t-1")).unwrap();
        store.create(&task("t-2")).unwrap();
        store
            .create(&AgentTask::new("t-3", "summarizer", "user-2", json!({})))
            .unwrap();

        let tasks = store.list_for_user("user-1").unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.user_id == "user-1"));
    }

    #[test]
    fn test_count_by_status() {
        let mut store = store();
        store.create(&task("t-1")).unwrap();
        store.create(&task("t-2")).unwrap();
        store.mark_running("t-1", 100).unwrap();

        assert_eq!(store.count_by_status(TaskStatus::Pending).unwrap(), 1);
        assert_eq!(store.count_by_status(TaskStatus::Running).unwrap(), 1);
        assert_eq!(store.count_by_status(TaskStatus::Completed).unwrap(), 0);
    }

    #[test]
    fn test_memo_roundtrip() {
        let mut store = store();
        assert!(store.memo_get("fp-1").unwrap().is_none());

        store.memo_put("fp-1", &json!({"full-text": "abc"})).unwrap();
        let entry = store.memo_get("fp-1").unwrap().unwrap();
        assert_eq!(entry.data, json!({"full-text": "abc"}));
        assert_eq!(entry.created_at, entry.updated_at);
    }

    #[test]
    fn test_memo_last_writer_wins() {
        let mut store = store();
        store.memo_put("fp-1", &json!({"v": 1})).unwrap();
        store.memo_put("fp-1", &json!({"v": 2})).unwrap();

        let entry = store.memo_get("fp-1").unwrap().unwrap();
        assert_eq!(entry.data, json!({"v": 2}));
        assert!(entry.updated_at >= entry.created_at);
        assert_eq!(store.memo_len().unwrap(), 1);
    }

    #[test]
    fn test_memo_trimmed_beyond_cap() {
        let mut store = Store::in_memory(StoreConfig { memory_cap: 3 }).unwrap();

        for i in 0..5 {
            store.memo_put(&format!("fp-{i}"), &json!({"i": i})).unwrap();
        }

        assert_eq!(store.memo_len().unwrap(), 3);
        // The most recent write always survives
        assert!(store.memo_get("fp-4").unwrap().is_some());
    }

    #[test]
    fn test_durable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");

        {
            let mut store = Store::open(&path, StoreConfig::default()).unwrap();
            store.create(&task("t-1")).unwrap();
            store.mark_running("t-1", 100).unwrap();
            store
                .settle("t-1", Settlement::Completed(json!({"ok": true})), 200)
                .unwrap();
        }

        let store = Store::open(&path, StoreConfig::default()).unwrap();
        let fetched = store.get("t-1").unwrap().unwrap();
        // Settled state is never observed as non-terminal after reopen
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.result, Some(json!({"ok": true})));
    }

    mod transitions {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            MarkRunning(i64),
            SettleOk(i64),
            SettleErr(i64),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0i64..1000).prop_map(Op::MarkRunning),
                (0i64..1000).prop_map(Op::SettleOk),
                (0i64..1000).prop_map(Op::SettleErr),
            ]
        }

        proptest! {
            // Any interleaving of operations leaves the record satisfying
            // the payload and ordering invariants, and a settled task
            // never leaves its terminal state.
            #[test]
            fn task_invariants_hold(ops in proptest::collection::vec(op_strategy(), 1..12)) {
                let mut store = Store::in_memory(StoreConfig::default()).unwrap();
                store.create(&task("t-1")).unwrap();

                let mut terminal: Option<TaskStatus> = None;
                for op in ops {
                    let result = match op {
                        Op::MarkRunning(at) => store.mark_running("t-1", at).map(|_| ()),
                        Op::SettleOk(at) => store
                            .settle("t-1", Settlement::Completed(serde_json::json!({"ok": true})), at)
                            .map(|_| ()),
                        Op::SettleErr(at) => store
                            .settle("t-1", Settlement::Failed("boom".into()), at)
                            .map(|_| ()),
                    };
                    // Errors are fine; corruption is not
                    let _ = result;

                    let current = store.get("t-1").unwrap().unwrap();
                    prop_assert!(current.invariants_hold());

                    if let Some(t) = terminal {
                        prop_assert_eq!(current.status, t);
                    } else if current.is_terminal() {
                        terminal = Some(current.status);
                    }
                }
            }
        }
    }
}
