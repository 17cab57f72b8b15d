//! Pipeline orchestrator
//!
//! Materializes the stage DAG for a request, dispatches stages wave by
//! wave, settles failures down the dependency closure, and reports
//! progress. Task state is persisted at every stage boundary; stage
//! results are handed to the paper store exactly once per success.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use paperstore::{AgentTask, Settlement, TaskStatus, now_ms};

use super::progress::{ProgressBroadcaster, ProgressEvent, ProgressStatus};
use super::request::{PipelineRequest, PipelineResult, PipelineStatus, StageOutcome, StageState};
use super::stage::{AgentKind, partition_waves, validate_stages};
use crate::agents::{Agent, StageContext, StageFailure, StageResult};
use crate::cancel::CancelToken;
use crate::config::PipelineConfig;
use crate::credits::CreditLedger;
use crate::papers::PaperStore;
use crate::state::StateManager;

/// Credits reserved per dispatched stage
const STAGE_CREDIT_COST: u32 = 1;

/// Memo key under which a stage's latest payload for a paper is cached;
/// satisfies dependencies of later requests that skip the stage
fn stage_cache_key(kind: AgentKind, paper_id: &str) -> String {
    format!("stage:{kind}:{paper_id}")
}

/// Live per-request stage states, shared with status queries
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<Mutex<BoardInner>>,
}

struct BoardInner {
    request_id: String,
    states: BTreeMap<AgentKind, StageState>,
    done: bool,
}

impl StatusBoard {
    pub fn new(request: &PipelineRequest) -> Self {
        let states = request
            .stages
            .iter()
            .map(|kind| {
                (
                    *kind,
                    StageState {
                        kind: *kind,
                        status: TaskStatus::Pending,
                        elapsed_ms: 0,
                        used_fallback: false,
                        error: None,
                    },
                )
            })
            .collect();

        Self {
            inner: Arc::new(Mutex::new(BoardInner {
                request_id: request.id.clone(),
                states,
                done: false,
            })),
        }
    }

    fn set_running(&self, kind: AgentKind) {
        let mut inner = self.inner.lock().expect("board lock poisoned");
        if let Some(state) = inner.states.get_mut(&kind) {
            state.status = TaskStatus::Running;
        }
    }

    fn settle(&self, kind: AgentKind, outcome: &StageOutcome) {
        let mut inner = self.inner.lock().expect("board lock poisoned");
        if let Some(state) = inner.states.get_mut(&kind) {
            state.status = outcome.status;
            state.elapsed_ms = outcome.elapsed_ms;
            state.used_fallback = outcome.used_fallback;
            state.error = outcome.error.clone();
        }
    }

    fn finish(&self) {
        self.inner.lock().expect("board lock poisoned").done = true;
    }

    pub fn snapshot(&self) -> PipelineStatus {
        let inner = self.inner.lock().expect("board lock poisoned");
        let total = inner.states.len().max(1);
        let settled = inner.states.values().filter(|s| s.status.is_terminal()).count();

        PipelineStatus {
            request_id: inner.request_id.clone(),
            stages: inner.states.values().cloned().collect(),
            overall_progress: settled as f64 / total as f64,
            done: inner.done,
        }
    }
}

/// Top-level stage scheduler
pub struct Orchestrator {
    agents: HashMap<AgentKind, Arc<dyn Agent>>,
    state: StateManager,
    papers: Arc<dyn PaperStore>,
    credits: Arc<dyn CreditLedger>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        agents: HashMap<AgentKind, Arc<dyn Agent>>,
        state: StateManager,
        papers: Arc<dyn PaperStore>,
        credits: Arc<dyn CreditLedger>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            agents,
            state,
            papers,
            credits,
            config,
        }
    }

    /// Run one request to completion; every requested stage settles
    pub async fn run(
        &self,
        request: &PipelineRequest,
        cancel: CancelToken,
        progress: &ProgressBroadcaster,
        board: &StatusBoard,
    ) -> PipelineResult {
        let run_started = Instant::now();
        let request_deadline = request.deadline.map(|d| run_started + d);
        info!(request_id = %request.id, paper_id = %request.paper_id, stages = request.stages.len(), "Pipeline started");

        // Upstream payloads cached by earlier requests satisfy
        // dependencies the caller chose not to re-run
        let mut outputs: HashMap<AgentKind, Value> = HashMap::new();
        let mut cached: BTreeSet<AgentKind> = BTreeSet::new();
        for kind in AgentKind::all() {
            if request.stages.contains(&kind) {
                continue;
            }
            if let Ok(Some(entry)) = self.state.memo_get(&stage_cache_key(kind, &request.paper_id)).await {
                debug!(stage = %kind, "Using cached upstream payload");
                outputs.insert(kind, entry.data);
                cached.insert(kind);
            }
        }

        let mut outcomes: BTreeMap<AgentKind, StageOutcome> = BTreeMap::new();

        let descriptors = match validate_stages(&request.stages, &cached) {
            Ok(descriptors) => descriptors,
            Err(message) => {
                // Submission validates too; this guards direct callers
                warn!(request_id = %request.id, %message, "Pipeline rejected");
                for kind in &request.stages {
                    self.settle_undispatched(
                        request,
                        *kind,
                        StageFailure::invalid_input(message.clone()),
                        progress,
                        board,
                        &mut outcomes,
                    )
                    .await;
                }
                board.finish();
                return PipelineResult {
                    request_id: request.id.clone(),
                    success: false,
                    stages: outcomes,
                };
            }
        };

        let platform_metadata = self.papers.load_metadata(&request.paper_id).await.unwrap_or(Value::Null);

        let waves = partition_waves(&descriptors);
        let mut skip: HashSet<AgentKind> = HashSet::new();

        for (wave_index, wave) in waves.into_iter().enumerate() {
            let wave: Vec<AgentKind> = wave.into_iter().filter(|kind| !skip.contains(kind)).collect();
            if wave.is_empty() {
                continue;
            }

            // No new dispatches once cancelled or past the deadline
            if cancel.is_cancelled() {
                self.settle_remaining(request, StageFailure::cancelled(), progress, board, &mut outcomes)
                    .await;
                break;
            }
            if let Some(deadline) = request_deadline
                && Instant::now() >= deadline
            {
                self.settle_remaining(
                    request,
                    StageFailure::deadline_exceeded(),
                    progress,
                    board,
                    &mut outcomes,
                )
                .await;
                break;
            }

            debug!(request_id = %request.id, wave = wave_index, stages = ?wave, "Dispatching wave");

            let mut dispatched = Vec::new();
            for kind in &wave {
                match self.dispatch_stage(request, *kind, &outputs, &platform_metadata, &cancel, request_deadline, progress, board).await {
                    Ok(handle) => dispatched.push((*kind, handle)),
                    Err(outcome) => {
                        board.settle(*kind, &outcome);
                        self.emit_settled(request, *kind, &outcome, progress);
                        outcomes.insert(*kind, outcome);
                    }
                }
            }

            // Await the whole wave; settlement events flow in dispatch order
            for (kind, dispatch) in dispatched {
                let result = match dispatch.handle.await {
                    Ok(result) => result,
                    Err(join_error) => {
                        error!(stage = %kind, error = %join_error, "Stage task panicked");
                        StageResult::failed(
                            kind,
                            StageFailure::new("invalid-input", format!("stage task failed: {join_error}"), false),
                            Default::default(),
                            Default::default(),
                        )
                    }
                };

                let outcome = self
                    .settle_dispatched(request, kind, result, dispatch.reservation)
                    .await;

                if outcome.succeeded()
                    && let Some(payload) = &outcome.payload
                {
                    outputs.insert(kind, payload.clone());
                }

                board.settle(kind, &outcome);
                self.emit_settled(request, kind, &outcome, progress);
                outcomes.insert(kind, outcome);
            }

            // A failure fails its downstream transitive closure immediately;
            // independent stages in later waves continue
            let failed: Vec<AgentKind> = wave
                .iter()
                .copied()
                .filter(|kind| !outcomes.get(kind).map(StageOutcome::succeeded).unwrap_or(false))
                .collect();

            for failed_kind in failed {
                for downstream in failed_kind.downstream_of(&request.stages) {
                    if outcomes.contains_key(&downstream) || skip.contains(&downstream) {
                        continue;
                    }
                    self.settle_undispatched(
                        request,
                        downstream,
                        StageFailure::upstream_failed(failed_kind),
                        progress,
                        board,
                        &mut outcomes,
                    )
                    .await;
                    skip.insert(downstream);
                }
            }
        }

        let success = request
            .stages
            .iter()
            .all(|kind| outcomes.get(kind).map(StageOutcome::succeeded).unwrap_or(false));

        board.finish();
        info!(request_id = %request.id, success, "Pipeline finished");

        PipelineResult {
            request_id: request.id.clone(),
            success,
            stages: outcomes,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_stage(
        &self,
        request: &PipelineRequest,
        kind: AgentKind,
        outputs: &HashMap<AgentKind, Value>,
        platform_metadata: &Value,
        cancel: &CancelToken,
        request_deadline: Option<Instant>,
        progress: &ProgressBroadcaster,
        board: &StatusBoard,
    ) -> Result<Dispatch, StageOutcome> {
        let input = build_stage_input(kind, request, outputs, platform_metadata);
        let task = AgentTask::new(request.task_id(kind), kind.as_str(), &request.user_id, input);

        if let Err(e) = self.state.create_task(task.clone()).await {
            error!(stage = %kind, error = %e, "Task creation failed");
            return Err(failure_outcome(
                &StageFailure::new("duplicate-id", e.to_string(), false),
                0,
            ));
        }

        // Credits are reserved before dispatch; the reservation covers the
        // stage regardless of which provider ends up serving it
        let reservation = match self.credits.reserve(&request.user_id, kind, STAGE_CREDIT_COST).await {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!(stage = %kind, error = %e, "Credit reservation failed");
                let failure = StageFailure::new("credit-reservation-failed", e.to_string(), false);
                let _ = self
                    .state
                    .settle(&task.id, Settlement::Failed(failure.task_error()), now_ms())
                    .await;
                return Err(failure_outcome(&failure, 0));
            }
        };

        board.set_running(kind);
        progress.emit(ProgressEvent {
            request_id: request.id.clone(),
            stage: kind,
            status: ProgressStatus::Started,
            elapsed_ms: 0,
            used_fallback: false,
        });

        let Some(agent) = self.agents.get(&kind).cloned() else {
            let failure = StageFailure::new("invalid-input", format!("no agent registered for {kind}"), false);
            let _ = self
                .state
                .settle(&task.id, Settlement::Failed(failure.task_error()), now_ms())
                .await;
            let _ = self.credits.release(&reservation).await;
            return Err(failure_outcome(&failure, 0));
        };

        // Tightest of stage budget and request deadline governs the stage
        let stage_deadline = {
            let budget = Instant::now() + self.config.stage_budget();
            match request_deadline {
                Some(deadline) => budget.min(deadline),
                None => budget,
            }
        };

        let ctx = StageContext::new(cancel.clone(), stage_deadline);
        let handle = tokio::spawn(async move { agent.process(&task, &ctx).await });

        Ok(Dispatch { handle, reservation })
    }

    /// Post-settlement bookkeeping for a dispatched stage
    async fn settle_dispatched(
        &self,
        request: &PipelineRequest,
        kind: AgentKind,
        result: StageResult,
        reservation: String,
    ) -> StageOutcome {
        let elapsed_ms = result.elapsed.as_millis() as u64;

        if let Some(payload) = &result.payload
            && result.succeeded()
        {
            // Exactly once per successful stage per request
            if let Err(e) = self.papers.save_results(&request.paper_id, kind, payload).await {
                error!(stage = %kind, error = %e, "save_results failed");
            }
            if let Err(e) = self
                .state
                .memo_put(&stage_cache_key(kind, &request.paper_id), payload.clone())
                .await
            {
                warn!(stage = %kind, error = %e, "Stage cache write failed");
            }
            if let Err(e) = self.credits.commit(&reservation).await {
                warn!(stage = %kind, error = %e, "Credit commit failed");
            }

            return StageOutcome {
                status: TaskStatus::Completed,
                payload: Some(payload.clone()),
                error: None,
                used_fallback: result.used_fallback,
                primary_failure_reason: result.primary_failure_reason,
                elapsed_ms,
            };
        }

        if let Err(e) = self.credits.release(&reservation).await {
            warn!(stage = %kind, error = %e, "Credit release failed");
        }

        let failure = result
            .failure
            .unwrap_or_else(|| StageFailure::new("invalid-input", "stage produced no payload", false));

        StageOutcome {
            status: TaskStatus::Failed,
            payload: None,
            error: Some(failure.task_error()),
            used_fallback: result.used_fallback,
            primary_failure_reason: result.primary_failure_reason,
            elapsed_ms,
        }
    }

    /// Create and immediately settle a task that never dispatched
    /// (upstream failure, cancellation, deadline)
    async fn settle_undispatched(
        &self,
        request: &PipelineRequest,
        kind: AgentKind,
        failure: StageFailure,
        progress: &ProgressBroadcaster,
        board: &StatusBoard,
        outcomes: &mut BTreeMap<AgentKind, StageOutcome>,
    ) {
        let task_id = request.task_id(kind);
        let task = AgentTask::new(&task_id, kind.as_str(), &request.user_id, json!({"paper-id": request.paper_id}));

        // The task may exist if a prior run of this request created it
        match self.state.create_task(task).await {
            Ok(()) => {}
            Err(e) => debug!(%task_id, error = %e, "Task exists, settling in place"),
        }
        if let Err(e) = self
            .state
            .settle(&task_id, Settlement::Failed(failure.task_error()), now_ms())
            .await
        {
            warn!(%task_id, error = %e, "Failed to settle undispatched task");
        }

        let outcome = failure_outcome(&failure, 0);
        board.settle(kind, &outcome);
        self.emit_settled(request, kind, &outcome, progress);
        outcomes.insert(kind, outcome);
    }

    /// Settle every requested stage that has no outcome yet
    async fn settle_remaining(
        &self,
        request: &PipelineRequest,
        failure: StageFailure,
        progress: &ProgressBroadcaster,
        board: &StatusBoard,
        outcomes: &mut BTreeMap<AgentKind, StageOutcome>,
    ) {
        info!(request_id = %request.id, reason = %failure.reason, "Settling remaining stages");
        let remaining: Vec<AgentKind> = request
            .stages
            .iter()
            .copied()
            .filter(|kind| !outcomes.contains_key(kind))
            .collect();

        for kind in remaining {
            self.settle_undispatched(request, kind, failure.clone(), progress, board, outcomes)
                .await;
        }
    }

    fn emit_settled(
        &self,
        request: &PipelineRequest,
        kind: AgentKind,
        outcome: &StageOutcome,
        progress: &ProgressBroadcaster,
    ) {
        progress.emit(ProgressEvent {
            request_id: request.id.clone(),
            stage: kind,
            status: if outcome.succeeded() {
                ProgressStatus::Completed
            } else {
                ProgressStatus::Failed
            },
            elapsed_ms: outcome.elapsed_ms,
            used_fallback: outcome.used_fallback,
        });
    }
}

struct Dispatch {
    handle: tokio::task::JoinHandle<StageResult>,
    reservation: String,
}

fn failure_outcome(failure: &StageFailure, elapsed_ms: u64) -> StageOutcome {
    StageOutcome {
        status: TaskStatus::Failed,
        payload: None,
        error: Some(failure.task_error()),
        used_fallback: false,
        primary_failure_reason: None,
        elapsed_ms,
    }
}

/// Assemble one stage's input from upstream payloads and platform data
fn build_stage_input(
    kind: AgentKind,
    request: &PipelineRequest,
    outputs: &HashMap<AgentKind, Value>,
    platform_metadata: &Value,
) -> Value {
    let full_text = outputs
        .get(&AgentKind::TextExtractor)
        .and_then(|payload| payload.get("full-text"))
        .cloned()
        // A request running on cached summaries may lack the extraction;
        // the detailed summary is the best remaining text source
        .or_else(|| {
            outputs
                .get(&AgentKind::Summarizer)
                .and_then(|payload| payload.get("detailed"))
                .cloned()
        })
        .unwrap_or(Value::Null);

    match kind {
        AgentKind::TextExtractor => json!({"paper-id": request.paper_id}),
        AgentKind::MetadataEnhancer => json!({
            "full-text": full_text,
            "title-hint": platform_metadata.get("title").cloned().unwrap_or(Value::Null),
        }),
        AgentKind::Summarizer => json!({
            "full-text": full_text,
            "metadata": outputs.get(&AgentKind::MetadataEnhancer).cloned().unwrap_or(Value::Null),
        }),
        AgentKind::ConceptExplainer => json!({
            "full-text": full_text,
            "key-terms": platform_metadata.get("key-terms").cloned().unwrap_or(Value::Null),
        }),
        AgentKind::QualityChecker => json!({
            "summary": outputs
                .get(&AgentKind::Summarizer)
                .and_then(|payload| payload.get("standard"))
                .cloned()
                .unwrap_or(Value::Null),
            "full-text": full_text,
        }),
        AgentKind::CitationFormatter => json!({"full-text": full_text}),
        AgentKind::Discoverer => json!({
            "metadata": outputs.get(&AgentKind::MetadataEnhancer).cloned().unwrap_or(Value::Null),
        }),
    }
}
