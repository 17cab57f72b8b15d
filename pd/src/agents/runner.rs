//! Shared agent runner
//!
//! [`GuardedCall`] is the guarded path to one provider: every attempt
//! acquires a rate-limiter permit, passes the circuit breaker, runs under
//! the per-call timeout, and reports its outcome back to the breaker.
//! [`ProviderAgent`] wraps a [`StageLogic`] with the behavior every agent
//! shares: replay check, memoization, guarded execution, fallback
//! delegation, and task settlement.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use paperstore::{AgentTask, Settlement, TaskStatus, now_ms};

use super::{Agent, StageContext, StageFailure, StageLogic, truncate_input_strings};
use crate::guard::{AcquireError, CircuitBreaker, Outcome, RateLimiter, RetryError, RetryPolicy};
use crate::llm::{CompletionRequest, LlmClient, LlmError, ProviderKind};
use crate::pipeline::AgentKind;
use crate::state::StateManager;

/// Why a guarded call produced no value
#[derive(Debug)]
pub enum CallError {
    /// Retries exhausted or stopped on a non-retryable error
    Exhausted { last_error: LlmError, attempts: u32 },
    DeadlineExceeded,
    Cancelled,
}

impl CallError {
    pub fn into_failure(self) -> StageFailure {
        match self {
            CallError::Exhausted { last_error, attempts } => StageFailure::new(
                last_error.reason(),
                format!("{last_error} (after {attempts} attempt(s))"),
                last_error.allows_fallback(),
            ),
            CallError::DeadlineExceeded => StageFailure::deadline_exceeded(),
            CallError::Cancelled => StageFailure::cancelled(),
        }
    }
}

/// One provider behind its guards
pub struct GuardedCall {
    client: Arc<dyn LlmClient>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    call_timeout: std::time::Duration,
}

impl GuardedCall {
    pub fn new(
        client: Arc<dyn LlmClient>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        call_timeout: std::time::Duration,
    ) -> Self {
        Self {
            client,
            limiter,
            breaker,
            retry,
            call_timeout,
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.client.provider()
    }

    /// Run one completion to a parsed value under the full guard stack
    ///
    /// `parse` runs inside the retry loop: a response that fails parsing
    /// is an invalid-response and consumes retry budget, while counting
    /// as breaker success (the provider answered).
    pub async fn complete_parsed<T, P>(
        &self,
        request: &CompletionRequest,
        ctx: &StageContext,
        parse: P,
    ) -> Result<T, CallError>
    where
        P: Fn(&str) -> Result<T, String> + Send + Sync,
        T: Send,
    {
        let result = self
            .retry
            .run(&ctx.cancel, ctx.deadline, |attempt| {
                let request = request.clone();
                let parse = &parse;
                async move {
                    debug!(provider = %self.provider(), attempt, "Guarded call");

                    match self.limiter.acquire(&ctx.cancel).await {
                        Ok(()) => {}
                        Err(AcquireError::Overloaded) => {
                            // Backpressure is a health signal
                            self.breaker.record(Outcome::Failure);
                            return Err(LlmError::Overloaded(format!(
                                "{} waiter queue full",
                                self.provider()
                            )));
                        }
                        Err(AcquireError::Cancelled) => return Err(LlmError::Cancelled),
                    }

                    if !self.breaker.allow() {
                        return Err(LlmError::Unavailable(format!("{} circuit open", self.provider())));
                    }

                    // The tightest of the per-call timeout and the stage
                    // deadline governs the in-flight call
                    let call_budget = self
                        .call_timeout
                        .min(ctx.deadline.saturating_duration_since(tokio::time::Instant::now()));

                    let call = self.client.complete(request);
                    let outcome = tokio::select! {
                        result = tokio::time::timeout(call_budget, call) => match result {
                            Ok(inner) => inner,
                            Err(_) => Err(LlmError::Timeout(call_budget)),
                        },
                        _ = ctx.cancel.cancelled() => {
                            // The call is dropped; its result says nothing
                            // about provider health
                            self.breaker.record(Outcome::Neutral);
                            return Err(LlmError::Cancelled);
                        }
                    };

                    match outcome {
                        Ok(response) => {
                            ctx.add_usage(response.usage);
                            // Provider answered: breaker success either way
                            self.breaker.record(Outcome::Success);
                            parse(&response.text).map_err(LlmError::InvalidResponse)
                        }
                        Err(error) => {
                            self.breaker.record(breaker_outcome(&error));
                            Err(error)
                        }
                    }
                }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(RetryError::Cancelled) => Err(CallError::Cancelled),
            Err(RetryError::DeadlineExceeded) => Err(CallError::DeadlineExceeded),
            Err(RetryError::Exhausted {
                last_error: LlmError::Cancelled,
                ..
            }) => Err(CallError::Cancelled),
            Err(RetryError::Exhausted { last_error, attempts }) => Err(CallError::Exhausted { last_error, attempts }),
        }
    }
}

fn breaker_outcome(error: &LlmError) -> Outcome {
    if error.counts_for_breaker() {
        Outcome::Failure
    } else {
        match error {
            // The provider answered; its answer just was not usable
            LlmError::InvalidResponse(_) | LlmError::InvalidRequest(_) => Outcome::Success,
            _ => Outcome::Neutral,
        }
    }
}

/// Degraded-path parameters carried by fallback agents
#[derive(Debug, Clone)]
struct DegradedMode {
    content_cap: usize,
}

/// The shared runner: one [`StageLogic`] behind the common agent behavior
pub struct ProviderAgent {
    logic: Arc<dyn StageLogic>,
    call: GuardedCall,
    state: StateManager,
    fallback: Option<Arc<super::FallbackRegistry>>,
    degraded: Option<DegradedMode>,
}

impl ProviderAgent {
    /// Primary agent; may delegate to the registry after exhaustion
    pub fn primary(
        logic: Arc<dyn StageLogic>,
        call: GuardedCall,
        state: StateManager,
        fallback: Option<Arc<super::FallbackRegistry>>,
    ) -> Self {
        Self {
            logic,
            call,
            state,
            fallback,
            degraded: None,
        }
    }

    /// Fallback agent on the local provider; never recurses into fallback
    pub fn degraded(logic: Arc<dyn StageLogic>, call: GuardedCall, state: StateManager, content_cap: usize) -> Self {
        Self {
            logic,
            call,
            state,
            fallback: None,
            degraded: Some(DegradedMode { content_cap }),
        }
    }

    async fn settle_failure(&self, task: &AgentTask, failure: StageFailure, started: Instant) -> super::StageResult {
        if let Err(e) = self
            .state
            .settle(&task.id, Settlement::Failed(failure.task_error()), now_ms())
            .await
        {
            warn!(task_id = %task.id, error = %e, "Failed to settle task as failed");
        }
        super::StageResult::failed(self.logic.kind(), failure, Default::default(), started.elapsed())
    }
}

#[async_trait]
impl Agent for ProviderAgent {
    fn kind(&self) -> AgentKind {
        self.logic.kind()
    }

    async fn process(&self, task: &AgentTask, ctx: &StageContext) -> super::StageResult {
        let started = Instant::now();
        let kind = self.logic.kind();

        // Idempotent replay: a completed task returns its stored result
        if let Ok(Some(existing)) = self.state.get_task(&task.id).await
            && existing.status == TaskStatus::Completed
        {
            debug!(task_id = %task.id, %kind, "Replaying completed task");
            return super::StageResult::success(
                kind,
                existing.result.unwrap_or(serde_json::Value::Null),
                Default::default(),
                started.elapsed(),
            );
        }

        if let Err(e) = self.state.mark_running(&task.id, now_ms()).await {
            // Illegal transition means the task settled concurrently; a
            // store bug otherwise. Either way this execution stops here.
            warn!(task_id = %task.id, error = %e, "mark_running rejected");
            return super::StageResult::failed(
                kind,
                StageFailure::new("illegal-transition", e.to_string(), false),
                Default::default(),
                started.elapsed(),
            );
        }

        let input = match &self.degraded {
            Some(mode) => truncate_input_strings(&task.input, mode.content_cap),
            None => task.input.clone(),
        };

        if let Err(message) = self.logic.validate_input(&input) {
            return self
                .settle_failure(task, StageFailure::invalid_input(message), started)
                .await;
        }

        // Memoization, primary path only: a hit settles without any
        // provider call
        let fingerprint = match self.logic.fingerprint(&input).await {
            Ok(fp) => fp,
            Err(failure) => return self.settle_failure(task, failure, started).await,
        };

        if self.degraded.is_none()
            && let Some(key) = &fingerprint
            && let Ok(Some(entry)) = self.state.memo_get(key).await
        {
            debug!(task_id = %task.id, %kind, key = %key, "Memoization hit");
            if let Err(e) = self
                .state
                .settle(&task.id, Settlement::Completed(entry.data.clone()), now_ms())
                .await
            {
                warn!(task_id = %task.id, error = %e, "Failed to settle memoized task");
            }
            return super::StageResult::success(kind, entry.data, Default::default(), started.elapsed());
        }

        match self.logic.execute(&input, &self.call, ctx).await {
            Ok(mut payload) => {
                if self.degraded.is_some()
                    && let Some(object) = payload.as_object_mut()
                {
                    object.insert(
                        "processing-note".to_string(),
                        serde_json::Value::String(
                            "processed by the local fallback model with truncated input".to_string(),
                        ),
                    );
                }

                // Degraded payloads are not memoized; a full-quality rerun
                // should not be masked by a cached fallback result
                if self.degraded.is_none()
                    && let Some(key) = &fingerprint
                    && let Err(e) = self.state.memo_put(key, payload.clone()).await
                {
                    warn!(task_id = %task.id, error = %e, "Failed to write memo entry");
                }

                if let Err(e) = self
                    .state
                    .settle(&task.id, Settlement::Completed(payload.clone()), now_ms())
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "Failed to settle task as completed");
                }

                super::StageResult::success(kind, payload, ctx.usage(), started.elapsed())
            }
            Err(failure) => {
                if failure.fallback_eligible
                    && self.degraded.is_none()
                    && let Some(registry) = &self.fallback
                    && let Some(fallback_agent) = registry.get(kind)
                {
                    warn!(task_id = %task.id, %kind, reason = %failure.reason, "Primary exhausted, using fallback");
                    let mut result = fallback_agent.process(task, ctx).await;
                    result.used_fallback = true;
                    result.primary_failure_reason = Some(failure.reason.clone());
                    return result;
                }

                self.settle_failure(task, failure, started).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::{BreakerConfig, RateLimiterConfig, RetryConfig};
    use crate::llm::mock::{MockLlmClient, MockOutcome};
    use serde_json::{Value, json};
    use std::time::Duration;

    fn guarded(client: MockLlmClient) -> GuardedCall {
        guarded_from(Arc::new(client))
    }

    fn guarded_from(client: Arc<MockLlmClient>) -> GuardedCall {
        let limiter = Arc::new(RateLimiter::new(
            ProviderKind::Anthropic,
            RateLimiterConfig {
                capacity: 100,
                refill_per_sec: 100.0,
                high_water: 10,
            },
        ));
        let breaker = Arc::new(CircuitBreaker::new(ProviderKind::Anthropic, BreakerConfig::default()));
        GuardedCall::new(
            client,
            limiter,
            breaker,
            RetryPolicy::new(RetryConfig {
                max_attempts: 3,
                base_delay_ms: 10,
                multiplier: 2.0,
                jitter_fraction: 0.0,
            }),
            Duration::from_secs(60),
        )
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            system_prompt: "sys".into(),
            prompt: "user".into(),
            max_tokens: 100,
            temperature: None,
        }
    }

    fn ctx() -> StageContext {
        StageContext::new(CancelToken::never(), Instant::now() + Duration::from_secs(300))
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_call_success() {
        let call = guarded(MockLlmClient::always(ProviderKind::Anthropic, r#"{"ok": true}"#));
        let ctx = ctx();

        let value: Value = call
            .complete_parsed(&request(), &ctx, |text| super::super::parse_json_response(text))
            .await
            .unwrap();

        assert_eq!(value, json!({"ok": true}));
        assert_eq!(ctx.usage().input_tokens, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_response_retries_then_fails_without_fallback() {
        let client = MockLlmClient::always(ProviderKind::Anthropic, "not json at all");
        let call = guarded(client);

        let result: Result<Value, _> = call
            .complete_parsed(&request(), &ctx(), |text| super::super::parse_json_response(text))
            .await;

        match result {
            Err(CallError::Exhausted { last_error, attempts }) => {
                assert_eq!(attempts, 3);
                let failure = CallError::Exhausted { last_error, attempts }.into_failure();
                assert_eq!(failure.reason, "invalid-response");
                assert!(!failure.fallback_eligible);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_as_fallback_eligible() {
        let client = MockLlmClient::new(
            ProviderKind::Anthropic,
            vec![MockOutcome::Err(|| LlmError::Transient("503".into()))],
        );
        let call = guarded(client);

        let result: Result<Value, _> = call
            .complete_parsed(&request(), &ctx(), |text| super::super::parse_json_response(text))
            .await;

        let failure = match result {
            Err(error) => error.into_failure(),
            Ok(_) => panic!("expected failure"),
        };
        assert_eq!(failure.reason, "provider-transient");
        assert!(failure.fallback_eligible);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_blocks_without_provider_call() {
        let mock = Arc::new(MockLlmClient::always(ProviderKind::Anthropic, "unreachable"));
        let call = guarded_from(mock.clone());

        // Trip the breaker directly
        for _ in 0..BreakerConfig::default().window_size {
            assert!(call.breaker.allow());
            call.breaker.record(Outcome::Failure);
        }

        let result: Result<Value, _> = call
            .complete_parsed(&request(), &ctx(), |text| super::super::parse_json_response(text))
            .await;

        let failure = match result {
            Err(error) => error.into_failure(),
            Ok(_) => panic!("expected failure"),
        };
        assert_eq!(failure.reason, "provider-unavailable");
        assert!(failure.fallback_eligible);

        // Zero calls reached the provider while the circuit was open
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_call() {
        let (handle, token) = crate::cancel::cancel_pair();
        let call = guarded(MockLlmClient::always(ProviderKind::Anthropic, "{}"));
        let ctx = StageContext::new(token, Instant::now() + Duration::from_secs(300));

        handle.cancel();
        let result: Result<Value, _> = call
            .complete_parsed(&request(), &ctx, |text| super::super::parse_json_response(text))
            .await;

        assert!(matches!(result, Err(CallError::Cancelled)));
    }
}
