//! Step execution with timeout, retry, and bounded parallel fan-out.
//!
//! `StepExecutor` runs one step function with a timeout race and
//! retry-with-backoff; `ParallelExecutor` fans a set of step functions out
//! under a concurrency cap and joins them with one of three strategies.
//! `ExecutionContext` is the shared, cloneable handle to the live execution
//! state that step bodies read and write.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use skein_types::workflow::{FailureKind, RetryPolicy, WorkflowState, WorkflowStatus};

use super::variables::VariableResolver;

/// Default per-step timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Default parallel fan-out cap.
pub const DEFAULT_PARALLEL_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// Status and results
// ---------------------------------------------------------------------------

/// Status of a step or workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
    Retrying,
    Paused,
}

/// Result of executing one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Result of a whole workflow execution.
///
/// `run` never panics or returns a transport error: every outcome is encoded
/// here. `status == Success` implies every step result succeeded;
/// `status == Failed` implies a failed step or an engine-level error string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    /// Final variable scope on success.
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine-wide execution configuration.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Default per-step timeout; `None` disables the race.
    pub step_timeout: Option<Duration>,
    /// Default retry policy when a step declares none.
    pub retry_policy: Option<RetryPolicy>,
    /// Take a checkpoint before each step.
    pub checkpoint_each_step: bool,
    /// Halt the workflow on the first failed step.
    pub fail_fast: bool,
    /// Concurrency cap for parallel fan-out.
    pub parallel_limit: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            step_timeout: Some(DEFAULT_STEP_TIMEOUT),
            retry_policy: None,
            checkpoint_each_step: true,
            fail_fast: false,
            parallel_limit: DEFAULT_PARALLEL_LIMIT,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Shared handle to a running execution.
///
/// Cloning is cheap; all clones observe the same state, cancellation flag,
/// and pause flag. The state mutex is only held for synchronous reads and
/// writes, never across an await point.
#[derive(Clone)]
pub struct ExecutionContext {
    state: Arc<std::sync::Mutex<WorkflowState>>,
    config: Arc<ExecutionConfig>,
    cancelled: CancellationToken,
    paused: Arc<AtomicBool>,
    resolver: VariableResolver,
}

impl ExecutionContext {
    pub fn new(state: WorkflowState, config: ExecutionConfig) -> Self {
        Self {
            state: Arc::new(std::sync::Mutex::new(state)),
            config: Arc::new(config),
            cancelled: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
            resolver: VariableResolver::new(),
        }
    }

    pub fn execution_id(&self) -> String {
        self.state.lock().unwrap().execution_id.clone()
    }

    pub fn workflow_id(&self) -> String {
        self.state.lock().unwrap().workflow_id.clone()
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Snapshot of the current variable scope.
    pub fn variables(&self) -> HashMap<String, Value> {
        self.state.lock().unwrap().variables.clone()
    }

    /// Deep copy of the full execution state (for checkpointing).
    pub fn snapshot(&self) -> WorkflowState {
        self.state.lock().unwrap().clone()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.state.lock().unwrap().set_variable(name, value);
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.state.lock().unwrap().get_variable(name).cloned()
    }

    /// Resolve a `${...}` template against the current scope.
    pub fn resolve(&self, template: &str) -> Value {
        self.resolver.resolve(template, &self.variables())
    }

    /// Resolve a template and coerce the result to a string.
    pub fn resolve_string(&self, template: &str) -> String {
        self.resolver.resolve_string(template, &self.variables())
    }

    /// Evaluate a condition expression against the current scope.
    pub fn evaluate_condition(&self, condition: &str) -> bool {
        self.resolver.evaluate_condition(condition, &self.variables())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Request cancellation. The engine observes this between steps; step
    /// bodies may also watch the token to stop early.
    pub fn cancel(&self) {
        self.cancelled.cancel();
        self.state.lock().unwrap().status = WorkflowStatus::Cancelled;
    }

    /// The cancellation token backing [`ExecutionContext::is_cancelled`].
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancelled
    }

    /// Request a pause. The engine checkpoints and returns between steps.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.state.lock().unwrap().status = WorkflowStatus::Paused;
    }

    /// Clear the pause flag and mark the execution running again.
    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.state.lock().unwrap().status = WorkflowStatus::Running;
    }

    /// Output of a previously completed step, if any.
    pub fn step_output(&self, step_id: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .step_states
            .get(step_id)
            .and_then(|s| s.output.clone())
    }

    /// Apply a closure to the state under the lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut WorkflowState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Merge a step result into the scope: the step output under its id,
    /// plus the `_last` / `_last_step` shortcuts.
    pub fn record_result(&self, step_id: &str, result: &StepResult) {
        let mut state = self.state.lock().unwrap();
        if let Some(output) = &result.output {
            state.set_variable(step_id.to_string(), output.clone());
            state.set_variable("_last", output.clone());
            state.set_variable("_last_step", Value::String(step_id.to_string()));
        }
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// A boxed async step body, usable across spawn boundaries.
pub type StepFn =
    Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Runs a single step with timeout and retry-with-backoff.
pub struct StepExecutor {
    config: Arc<ExecutionConfig>,
}

impl StepExecutor {
    pub fn new(config: ExecutionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Execute `step_fn` for `step_id`.
    ///
    /// Attempts run up to `max_retries + 1` times. Each attempt races the
    /// effective timeout; timeouts and errors matched by the retry policy's
    /// failure set back off `min(initial * multiplier^attempt, max)` before
    /// the next attempt. A set cancellation flag short-circuits to
    /// `Cancelled` without retrying.
    pub async fn execute<F, Fut>(
        &self,
        step_id: &str,
        step_fn: F,
        ctx: &ExecutionContext,
        retry_policy: Option<&RetryPolicy>,
        timeout_override: Option<Duration>,
    ) -> StepResult
    where
        F: Fn(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<Value, String>>,
    {
        let no_retry = RetryPolicy::none();
        let policy = retry_policy
            .or(self.config.retry_policy.as_ref())
            .unwrap_or(&no_retry);
        let timeout = timeout_override.or(self.config.step_timeout);

        let started_at = Utc::now();
        let start = std::time::Instant::now();
        let mut result = StepResult {
            step_id: step_id.to_string(),
            status: ExecutionStatus::Running,
            output: None,
            error: None,
            started_at: Some(started_at),
            completed_at: None,
            duration_ms: 0.0,
            retry_count: 0,
            metadata: HashMap::new(),
        };

        ctx.with_state(|s| s.mark_step_started(step_id, None));

        let mut attempt: u32 = 0;
        let mut last_error: Option<String> = None;
        let mut last_kind = FailureKind::Error;

        loop {
            if ctx.is_cancelled() {
                result.status = ExecutionStatus::Cancelled;
                result.error = Some("execution cancelled".to_string());
                break;
            }

            let outcome: Result<Value, (FailureKind, String)> = match timeout {
                Some(dur) => match tokio::time::timeout(dur, step_fn(ctx.clone())).await {
                    Ok(Ok(v)) => Ok(v),
                    Ok(Err(e)) => Err((FailureKind::Error, e)),
                    Err(_) => Err((
                        FailureKind::Timeout,
                        format!("timeout after {}s", dur.as_secs_f64()),
                    )),
                },
                None => step_fn(ctx.clone())
                    .await
                    .map_err(|e| (FailureKind::Error, e)),
            };

            match outcome {
                Ok(output) => {
                    result.status = ExecutionStatus::Success;
                    result.output = Some(output.clone());
                    result.completed_at = Some(Utc::now());
                    result.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                    result.retry_count = attempt;

                    ctx.with_state(|s| s.mark_step_completed(step_id, Some(output)));
                    tracing::info!(
                        step_id,
                        duration_ms = result.duration_ms,
                        "step completed"
                    );
                    return result;
                }
                Err((kind, error)) => {
                    last_kind = kind;
                    tracing::warn!(
                        step_id,
                        attempt = attempt + 1,
                        error = error.as_str(),
                        "step attempt failed"
                    );
                    last_error = Some(error);

                    if policy.retries(last_kind) && attempt < policy.max_retries {
                        result.status = ExecutionStatus::Retrying;
                        let delay = policy.delay_for(attempt);
                        tracing::info!(
                            step_id,
                            delay_ms = delay.as_millis() as u64,
                            "retrying step"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    break;
                }
            }
        }

        if result.status != ExecutionStatus::Cancelled {
            result.status = if last_kind == FailureKind::Timeout {
                ExecutionStatus::Timeout
            } else {
                ExecutionStatus::Failed
            };
        }
        result.error = result.error.take().or(last_error);
        result.completed_at = Some(Utc::now());
        result.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        result.retry_count = attempt;

        let err_text = result.error.clone().unwrap_or_else(|| "unknown error".to_string());
        ctx.with_state(|s| s.mark_step_failed(step_id, err_text.clone()));

        tracing::error!(
            step_id,
            attempts = attempt + 1,
            error = err_text.as_str(),
            "step failed"
        );
        result
    }
}

// ---------------------------------------------------------------------------
// ParallelExecutor
// ---------------------------------------------------------------------------

/// How to join parallel branch results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Await every branch; failures are reported alongside sibling results.
    All,
    /// Return on the first success; keep waiting through failures.
    Any,
    /// Return the first completion, success or failure; cancel the rest.
    First,
}

impl JoinStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "any" => Some(Self::Any),
            "first" => Some(Self::First),
            _ => None,
        }
    }
}

/// Bounded parallel fan-out over boxed step bodies.
pub struct ParallelExecutor {
    max_concurrent: usize,
}

impl ParallelExecutor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Run `tasks` concurrently (bounded by the semaphore) and join per the
    /// strategy. Stragglers are cancelled for `First` and on the first
    /// success for `Any`.
    pub async fn execute_parallel(
        &self,
        tasks: Vec<(String, StepFn)>,
        ctx: &ExecutionContext,
        join: JoinStrategy,
    ) -> Vec<StepResult> {
        if tasks.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut set = JoinSet::new();

        for (task_id, step_fn) in tasks {
            let semaphore = Arc::clone(&semaphore);
            let ctx = ctx.clone();
            set.spawn(async move {
                // Closed only when the whole set is aborted.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        return cancelled_result(&task_id);
                    }
                };
                run_branch(&task_id, step_fn, &ctx).await
            });
        }

        match join {
            JoinStrategy::All => {
                let mut results = Vec::new();
                while let Some(joined) = set.join_next().await {
                    if let Ok(result) = joined {
                        results.push(result);
                    }
                }
                results
            }
            JoinStrategy::First => {
                let first = match set.join_next().await {
                    Some(Ok(result)) => result,
                    _ => return Vec::new(),
                };
                set.abort_all();
                vec![first]
            }
            JoinStrategy::Any => {
                let mut failures = Vec::new();
                while let Some(joined) = set.join_next().await {
                    if let Ok(result) = joined {
                        if result.is_success() {
                            set.abort_all();
                            return vec![result];
                        }
                        failures.push(result);
                    }
                }
                failures
            }
        }
    }
}

async fn run_branch(task_id: &str, step_fn: StepFn, ctx: &ExecutionContext) -> StepResult {
    let started_at = Utc::now();
    let start = std::time::Instant::now();

    let outcome = step_fn(ctx.clone()).await;
    let completed_at = Utc::now();
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        Ok(output) => StepResult {
            step_id: task_id.to_string(),
            status: ExecutionStatus::Success,
            output: Some(output),
            error: None,
            started_at: Some(started_at),
            completed_at: Some(completed_at),
            duration_ms,
            retry_count: 0,
            metadata: HashMap::new(),
        },
        Err(error) => StepResult {
            step_id: task_id.to_string(),
            status: ExecutionStatus::Failed,
            output: None,
            error: Some(error),
            started_at: Some(started_at),
            completed_at: Some(completed_at),
            duration_ms,
            retry_count: 0,
            metadata: HashMap::new(),
        },
    }
}

fn cancelled_result(task_id: &str) -> StepResult {
    StepResult {
        step_id: task_id.to_string(),
        status: ExecutionStatus::Cancelled,
        output: None,
        error: Some("cancelled".to_string()),
        started_at: None,
        completed_at: None,
        duration_ms: 0.0,
        retry_count: 0,
        metadata: HashMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            WorkflowState::new("exec_1", "wf"),
            ExecutionConfig::default(),
        )
    }

    fn executor() -> StepExecutor {
        StepExecutor::new(ExecutionConfig::default())
    }

    // -------------------------------------------------------------------
    // StepExecutor
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn successful_step_records_output() {
        let ctx = context();
        let result = executor()
            .execute("s1", |_| async { Ok(json!("done")) }, &ctx, None, None)
            .await;

        assert!(result.is_success());
        assert_eq!(result.output, Some(json!("done")));
        assert_eq!(result.retry_count, 0);

        let state = ctx.snapshot();
        assert_eq!(
            state.step_states["s1"].status,
            skein_types::workflow::StepStatus::Completed
        );
    }

    #[tokio::test]
    async fn failing_step_without_retry_fails() {
        let ctx = context();
        let result = executor()
            .execute(
                "s1",
                |_| async { Err::<Value, _>("boom".to_string()) },
                &ctx,
                None,
                None,
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let ctx = context();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            ..RetryPolicy::default()
        };

        let result = executor()
            .execute(
                "s1",
                move |_| {
                    let attempts = Arc::clone(&attempts_clone);
                    async move {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            Err("transient".to_string())
                        } else {
                            Ok(json!("recovered"))
                        }
                    }
                },
                &ctx,
                Some(&policy),
                None,
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.retry_count, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail() {
        let ctx = context();
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            ..RetryPolicy::default()
        };

        let result = executor()
            .execute(
                "s1",
                |_| async { Err::<Value, _>("always".to_string()) },
                &ctx,
                Some(&policy),
                None,
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.retry_count, 2);
        let state = ctx.snapshot();
        assert_eq!(state.step_states["s1"].retry_count, 1);
    }

    #[tokio::test]
    async fn timeout_yields_timeout_status() {
        let ctx = context();
        let result = executor()
            .execute(
                "s1",
                |_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!("late"))
                },
                &ctx,
                Some(&RetryPolicy::none()),
                Some(Duration::from_millis(20)),
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(result.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn timeout_excluded_from_retry_set_is_not_retried() {
        let ctx = context();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1,
            retry_on: vec![FailureKind::Error],
            ..RetryPolicy::default()
        };

        let result = executor()
            .execute(
                "s1",
                move |_| {
                    let attempts = Arc::clone(&attempts_clone);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(json!("late"))
                    }
                },
                &ctx,
                Some(&policy),
                Some(Duration::from_millis(20)),
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let ctx = context();
        ctx.cancel();

        let result = executor()
            .execute("s1", |_| async { Ok(json!("never")) }, &ctx, None, None)
            .await;

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.output.is_none());
    }

    // -------------------------------------------------------------------
    // ParallelExecutor
    // -------------------------------------------------------------------

    fn boxed(f: impl Fn(ExecutionContext) -> BoxFuture<'static, Result<Value, String>> + Send + Sync + 'static) -> StepFn {
        Arc::new(f)
    }

    #[tokio::test]
    async fn join_all_collects_every_branch() {
        let ctx = context();
        let executor = ParallelExecutor::new(4);

        let tasks: Vec<(String, StepFn)> = vec![
            ("b1".to_string(), boxed(|_| Box::pin(async { Ok(json!(1)) }))),
            (
                "b2".to_string(),
                boxed(|_| Box::pin(async { Err("branch failed".to_string()) })),
            ),
            ("b3".to_string(), boxed(|_| Box::pin(async { Ok(json!(3)) }))),
        ];

        let mut results = executor
            .execute_parallel(tasks, &ctx, JoinStrategy::All)
            .await;
        results.sort_by(|a, b| a.step_id.cmp(&b.step_id));

        assert_eq!(results.len(), 3);
        assert!(results[0].is_success());
        assert_eq!(results[1].status, ExecutionStatus::Failed);
        assert!(results[2].is_success());

        // The declared branch-id set is exactly what comes back
        let ids: Vec<&str> = results.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2", "b3"]);
    }

    #[tokio::test]
    async fn join_first_returns_single_result() {
        let ctx = context();
        let executor = ParallelExecutor::new(4);

        let tasks: Vec<(String, StepFn)> = vec![
            (
                "slow".to_string(),
                boxed(|_| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(json!("slow"))
                    })
                }),
            ),
            (
                "fast".to_string(),
                boxed(|_| Box::pin(async { Ok(json!("fast")) })),
            ),
        ];

        let results = executor
            .execute_parallel(tasks, &ctx, JoinStrategy::First)
            .await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn join_any_waits_past_failures_for_a_success() {
        let ctx = context();
        let executor = ParallelExecutor::new(4);

        let tasks: Vec<(String, StepFn)> = vec![
            (
                "failer".to_string(),
                boxed(|_| Box::pin(async { Err("nope".to_string()) })),
            ),
            (
                "succeeder".to_string(),
                boxed(|_| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(json!("eventually"))
                    })
                }),
            ),
        ];

        let results = executor
            .execute_parallel(tasks, &ctx, JoinStrategy::Any)
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
        assert_eq!(results[0].step_id, "succeeder");
    }

    #[tokio::test]
    async fn join_any_with_all_failures_returns_them_all() {
        let ctx = context();
        let executor = ParallelExecutor::new(4);

        let tasks: Vec<(String, StepFn)> = vec![
            (
                "f1".to_string(),
                boxed(|_| Box::pin(async { Err("a".to_string()) })),
            ),
            (
                "f2".to_string(),
                boxed(|_| Box::pin(async { Err("b".to_string()) })),
            ),
        ];

        let results = executor
            .execute_parallel(tasks, &ctx, JoinStrategy::Any)
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_success()));
    }

    #[tokio::test]
    async fn empty_task_list_returns_empty() {
        let ctx = context();
        let executor = ParallelExecutor::new(4);
        let results = executor
            .execute_parallel(Vec::new(), &ctx, JoinStrategy::All)
            .await;
        assert!(results.is_empty());
    }

    // -------------------------------------------------------------------
    // ExecutionContext
    // -------------------------------------------------------------------

    #[test]
    fn record_result_sets_shortcut_variables() {
        let ctx = context();
        let result = StepResult {
            step_id: "s1".to_string(),
            status: ExecutionStatus::Success,
            output: Some(json!("hello")),
            error: None,
            started_at: None,
            completed_at: None,
            duration_ms: 0.0,
            retry_count: 0,
            metadata: HashMap::new(),
        };
        ctx.record_result("s1", &result);

        assert_eq!(ctx.get_variable("s1"), Some(json!("hello")));
        assert_eq!(ctx.get_variable("_last"), Some(json!("hello")));
        assert_eq!(ctx.get_variable("_last_step"), Some(json!("s1")));
    }

    #[test]
    fn context_clones_share_state() {
        let ctx = context();
        let clone = ctx.clone();
        clone.set_variable("shared", json!(1));
        assert_eq!(ctx.get_variable("shared"), Some(json!(1)));

        clone.cancel();
        assert!(ctx.is_cancelled());
    }
}
