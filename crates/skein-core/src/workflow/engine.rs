//! The workflow engine: drives one execution through its step graph.
//!
//! The driver loop looks the definition up, creates (or recovers) state,
//! then walks the graph: checkpoint, fire hooks, dispatch the step through
//! its handler under the step executor, merge the result into the variable
//! scope, and compute the next step (condition shortcut, explicit
//! transition, then sequential order). Pause requests checkpoint and return;
//! cancellation is observed between steps; failed steps route to their
//! `on_error` target, halt under fail-fast, or mark the run failed at the
//! end.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use uuid::Uuid;

use skein_types::event::{WorkflowEvent, system_events};
use skein_types::workflow::{
    StepStatus, WorkflowDefinition, WorkflowStep, WorkflowStatus,
};

use super::executor::{
    ExecutionConfig, ExecutionContext, ExecutionResult, ExecutionStatus, StepExecutor, StepResult,
};
use super::handlers::HandlerRegistry;
use super::registry::WorkflowRegistry;
use super::state::StateStore;
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Lifecycle notifications fired by the engine.
#[derive(Debug, Clone)]
pub enum HookEvent {
    Started {
        execution_id: String,
        workflow_id: String,
    },
    StepStarted {
        execution_id: String,
        step_id: String,
    },
    StepCompleted {
        execution_id: String,
        step_id: String,
        result: StepResult,
    },
    Completed {
        execution_id: String,
        status: ExecutionStatus,
        duration_ms: f64,
    },
    Errored {
        execution_id: String,
        error: String,
    },
}

/// A synchronous observability hook.
pub type HookFn = Arc<dyn Fn(&HookEvent) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_start: Vec<HookFn>,
    on_step_start: Vec<HookFn>,
    on_step_complete: Vec<HookFn>,
    on_complete: Vec<HookFn>,
    on_error: Vec<HookFn>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Orchestrates workflow executions against a definition registry, a state
/// store, and a handler registry.
pub struct WorkflowEngine {
    registry: Arc<WorkflowRegistry>,
    store: Arc<StateStore>,
    handlers: Arc<HandlerRegistry>,
    config: ExecutionConfig,
    step_executor: StepExecutor,
    /// Live execution contexts, for pause/cancel from other tasks.
    contexts: DashMap<String, ExecutionContext>,
    hooks: RwLock<Hooks>,
    bus: Option<EventBus>,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        store: Arc<StateStore>,
        handlers: Arc<HandlerRegistry>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            registry,
            store,
            handlers,
            step_executor: StepExecutor::new(config.clone()),
            config,
            contexts: DashMap::new(),
            hooks: RwLock::new(Hooks::default()),
            bus: None,
        }
    }

    /// Publish workflow/step lifecycle events to the given bus.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn on_start(&self, hook: HookFn) {
        self.hooks.write().unwrap().on_start.push(hook);
    }

    pub fn on_step_start(&self, hook: HookFn) {
        self.hooks.write().unwrap().on_step_start.push(hook);
    }

    pub fn on_step_complete(&self, hook: HookFn) {
        self.hooks.write().unwrap().on_step_complete.push(hook);
    }

    pub fn on_complete(&self, hook: HookFn) {
        self.hooks.write().unwrap().on_complete.push(hook);
    }

    pub fn on_error(&self, hook: HookFn) {
        self.hooks.write().unwrap().on_error.push(hook);
    }

    /// Execute a workflow from the beginning.
    pub async fn run(
        &self,
        workflow_id: &str,
        inputs: HashMap<String, Value>,
    ) -> ExecutionResult {
        let execution_id = format!("exec_{}", &Uuid::new_v4().simple().to_string()[..12]);
        self.run_execution(workflow_id, inputs, execution_id, false)
            .await
    }

    /// Execute a workflow with a caller-chosen execution id.
    pub async fn run_with_id(
        &self,
        workflow_id: &str,
        inputs: HashMap<String, Value>,
        execution_id: &str,
    ) -> ExecutionResult {
        self.run_execution(workflow_id, inputs, execution_id.to_string(), false)
            .await
    }

    /// Pause a running execution: the engine checkpoints at the next step
    /// boundary and returns. Returns whether a running execution was found.
    pub async fn pause(&self, execution_id: &str) -> bool {
        if let Some(ctx) = self.contexts.get(execution_id) {
            ctx.pause();
            // Persist a paused snapshot immediately so the pause survives a
            // crash even if the loop never reaches the next boundary.
            let snapshot = ctx.snapshot();
            self.store.checkpoint(&snapshot).await;
            self.store.update_state(&snapshot).await;
            tracing::info!(execution_id, "execution paused");
            return true;
        }
        false
    }

    /// Resume a paused execution from its latest valid checkpoint.
    pub async fn resume(&self, execution_id: &str) -> Option<ExecutionResult> {
        let state = self.store.get_state(execution_id).await?;
        if state.status != WorkflowStatus::Paused {
            return None;
        }
        Some(
            self.run_execution(
                &state.workflow_id.clone(),
                HashMap::new(),
                execution_id.to_string(),
                true,
            )
            .await,
        )
    }

    /// Cancel an execution. An in-flight step completes naturally; the
    /// engine observes the flag between steps.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        if let Some(ctx) = self.contexts.get(execution_id) {
            ctx.cancel();
            tracing::info!(execution_id, "execution cancelled");
            return true;
        }
        if let Some(mut state) = self.store.get_state(execution_id).await {
            if !state.is_complete() {
                state.status = WorkflowStatus::Cancelled;
                self.store.update_state(&state).await;
                return true;
            }
        }
        false
    }

    /// Current state of an execution, if known.
    pub async fn execution_status(
        &self,
        execution_id: &str,
    ) -> Option<skein_types::workflow::WorkflowState> {
        self.store.get_state(execution_id).await
    }

    /// Executions known to the state store, optionally filtered.
    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        status: Option<WorkflowStatus>,
    ) -> Vec<skein_types::workflow::WorkflowState> {
        self.store.list_executions(workflow_id, status).await
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    async fn run_execution(
        &self,
        workflow_id: &str,
        inputs: HashMap<String, Value>,
        execution_id: String,
        resume: bool,
    ) -> ExecutionResult {
        let start = std::time::Instant::now();
        let started_at = chrono::Utc::now();

        let mut result = ExecutionResult {
            execution_id: execution_id.clone(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Running,
            outputs: HashMap::new(),
            step_results: Vec::new(),
            started_at: Some(started_at),
            completed_at: None,
            duration_ms: 0.0,
            error: None,
        };

        let Some(definition) = self.registry.get(workflow_id).await else {
            result.status = ExecutionStatus::Failed;
            result.error = Some(format!("workflow not found: {workflow_id}"));
            return self.finish(result, start);
        };
        if !definition.enabled {
            result.status = ExecutionStatus::Failed;
            result.error = Some(format!("workflow is disabled: {workflow_id}"));
            return self.finish(result, start);
        }

        // Create or recover state
        let state = if resume {
            match self.store.recover(&execution_id).await {
                Some(state) => state,
                None => {
                    result.status = ExecutionStatus::Failed;
                    result.error =
                        Some("cannot resume: no valid checkpoint".to_string());
                    return self.finish(result, start);
                }
            }
        } else {
            let mut metadata = HashMap::new();
            metadata.insert(
                "workflow_version".to_string(),
                json!(definition.version.clone()),
            );
            self.store
                .create_state(&execution_id, workflow_id, inputs, metadata)
                .await
        };

        let ctx = ExecutionContext::new(state, self.config.clone());
        ctx.with_state(|s| s.status = WorkflowStatus::Running);
        if resume {
            ctx.unpause();
        }
        self.contexts.insert(execution_id.clone(), ctx.clone());

        self.fire(&HookEvent::Started {
            execution_id: execution_id.clone(),
            workflow_id: workflow_id.to_string(),
        });
        self.publish(system_events::WORKFLOW_STARTED, &execution_id, workflow_id, None)
            .await;
        tracing::info!(execution_id = execution_id.as_str(), workflow_id, "starting execution");

        // On resume, surface already-completed steps in the result and skip
        // ahead to the first unfinished one.
        let mut completed: HashSet<String> = HashSet::new();
        if resume {
            let snapshot = ctx.snapshot();
            for (step_id, step_state) in &snapshot.step_states {
                if step_state.status == StepStatus::Completed {
                    completed.insert(step_id.clone());
                }
            }
            let mut replayed: Vec<StepResult> = snapshot
                .step_states
                .values()
                .filter(|s| s.status == StepStatus::Completed)
                .map(|s| StepResult {
                    step_id: s.step_id.clone(),
                    status: ExecutionStatus::Success,
                    output: s.output.clone(),
                    error: None,
                    started_at: s.started_at,
                    completed_at: s.completed_at,
                    duration_ms: s.duration_ms,
                    retry_count: s.retry_count,
                    metadata: HashMap::new(),
                })
                .collect();
            replayed.sort_by(|a, b| a.started_at.cmp(&b.started_at));
            result.step_results = replayed;
        }

        let outcome = self
            .drive(&definition, &ctx, &mut result, &completed)
            .await;

        self.contexts.remove(&execution_id);

        match outcome {
            DriveOutcome::Paused => {
                result.status = ExecutionStatus::Paused;
                let snapshot = ctx.snapshot();
                self.store.update_state(&snapshot).await;
                self.fire(&HookEvent::Completed {
                    execution_id: execution_id.clone(),
                    status: result.status,
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                });
                self.finish(result, start)
            }
            DriveOutcome::Cancelled => {
                result.status = ExecutionStatus::Cancelled;
                let snapshot = ctx.snapshot();
                self.store.update_state(&snapshot).await;
                self.fire(&HookEvent::Completed {
                    execution_id: execution_id.clone(),
                    status: result.status,
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                });
                self.finish(result, start)
            }
            DriveOutcome::Finished { failed } => {
                if failed || result.status == ExecutionStatus::Failed {
                    result.status = ExecutionStatus::Failed;
                    if result.error.is_none() {
                        result.error = result
                            .step_results
                            .iter()
                            .rev()
                            .find(|r| !r.is_success())
                            .and_then(|r| r.error.clone());
                    }
                    let error = result.error.clone().unwrap_or_default();
                    self.store.mark_failed(&execution_id, &error).await;
                    self.fire(&HookEvent::Errored {
                        execution_id: execution_id.clone(),
                        error: error.clone(),
                    });
                    self.publish(
                        system_events::WORKFLOW_FAILED,
                        &execution_id,
                        workflow_id,
                        Some(json!({"error": error})),
                    )
                    .await;
                } else {
                    result.status = ExecutionStatus::Success;
                    result.outputs = ctx.variables();
                    self.store
                        .mark_completed(&execution_id, None)
                        .await;
                    self.store.update_state(&{
                        let mut s = ctx.snapshot();
                        s.status = WorkflowStatus::Completed;
                        s.completed_at = Some(chrono::Utc::now());
                        s
                    })
                    .await;
                    self.publish(
                        system_events::WORKFLOW_COMPLETED,
                        &execution_id,
                        workflow_id,
                        None,
                    )
                    .await;
                }

                self.fire(&HookEvent::Completed {
                    execution_id: execution_id.clone(),
                    status: result.status,
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                });
                self.finish(result, start)
            }
        }
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        ctx: &ExecutionContext,
        result: &mut ExecutionResult,
        already_completed: &HashSet<String>,
    ) -> DriveOutcome {
        let execution_id = ctx.execution_id();
        let mut any_failed = false;

        let mut current: Option<&WorkflowStep> = definition.start();

        // Skip past steps completed before a resume, following the
        // transitions they recorded. A completed condition step's routing
        // decision lives in its output, not in the (already consumed)
        // `_condition_next` variable. The visited guard keeps a cyclic
        // graph of completed steps from spinning.
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(step) = current {
            if !already_completed.contains(&step.id) || !visited.insert(step.id.clone()) {
                break;
            }
            let recorded = ctx.with_state(|s| {
                s.step_states
                    .get(&step.id)
                    .and_then(|ss| ss.output.as_ref())
                    .and_then(|o| o.get("next_step"))
                    .and_then(|v| v.as_str().map(String::from))
            });
            current = match recorded {
                Some(target) => definition.get_step(&target),
                None => self.next_step(definition, step, ctx),
            };
        }

        while let Some(step) = current {
            if ctx.is_cancelled() {
                return DriveOutcome::Cancelled;
            }
            if ctx.is_paused() {
                self.store.checkpoint(&ctx.snapshot()).await;
                return DriveOutcome::Paused;
            }

            if self.config.checkpoint_each_step {
                self.store.checkpoint(&ctx.snapshot()).await;
            }

            self.fire(&HookEvent::StepStarted {
                execution_id: execution_id.clone(),
                step_id: step.id.clone(),
            });
            self.publish(
                system_events::STEP_STARTED,
                &execution_id,
                &definition.id,
                Some(json!({"step_id": step.id})),
            )
            .await;

            let step_result = self.execute_step(step, ctx).await;
            ctx.record_result(&step.id, &step_result);
            result.step_results.push(step_result.clone());
            self.store.update_state(&ctx.snapshot()).await;

            self.fire(&HookEvent::StepCompleted {
                execution_id: execution_id.clone(),
                step_id: step.id.clone(),
                result: step_result.clone(),
            });
            self.publish(
                if step_result.is_success() {
                    system_events::STEP_COMPLETED
                } else {
                    system_events::STEP_FAILED
                },
                &execution_id,
                &definition.id,
                Some(json!({
                    "step_id": step.id,
                    "status": step_result.status,
                    "duration_ms": step_result.duration_ms,
                })),
            )
            .await;

            if !step_result.is_success() {
                if step_result.status == ExecutionStatus::Cancelled {
                    return DriveOutcome::Cancelled;
                }
                any_failed = true;

                if let Some(on_error) = &step.on_error {
                    tracing::info!(
                        step_id = step.id.as_str(),
                        on_error = on_error.as_str(),
                        "routing to error step"
                    );
                    current = definition.get_step(on_error);
                    continue;
                }
                if self.config.fail_fast {
                    result.status = ExecutionStatus::Failed;
                    result.error = step_result.error.clone();
                    return DriveOutcome::Finished { failed: true };
                }
            }

            current = self.next_step(definition, step, ctx);
        }

        if ctx.is_cancelled() {
            return DriveOutcome::Cancelled;
        }
        DriveOutcome::Finished { failed: any_failed }
    }

    async fn execute_step(&self, step: &WorkflowStep, ctx: &ExecutionContext) -> StepResult {
        // A missing handler fails immediately and is never retried.
        if !self.handlers.contains(&step.step_type) {
            let now = chrono::Utc::now();
            ctx.with_state(|s| {
                s.mark_step_started(&step.id, None);
                s.mark_step_failed(&step.id, format!("no handler for step type: {}", step.step_type));
            });
            return StepResult {
                step_id: step.id.clone(),
                status: ExecutionStatus::Failed,
                output: None,
                error: Some(format!("no handler for step type: {}", step.step_type)),
                started_at: Some(now),
                completed_at: Some(now),
                duration_ms: 0.0,
                retry_count: 0,
                metadata: HashMap::new(),
            };
        }

        let handlers = Arc::clone(&self.handlers);
        let step_owned = step.clone();
        let timeout = step.timeout_seconds.map(Duration::from_secs);

        self.step_executor
            .execute(
                &step.id,
                move |c: ExecutionContext| {
                    let handlers = Arc::clone(&handlers);
                    let step = step_owned.clone();
                    async move {
                        handlers
                            .dispatch(&step, &c)
                            .await
                            .map_err(|e| e.to_string())
                    }
                },
                ctx,
                step.retry_policy.as_ref(),
                timeout,
            )
            .await
    }

    /// Transition: a condition handler's `_condition_next` shortcut wins,
    /// then the step's explicit `next_step`, then declaration order.
    fn next_step<'a>(
        &self,
        definition: &'a WorkflowDefinition,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
    ) -> Option<&'a WorkflowStep> {
        if let Some(Value::String(target)) = ctx.get_variable("_condition_next") {
            ctx.with_state(|s| {
                s.variables.remove("_condition_next");
            });
            return definition.get_step(&target);
        }
        definition.next_after(&step.id)
    }

    fn finish(&self, mut result: ExecutionResult, start: std::time::Instant) -> ExecutionResult {
        result.completed_at = Some(chrono::Utc::now());
        result.duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        result
    }

    fn fire(&self, event: &HookEvent) {
        let hooks = self.hooks.read().unwrap();
        let list = match event {
            HookEvent::Started { .. } => &hooks.on_start,
            HookEvent::StepStarted { .. } => &hooks.on_step_start,
            HookEvent::StepCompleted { .. } => &hooks.on_step_complete,
            HookEvent::Completed { .. } => &hooks.on_complete,
            HookEvent::Errored { .. } => &hooks.on_error,
        };
        for hook in list {
            hook(event);
        }
    }

    async fn publish(
        &self,
        event_type: &str,
        execution_id: &str,
        workflow_id: &str,
        extra: Option<Value>,
    ) {
        let Some(bus) = &self.bus else { return };
        let mut data = HashMap::new();
        data.insert("execution_id".to_string(), json!(execution_id));
        data.insert("workflow_id".to_string(), json!(workflow_id));
        if let Some(Value::Object(map)) = extra {
            for (k, v) in map {
                data.insert(k, v);
            }
        }
        bus.emit(WorkflowEvent::new(event_type, data).with_source("engine"))
            .await;
    }
}

enum DriveOutcome {
    Finished { failed: bool },
    Paused,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
