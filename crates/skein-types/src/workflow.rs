//! Workflow domain types for Skein.
//!
//! Defines the canonical representation of a workflow: the definition (an
//! ordered step list with explicit transitions), per-step retry policy, and
//! the execution-tracking types (`WorkflowState`, `StepState`) that the state
//! store checkpoints. JSON is the interchange format for all of these; every
//! type round-trips through serde by value.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Failure classes a retry policy can match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The step function returned an error.
    Error,
    /// The step exceeded its timeout.
    Timeout,
}

/// Retry policy for a workflow step.
///
/// Delays are stored in milliseconds on disk; scheduling code converts to
/// `std::time::Duration` at the sleep site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Ceiling on the computed backoff delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt: `initial * multiplier^attempt`.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Which failure classes are retried.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<FailureKind>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_retry_on() -> Vec<FailureKind> {
    vec![FailureKind::Error, FailureKind::Timeout]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retry_on: default_retry_on(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff delay before retrying after `attempt` (0-based) has failed.
    ///
    /// `min(initial_delay_ms * multiplier^attempt, max_delay_ms)`, expressed
    /// as a `Duration`.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let clamped = raw.min(self.max_delay_ms as f64);
        std::time::Duration::from_millis(clamped as u64)
    }

    /// Whether the given failure class is in the retry set.
    pub fn retries(&self, kind: FailureKind) -> bool {
        self.retry_on.contains(&kind)
    }
}

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A single step in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// User-defined step ID, unique within the workflow.
    pub id: String,
    /// Step type tag (`agent`, `condition`, `parallel`, `loop`, `multi_agent`, ...).
    #[serde(rename = "type")]
    pub step_type: String,
    /// Human-readable step name.
    pub name: String,
    /// Opaque step configuration consumed by the matching handler.
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    /// Explicit transition target; `None` means sequential successor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    /// Step to route to when this step fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    /// Retry policy; `None` means no retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Per-step timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl WorkflowStep {
    /// Create a step with just an id, type, and name.
    pub fn new(id: impl Into<String>, step_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            name: name.into(),
            config: serde_json::Map::new(),
            next_step: None,
            on_error: None,
            retry_policy: None,
            timeout_seconds: None,
        }
    }

    /// Builder-style config entry.
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Builder-style explicit transition.
    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next_step = Some(next.into());
        self
    }
}

/// The complete definition of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow ID.
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default)]
    pub description: String,
    /// Semantic version string ("M.m.p").
    #[serde(default = "default_version")]
    pub version: String,
    /// Ordered step list. Order defines the sequential fallback transition.
    pub steps: Vec<WorkflowStep>,
    /// Explicit entry step; defaults to the first step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_step: Option<String>,
    /// Optional JSON schema for execution inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Optional JSON schema for execution outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Extensible metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// When the definition was first registered.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When the definition was last updated.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Who registered the definition.
    #[serde(default = "default_created_by")]
    pub created_by: String,
    /// Disabled workflows refuse to run.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_created_by() -> String {
    "system".to_string()
}

fn default_true() -> bool {
    true
}

impl WorkflowDefinition {
    /// Create a definition from an id, name, and step list.
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            steps,
            start_step: None,
            input_schema: None,
            output_schema: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            created_by: default_created_by(),
            enabled: true,
            tags: Vec::new(),
        }
    }

    /// Look up a step by ID.
    pub fn get_step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// The entry step: explicit `start_step` if set, else the first step.
    pub fn start(&self) -> Option<&WorkflowStep> {
        match &self.start_step {
            Some(id) => self.get_step(id),
            None => self.steps.first(),
        }
    }

    /// The sequential successor of `step_id`, honoring an explicit
    /// `next_step` first and declaration order otherwise.
    pub fn next_after(&self, step_id: &str) -> Option<&WorkflowStep> {
        if let Some(current) = self.get_step(step_id) {
            if let Some(next) = &current.next_step {
                return self.get_step(next);
            }
        }
        let idx = self.steps.iter().position(|s| s.id == step_id)?;
        self.steps.get(idx + 1)
    }

    /// Validate the definition, returning a list of human-readable problems.
    ///
    /// An empty list means the definition is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.id.is_empty() {
            errors.push("workflow id is required".to_string());
        }
        if self.name.is_empty() {
            errors.push("workflow name is required".to_string());
        }
        if self.steps.is_empty() {
            errors.push("workflow must have at least one step".to_string());
        }

        let ids: Vec<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        let unique: std::collections::HashSet<&str> = ids.iter().copied().collect();
        if unique.len() != ids.len() {
            errors.push("step ids must be unique".to_string());
        }

        for step in &self.steps {
            if let Some(next) = &step.next_step {
                if !unique.contains(next.as_str()) {
                    errors.push(format!(
                        "step '{}' references unknown next_step: {}",
                        step.id, next
                    ));
                }
            }
            if let Some(on_error) = &step.on_error {
                if !unique.contains(on_error.as_str()) {
                    errors.push(format!(
                        "step '{}' references unknown on_error: {}",
                        step.id, on_error
                    ));
                }
            }
        }

        if let Some(start) = &self.start_step {
            if !unique.contains(start.as_str()) {
                errors.push(format!("invalid start_step: {start}"));
            }
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Waiting,
    Completed,
    Failed,
    Cancelled,
    Compensating,
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Compensated,
}

/// Execution-time state of a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Snapshot of the step input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Snapshot of the step output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub duration_ms: f64,
}

impl StepState {
    /// Fresh pending state for a step.
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            input: None,
            output: None,
            error: None,
            retry_count: 0,
            duration_ms: 0.0,
        }
    }
}

/// Complete state of one workflow execution.
///
/// This is the unit the state store checkpoints: mutating the live state
/// never alters a checkpoint taken earlier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// Variable scope: execution inputs plus accumulated step outputs.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub step_states: HashMap<String, StepState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowState {
    /// Create a fresh pending execution state.
    pub fn new(execution_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            status: WorkflowStatus::Pending,
            current_step_id: None,
            variables: HashMap::new(),
            step_states: HashMap::new(),
            started_at: Some(Utc::now()),
            completed_at: None,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Whether the execution reached a terminal status.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Whether the execution is currently running.
    pub fn is_running(&self) -> bool {
        self.status == WorkflowStatus::Running
    }

    /// Set a variable in the scope.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Read a variable from the scope.
    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Transition a step to `Running`, recording its input snapshot.
    pub fn mark_step_started(&mut self, step_id: &str, input: Option<Value>) {
        let state = self
            .step_states
            .entry(step_id.to_string())
            .or_insert_with(|| StepState::new(step_id));
        state.status = StepStatus::Running;
        state.started_at = Some(Utc::now());
        state.input = input;
        self.current_step_id = Some(step_id.to_string());
    }

    /// Transition a step to `Completed`, recording output and duration.
    pub fn mark_step_completed(&mut self, step_id: &str, output: Option<Value>) {
        if let Some(state) = self.step_states.get_mut(step_id) {
            state.status = StepStatus::Completed;
            let now = Utc::now();
            if let Some(started) = state.started_at {
                state.duration_ms = (now - started).num_milliseconds().max(0) as f64;
            }
            state.completed_at = Some(now);
            state.output = output;
        }
    }

    /// Transition a step to `Failed`, bumping its retry counter.
    pub fn mark_step_failed(&mut self, step_id: &str, error: impl Into<String>) {
        if let Some(state) = self.step_states.get_mut(step_id) {
            state.status = StepStatus::Failed;
            state.completed_at = Some(Utc::now());
            state.error = Some(error.into());
            state.retry_count += 1;
        }
    }

    /// Record a step as `Skipped` without running it.
    pub fn mark_step_skipped(&mut self, step_id: &str) {
        let state = self
            .step_states
            .entry(step_id.to_string())
            .or_insert_with(|| StepState::new(step_id));
        state.status = StepStatus::Skipped;
        let now = Utc::now();
        state.started_at.get_or_insert(now);
        state.completed_at = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
