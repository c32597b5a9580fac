//! Parallel step: fan a set of branches out and join their results.
//!
//! Each declared branch is a `(id, step_type, config)` triple. The handler
//! resolves branch config templates against the current scope, builds one
//! sub-task per branch dispatching back through the handler registry, and
//! delegates scheduling to the `ParallelExecutor` with the declared join
//! strategy.

use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};

use skein_types::workflow::WorkflowStep;

use super::{HandlerError, HandlerRegistry, StepHandler, parse_config};
use crate::workflow::executor::{ExecutionContext, JoinStrategy, ParallelExecutor, StepFn};

/// One parallel branch declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct ParallelBranch {
    pub id: String,
    #[serde(rename = "step_type", alias = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ParallelStepConfig {
    #[serde(default)]
    branches: Vec<ParallelBranch>,
    #[serde(default = "default_join")]
    join_strategy: String,
    #[serde(default = "default_max_concurrent")]
    max_concurrent: usize,
    #[serde(default)]
    output_variable: Option<String>,
    #[serde(default = "default_true")]
    fail_on_error: bool,
}

fn default_join() -> String {
    "all".to_string()
}

fn default_max_concurrent() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// Handler for `parallel` steps.
pub struct ParallelStepHandler {
    registry: Weak<HandlerRegistry>,
}

impl ParallelStepHandler {
    pub fn new(registry: Weak<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

impl StepHandler for ParallelStepHandler {
    fn step_type(&self) -> &str {
        "parallel"
    }

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value, HandlerError>> {
        Box::pin(async move {
            let config: ParallelStepConfig = parse_config(step)?;

            if config.branches.is_empty() {
                return Ok(json!({"branches": [], "results": {}}));
            }

            let join = JoinStrategy::parse(&config.join_strategy).ok_or_else(|| {
                HandlerError::InvalidConfig(format!(
                    "step '{}': invalid join_strategy: {}",
                    step.id, config.join_strategy
                ))
            })?;

            let registry = self.registry.upgrade().ok_or_else(|| {
                HandlerError::Failed("handler registry dropped".to_string())
            })?;

            // Resolve branch config templates against the scope up front,
            // then build one dispatchable task per branch.
            let resolver = crate::workflow::variables::VariableResolver::new();
            let scope = ctx.variables();
            let mut tasks: Vec<(String, StepFn)> = Vec::with_capacity(config.branches.len());

            for branch in &config.branches {
                let resolved = resolver.resolve_map(&branch.config, &scope);
                let sub_step = WorkflowStep {
                    id: branch.id.clone(),
                    step_type: branch.step_type.clone(),
                    name: branch.id.clone(),
                    config: resolved,
                    next_step: None,
                    on_error: None,
                    retry_policy: None,
                    timeout_seconds: None,
                };
                let registry = Arc::clone(&registry);
                let task: StepFn = Arc::new(move |task_ctx: ExecutionContext| {
                    let registry = Arc::clone(&registry);
                    let sub_step = sub_step.clone();
                    Box::pin(async move {
                        registry
                            .dispatch(&sub_step, &task_ctx)
                            .await
                            .map_err(|e| e.to_string())
                    })
                });
                tasks.push((branch.id.clone(), task));
            }

            let executor = ParallelExecutor::new(config.max_concurrent);
            let results = executor.execute_parallel(tasks, ctx, join).await;

            let mut succeeded: Vec<String> = Vec::new();
            let mut failed: Vec<Value> = Vec::new();
            let mut outputs = serde_json::Map::new();

            for result in &results {
                if result.is_success() {
                    succeeded.push(result.step_id.clone());
                    outputs.insert(
                        result.step_id.clone(),
                        result.output.clone().unwrap_or(Value::Null),
                    );
                } else {
                    failed.push(json!({
                        "branch_id": result.step_id,
                        "error": result.error,
                    }));
                }
            }

            let aggregate = json!({
                "branches": config.branches.iter().map(|b| b.id.clone()).collect::<Vec<_>>(),
                "results": Value::Object(outputs),
                "succeeded": succeeded,
                "failed": failed,
            });

            if let Some(var) = &config.output_variable {
                ctx.set_variable(var.clone(), aggregate.clone());
            }

            tracing::info!(
                step_id = step.id.as_str(),
                succeeded = succeeded.len(),
                failed = failed.len(),
                "parallel step joined"
            );

            if !failed.is_empty() && config.fail_on_error {
                let ids: Vec<String> = failed
                    .iter()
                    .filter_map(|f| f["branch_id"].as_str().map(String::from))
                    .collect();
                return Err(HandlerError::Failed(format!(
                    "{} of {} branches failed: {}",
                    failed.len(),
                    config.branches.len(),
                    ids.join(", ")
                )));
            }

            Ok(aggregate)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
