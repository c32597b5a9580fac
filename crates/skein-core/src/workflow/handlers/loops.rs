//! Loop step: iterate a body step over collections, conditions, or counts.
//!
//! Modes: `for_each` (bind item/index per element), `map` (like `for_each`
//! but the output variable receives only the per-iteration outputs), `while`
//! (repeat while a condition holds), `until` (repeat until it holds), and
//! `times` (repeat N times). Every mode is bounded by `max_iterations` as a
//! safety ceiling, and `continue_on_error` switches between fail-fast and
//! collect-and-continue.

use std::sync::Weak;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};

use skein_types::workflow::WorkflowStep;

use super::{HandlerError, HandlerRegistry, StepHandler, parse_config};
use crate::workflow::executor::ExecutionContext;

/// Safety ceiling applied to every loop mode.
pub const DEFAULT_MAX_ITERATIONS: u64 = 1000;

/// The body step a loop runs per iteration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopBody {
    #[serde(rename = "step_type", alias = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct LoopStepConfig {
    #[serde(default = "default_loop_type")]
    loop_type: String,
    #[serde(default)]
    items_variable: Option<String>,
    #[serde(default = "default_item_variable")]
    item_variable: String,
    #[serde(default = "default_index_variable")]
    index_variable: String,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default = "default_times")]
    times: u64,
    #[serde(default)]
    body: Option<LoopBody>,
    #[serde(default = "default_max_iterations")]
    max_iterations: u64,
    #[serde(default)]
    continue_on_error: bool,
    #[serde(default)]
    output_variable: Option<String>,
    #[serde(default = "default_true")]
    collect_results: bool,
}

fn default_loop_type() -> String {
    "for_each".to_string()
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_index_variable() -> String {
    "index".to_string()
}

fn default_times() -> u64 {
    1
}

fn default_max_iterations() -> u64 {
    DEFAULT_MAX_ITERATIONS
}

fn default_true() -> bool {
    true
}

/// Handler for `loop` steps.
pub struct LoopStepHandler {
    registry: Weak<HandlerRegistry>,
}

impl LoopStepHandler {
    pub fn new(registry: Weak<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Run one iteration: dispatch the body step if configured, otherwise
    /// yield the bound item (or index) so body-less loops still collect.
    async fn run_iteration(
        &self,
        config: &LoopStepConfig,
        step_id: &str,
        iteration: u64,
        ctx: &ExecutionContext,
    ) -> Result<Value, HandlerError> {
        match &config.body {
            Some(body) => {
                let registry = self.registry.upgrade().ok_or_else(|| {
                    HandlerError::Failed("handler registry dropped".to_string())
                })?;
                let sub_step = WorkflowStep {
                    id: format!("{step_id}[{iteration}]"),
                    step_type: body.step_type.clone(),
                    name: format!("{step_id} iteration {iteration}"),
                    config: body.config.clone(),
                    next_step: None,
                    on_error: None,
                    retry_policy: None,
                    timeout_seconds: None,
                };
                registry.dispatch(&sub_step, ctx).await
            }
            None => Ok(ctx
                .get_variable(&config.item_variable)
                .unwrap_or(json!(iteration))),
        }
    }

    fn resolve_items(
        &self,
        config: &LoopStepConfig,
        step_id: &str,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Value>, HandlerError> {
        let expr = config.items_variable.as_deref().ok_or_else(|| {
            HandlerError::InvalidConfig(format!(
                "step '{step_id}': items_variable is required for {} loops",
                config.loop_type
            ))
        })?;

        let resolved = if expr.contains("${") {
            ctx.resolve(expr)
        } else {
            ctx.resolve(&format!("${{{expr}}}"))
        };

        match resolved {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(HandlerError::Failed(format!(
                "step '{step_id}': items resolved to {other} instead of a collection"
            ))),
        }
    }
}

impl StepHandler for LoopStepHandler {
    fn step_type(&self) -> &str {
        "loop"
    }

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value, HandlerError>> {
        Box::pin(async move {
            let config: LoopStepConfig = parse_config(step)?;
            let mut results: Vec<Value> = Vec::new();

            match config.loop_type.as_str() {
                "for_each" | "map" => {
                    let items = self.resolve_items(&config, &step.id, ctx)?;
                    for (i, item) in items.into_iter().enumerate() {
                        if (i as u64) >= config.max_iterations {
                            tracing::warn!(
                                step_id = step.id.as_str(),
                                max_iterations = config.max_iterations,
                                "loop hit iteration ceiling"
                            );
                            break;
                        }
                        if ctx.is_cancelled() {
                            break;
                        }

                        ctx.set_variable(config.item_variable.clone(), item);
                        ctx.set_variable(config.index_variable.clone(), json!(i));

                        match self.run_iteration(&config, &step.id, i as u64, ctx).await {
                            Ok(value) => results.push(value),
                            Err(e) if config.continue_on_error => {
                                tracing::warn!(
                                    step_id = step.id.as_str(),
                                    iteration = i,
                                    error = %e,
                                    "loop iteration failed"
                                );
                                results.push(json!({"error": e.to_string()}));
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                "while" | "until" => {
                    let until = config.loop_type == "until";
                    let condition = config.condition.as_deref().ok_or_else(|| {
                        HandlerError::InvalidConfig(format!(
                            "step '{}': condition is required for {} loops",
                            step.id, config.loop_type
                        ))
                    })?;

                    let mut iteration: u64 = 0;
                    while iteration < config.max_iterations {
                        if ctx.is_cancelled() {
                            break;
                        }
                        ctx.set_variable(config.index_variable.clone(), json!(iteration));
                        let holds = ctx.evaluate_condition(condition);
                        let should_stop = if until { holds } else { !holds };
                        if should_stop {
                            break;
                        }

                        match self.run_iteration(&config, &step.id, iteration, ctx).await {
                            Ok(value) => results.push(value),
                            Err(e) if config.continue_on_error => {
                                results.push(json!({"error": e.to_string()}));
                            }
                            Err(e) => return Err(e),
                        }
                        iteration += 1;
                    }
                }
                "times" => {
                    let count = config.times.min(config.max_iterations);
                    for i in 0..count {
                        if ctx.is_cancelled() {
                            break;
                        }
                        ctx.set_variable(config.index_variable.clone(), json!(i));
                        match self.run_iteration(&config, &step.id, i, ctx).await {
                            Ok(value) => results.push(value),
                            Err(e) if config.continue_on_error => {
                                results.push(json!({"error": e.to_string()}));
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                other => {
                    return Err(HandlerError::InvalidConfig(format!(
                        "step '{}': unknown loop_type: {other}",
                        step.id
                    )));
                }
            }

            tracing::info!(
                step_id = step.id.as_str(),
                iterations = results.len(),
                loop_type = config.loop_type.as_str(),
                "loop completed"
            );

            let output = json!({
                "loop_type": config.loop_type,
                "iterations": results.len(),
                "results": if config.collect_results { json!(results) } else { Value::Null },
            });

            if let Some(var) = &config.output_variable {
                if config.loop_type == "map" {
                    ctx.set_variable(var.clone(), json!(results));
                } else {
                    ctx.set_variable(var.clone(), output.clone());
                }
            }

            Ok(output)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
