//! Condition step: conditional branching in two modes.
//!
//! *Branch mode* evaluates each branch's condition in declared order and
//! picks the first truthy one. *Switch mode* resolves a variable and looks
//! it up in a case map. Either way the chosen target is written to the
//! reserved `_condition_next` variable, which the engine consults when the
//! step declares no explicit transition.

use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;

use skein_types::workflow::WorkflowStep;

use super::{HandlerError, StepHandler, parse_config};
use crate::workflow::executor::ExecutionContext;

/// One `(condition, target)` pair in branch mode.
#[derive(Debug, Clone, Deserialize)]
pub struct Branch {
    pub condition: String,
    pub next_step: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConditionStepConfig {
    #[serde(default)]
    branches: Vec<Branch>,
    #[serde(default)]
    default_step: Option<String>,
    #[serde(default)]
    switch_variable: Option<String>,
    #[serde(default)]
    cases: HashMap<String, String>,
    #[serde(default)]
    output_variable: Option<String>,
}

/// Handler for `condition` steps.
pub struct ConditionStepHandler;

impl ConditionStepHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConditionStepHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandler for ConditionStepHandler {
    fn step_type(&self) -> &str {
        "condition"
    }

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value, HandlerError>> {
        Box::pin(async move {
            let config: ConditionStepConfig = parse_config(step)?;

            let mut evaluated: Vec<Value> = Vec::new();
            let mut selected_branch: Option<String> = None;
            let mut next_step: Option<String> = None;
            let mut switch_value: Option<String> = None;

            if let (Some(var), false) = (&config.switch_variable, config.cases.is_empty()) {
                // Switch mode: resolve the variable and look it up
                let value = ctx.get_variable(var).unwrap_or(Value::Null);
                let value_str = match &value {
                    Value::String(s) => s.trim().to_string(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                switch_value = Some(value_str.clone());

                if let Some(target) = config.cases.get(&value_str) {
                    selected_branch = Some(value_str.clone());
                    next_step = Some(target.clone());
                } else if let Some(default) = &config.default_step {
                    selected_branch = Some("_default".to_string());
                    next_step = Some(default.clone());
                }

                tracing::info!(
                    step_id = step.id.as_str(),
                    switch = value_str.as_str(),
                    next = next_step.as_deref().unwrap_or("-"),
                    "condition switch evaluated"
                );
            } else {
                // Branch mode: first truthy condition wins
                for branch in &config.branches {
                    let is_true = ctx.evaluate_condition(&branch.condition);
                    evaluated.push(json!({
                        "condition": branch.condition,
                        "result": is_true,
                    }));
                    if is_true {
                        selected_branch = Some(
                            branch
                                .label
                                .clone()
                                .unwrap_or_else(|| branch.condition.clone()),
                        );
                        next_step = Some(branch.next_step.clone());
                        break;
                    }
                }

                if next_step.is_none() {
                    if let Some(default) = &config.default_step {
                        selected_branch = Some("_default".to_string());
                        next_step = Some(default.clone());
                    }
                }

                tracing::info!(
                    step_id = step.id.as_str(),
                    selected = selected_branch.as_deref().unwrap_or("-"),
                    next = next_step.as_deref().unwrap_or("-"),
                    "condition branches evaluated"
                );
            }

            let mut result = json!({
                "step_id": step.id,
                "evaluated": evaluated,
                "selected_branch": selected_branch,
                "next_step": next_step,
            });
            if let Some(value) = switch_value {
                result["switch_value"] = json!(value);
            }

            if let Some(var) = &config.output_variable {
                ctx.set_variable(var.clone(), result.clone());
            }
            if let Some(next) = &next_step {
                ctx.set_variable("_condition_next", json!(next));
            }

            Ok(result)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::handlers::tests::test_context;

    fn branch_step() -> WorkflowStep {
        WorkflowStep::new("route", "condition", "Route by sentiment").with_config(
            "branches",
            json!([
                {"condition": "${sentiment} == 'positive'", "next_step": "positive_handler"},
                {"condition": "${sentiment} == 'negative'", "next_step": "negative_handler"},
            ]),
        )
    }

    #[tokio::test]
    async fn first_truthy_branch_wins() {
        let handler = ConditionStepHandler::new();
        let ctx = test_context();
        ctx.set_variable("sentiment", json!("negative"));

        let result = handler.execute(&branch_step(), &ctx).await.unwrap();
        assert_eq!(result["next_step"], json!("negative_handler"));
        assert_eq!(ctx.get_variable("_condition_next"), Some(json!("negative_handler")));
        // Both conditions were evaluated (first was false)
        assert_eq!(result["evaluated"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn evaluation_stops_at_first_match() {
        let handler = ConditionStepHandler::new();
        let ctx = test_context();
        ctx.set_variable("sentiment", json!("positive"));

        let result = handler.execute(&branch_step(), &ctx).await.unwrap();
        assert_eq!(result["next_step"], json!("positive_handler"));
        assert_eq!(result["evaluated"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_default_step() {
        let handler = ConditionStepHandler::new();
        let ctx = test_context();
        ctx.set_variable("sentiment", json!("neutral"));

        let step = branch_step().with_config("default_step", json!("neutral_handler"));
        let result = handler.execute(&step, &ctx).await.unwrap();
        assert_eq!(result["next_step"], json!("neutral_handler"));
        assert_eq!(result["selected_branch"], json!("_default"));
    }

    #[tokio::test]
    async fn no_match_without_default_leaves_next_unset() {
        let handler = ConditionStepHandler::new();
        let ctx = test_context();
        ctx.set_variable("sentiment", json!("neutral"));

        let result = handler.execute(&branch_step(), &ctx).await.unwrap();
        assert_eq!(result["next_step"], Value::Null);
        assert_eq!(ctx.get_variable("_condition_next"), None);
    }

    #[tokio::test]
    async fn switch_mode_matches_case() {
        let handler = ConditionStepHandler::new();
        let ctx = test_context();
        ctx.set_variable("request_type", json!("support"));

        let step = WorkflowStep::new("route", "condition", "Route by type")
            .with_config("switch_variable", json!("request_type"))
            .with_config(
                "cases",
                json!({"support": "support_flow", "sales": "sales_flow"}),
            )
            .with_config("default_step", json!("general_flow"));

        let result = handler.execute(&step, &ctx).await.unwrap();
        assert_eq!(result["next_step"], json!("support_flow"));
        assert_eq!(result["switch_value"], json!("support"));
    }

    #[tokio::test]
    async fn switch_mode_falls_back_to_default() {
        let handler = ConditionStepHandler::new();
        let ctx = test_context();
        ctx.set_variable("request_type", json!("unknown"));

        let step = WorkflowStep::new("route", "condition", "Route by type")
            .with_config("switch_variable", json!("request_type"))
            .with_config("cases", json!({"support": "support_flow"}))
            .with_config("default_step", json!("general_flow"));

        let result = handler.execute(&step, &ctx).await.unwrap();
        assert_eq!(result["next_step"], json!("general_flow"));
        assert_eq!(result["selected_branch"], json!("_default"));
    }

    #[tokio::test]
    async fn output_variable_receives_selection_record() {
        let handler = ConditionStepHandler::new();
        let ctx = test_context();
        ctx.set_variable("sentiment", json!("positive"));

        let step = branch_step().with_config("output_variable", json!("routing"));
        handler.execute(&step, &ctx).await.unwrap();

        let routing = ctx.get_variable("routing").unwrap();
        assert_eq!(routing["next_step"], json!("positive_handler"));
    }
}
