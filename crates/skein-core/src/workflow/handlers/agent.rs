//! Agent step: invoke the external agent collaborator with a resolved prompt.
//!
//! The actual LLM execution is an opaque async collaborator behind
//! [`AgentInvoker`]; this handler resolves the prompt template against the
//! variable scope, forwards model overrides, tool allow-lists, and retrieval
//! parameters, and writes the response to the configured output variable.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use skein_types::workflow::WorkflowStep;

use super::{HandlerError, StepHandler, parse_config};
use crate::workflow::executor::ExecutionContext;

// ---------------------------------------------------------------------------
// The agent collaborator seam
// ---------------------------------------------------------------------------

/// Retrieval-augmentation parameters forwarded to the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub collection: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    3
}

/// A single agent invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalParams>,
}

/// What the collaborator returns: text plus token accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub response: String,
    #[serde(default)]
    pub tokens_input: u64,
    #[serde(default)]
    pub tokens_output: u64,
    #[serde(default)]
    pub model: String,
}

/// The opaque async agent collaborator.
///
/// Implementations perform the actual LLM call; the workflow engine only
/// sees text in, text + token counts out.
pub trait AgentInvoker: Send + Sync {
    fn invoke<'a>(&'a self, request: AgentRequest) -> BoxFuture<'a, Result<AgentReply, String>>;
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct AgentStepConfig {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    output_variable: Option<String>,
    #[serde(default)]
    model_override: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    use_rag: bool,
    #[serde(default)]
    rag_collection: Option<String>,
    #[serde(default = "default_top_k")]
    rag_top_k: usize,
    #[serde(default)]
    system_prompt: Option<String>,
}

/// Handler for `agent` steps.
pub struct AgentStepHandler {
    invoker: Arc<dyn AgentInvoker>,
}

impl AgentStepHandler {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self { invoker }
    }
}

impl StepHandler for AgentStepHandler {
    fn step_type(&self) -> &str {
        "agent"
    }

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value, HandlerError>> {
        Box::pin(async move {
            let config: AgentStepConfig = parse_config(step)?;
            if config.agent_id.is_empty() {
                return Err(HandlerError::InvalidConfig(format!(
                    "step '{}': agent_id is required",
                    step.id
                )));
            }
            if config.prompt.is_empty() {
                return Err(HandlerError::InvalidConfig(format!(
                    "step '{}': prompt is required",
                    step.id
                )));
            }

            let prompt = ctx.resolve_string(&config.prompt);
            let system_prompt = config
                .system_prompt
                .as_deref()
                .map(|s| ctx.resolve_string(s));

            let retrieval = if config.use_rag {
                config.rag_collection.clone().map(|collection| RetrievalParams {
                    collection,
                    top_k: config.rag_top_k,
                })
            } else {
                None
            };

            tracing::info!(
                step_id = step.id.as_str(),
                agent_id = config.agent_id.as_str(),
                "invoking agent"
            );

            let reply = self
                .invoker
                .invoke(AgentRequest {
                    agent_id: config.agent_id.clone(),
                    prompt: prompt.clone(),
                    system_prompt,
                    model: config.model_override.clone(),
                    temperature: config.temperature,
                    max_tokens: config.max_tokens,
                    tools: config.tools.clone(),
                    retrieval,
                })
                .await
                .map_err(HandlerError::Agent)?;

            tracing::debug!(
                step_id = step.id.as_str(),
                tokens_input = reply.tokens_input,
                tokens_output = reply.tokens_output,
                model = reply.model.as_str(),
                "agent replied"
            );

            if let Some(var) = &config.output_variable {
                ctx.set_variable(var.clone(), json!(reply.response));
            }

            // The step output is the plain response text, so `_last` and the
            // step-id variable read naturally in downstream templates.
            Ok(Value::String(reply.response))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::handlers::tests::{EchoInvoker, test_context};

    fn agent_step(id: &str, agent_id: &str, prompt: &str) -> WorkflowStep {
        WorkflowStep::new(id, "agent", "Agent")
            .with_config("agent_id", json!(agent_id))
            .with_config("prompt", json!(prompt))
    }

    #[tokio::test]
    async fn resolves_prompt_against_scope() {
        let handler = AgentStepHandler::new(Arc::new(EchoInvoker));
        let ctx = test_context();
        ctx.set_variable("topic", json!("rust"));

        let step = agent_step("s1", "echo", "Summarize ${topic}");
        let output = handler.execute(&step, &ctx).await.unwrap();
        assert_eq!(output, json!("Summarize rust"));
    }

    #[tokio::test]
    async fn writes_output_variable() {
        let handler = AgentStepHandler::new(Arc::new(EchoInvoker));
        let ctx = test_context();

        let step = agent_step("s1", "echo", "hello")
            .with_config("output_variable", json!("greeting"));
        handler.execute(&step, &ctx).await.unwrap();
        assert_eq!(ctx.get_variable("greeting"), Some(json!("hello")));
    }

    #[tokio::test]
    async fn missing_agent_id_is_invalid_config() {
        let handler = AgentStepHandler::new(Arc::new(EchoInvoker));
        let ctx = test_context();
        let step = WorkflowStep::new("s1", "agent", "Agent").with_config("prompt", json!("hi"));

        let err = handler.execute(&step, &ctx).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn missing_prompt_is_invalid_config() {
        let handler = AgentStepHandler::new(Arc::new(EchoInvoker));
        let ctx = test_context();
        let step = WorkflowStep::new("s1", "agent", "Agent").with_config("agent_id", json!("a"));

        let err = handler.execute(&step, &ctx).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn forwards_model_override_and_token_cap() {
        struct CapturingInvoker(std::sync::Mutex<Option<AgentRequest>>);
        impl AgentInvoker for CapturingInvoker {
            fn invoke<'a>(
                &'a self,
                request: AgentRequest,
            ) -> BoxFuture<'a, Result<AgentReply, String>> {
                *self.0.lock().unwrap() = Some(request.clone());
                Box::pin(async move {
                    Ok(AgentReply {
                        response: "ok".to_string(),
                        tokens_input: 0,
                        tokens_output: 0,
                        model: "m".to_string(),
                    })
                })
            }
        }

        let invoker = Arc::new(CapturingInvoker(std::sync::Mutex::new(None)));
        let handler = AgentStepHandler::new(Arc::clone(&invoker) as Arc<dyn AgentInvoker>);
        let ctx = test_context();
        let step = agent_step("s1", "echo", "hi")
            .with_config("model_override", json!("fast-model"))
            .with_config("max_tokens", json!(256));

        handler.execute(&step, &ctx).await.unwrap();
        let captured = invoker.0.lock().unwrap().clone().unwrap();
        assert_eq!(captured.model.as_deref(), Some("fast-model"));
        assert_eq!(captured.max_tokens, Some(256));
    }

    #[tokio::test]
    async fn rag_parameters_require_collection() {
        // use_rag without a collection silently omits retrieval
        struct CapturingInvoker(std::sync::Mutex<Option<AgentRequest>>);
        impl AgentInvoker for CapturingInvoker {
            fn invoke<'a>(
                &'a self,
                request: AgentRequest,
            ) -> BoxFuture<'a, Result<AgentReply, String>> {
                *self.0.lock().unwrap() = Some(request.clone());
                Box::pin(async move {
                    Ok(AgentReply {
                        response: "ok".to_string(),
                        tokens_input: 0,
                        tokens_output: 0,
                        model: "m".to_string(),
                    })
                })
            }
        }

        let invoker = Arc::new(CapturingInvoker(std::sync::Mutex::new(None)));
        let handler = AgentStepHandler::new(Arc::clone(&invoker) as Arc<dyn AgentInvoker>);
        let ctx = test_context();

        let step = agent_step("s1", "echo", "hi")
            .with_config("use_rag", json!(true))
            .with_config("rag_collection", json!("docs"))
            .with_config("rag_top_k", json!(5));
        handler.execute(&step, &ctx).await.unwrap();

        let captured = invoker.0.lock().unwrap().clone().unwrap();
        let retrieval = captured.retrieval.unwrap();
        assert_eq!(retrieval.collection, "docs");
        assert_eq!(retrieval.top_k, 5);
    }
}
