//! Step handlers: pluggable per-step-type dispatchers.
//!
//! Each handler implements [`StepHandler`] for one step type tag. The
//! [`HandlerRegistry`] maps type tags to handlers; the engine looks a
//! handler up per step and the composite handlers (parallel, loop) dispatch
//! their branch bodies back through the registry.

pub mod agent;
pub mod condition;
pub mod loops;
pub mod multi_agent;
pub mod parallel;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use futures_util::future::BoxFuture;
use serde_json::Value;

use skein_types::workflow::WorkflowStep;

use self::agent::AgentInvoker;
use super::executor::ExecutionContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced by step handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The step config is missing or malformed.
    #[error("invalid step config: {0}")]
    InvalidConfig(String),

    /// The agent collaborator returned an error.
    #[error("agent invocation failed: {0}")]
    Agent(String),

    /// No handler is registered for the step type.
    #[error("no handler for step type: {0}")]
    NoHandler(String),

    /// The step body failed.
    #[error("{0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// StepHandler trait
// ---------------------------------------------------------------------------

/// A dispatcher for one step type.
///
/// Boxed futures keep the trait object-safe so handlers can live behind
/// `Arc<dyn StepHandler>` in the registry.
pub trait StepHandler: Send + Sync {
    /// The step type tag this handler processes.
    fn step_type(&self) -> &str;

    /// Execute the step against the context, returning its output value.
    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value, HandlerError>>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Registry of step handlers keyed by step type tag.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
}

impl HandlerRegistry {
    /// An empty registry; callers register handlers explicitly.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// A registry populated with the built-in handlers (agent, condition,
    /// parallel, loop, multi_agent), all sharing the given agent
    /// collaborator.
    pub fn with_defaults(invoker: Arc<dyn AgentInvoker>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<HandlerRegistry>| {
            let mut handlers: HashMap<String, Arc<dyn StepHandler>> = HashMap::new();

            let agent = Arc::new(agent::AgentStepHandler::new(Arc::clone(&invoker)));
            let condition = Arc::new(condition::ConditionStepHandler::new());
            let parallel = Arc::new(parallel::ParallelStepHandler::new(weak.clone()));
            let looper = Arc::new(loops::LoopStepHandler::new(weak.clone()));
            let multi = Arc::new(multi_agent::MultiAgentStepHandler::new(invoker));

            handlers.insert(agent.step_type().to_string(), agent as Arc<dyn StepHandler>);
            handlers.insert(
                condition.step_type().to_string(),
                condition as Arc<dyn StepHandler>,
            );
            handlers.insert(
                parallel.step_type().to_string(),
                parallel as Arc<dyn StepHandler>,
            );
            handlers.insert(
                looper.step_type().to_string(),
                looper as Arc<dyn StepHandler>,
            );
            handlers.insert(multi.step_type().to_string(), multi as Arc<dyn StepHandler>);

            Self {
                handlers: RwLock::new(handlers),
            }
        })
    }

    /// Register (or replace) a handler for its step type.
    pub fn register(&self, handler: Arc<dyn StepHandler>) {
        let step_type = handler.step_type().to_string();
        tracing::debug!(step_type = step_type.as_str(), "registered step handler");
        self.handlers.write().unwrap().insert(step_type, handler);
    }

    /// Look up the handler for a step type.
    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.read().unwrap().get(step_type).cloned()
    }

    /// Whether a handler exists for the step type.
    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.read().unwrap().contains_key(step_type)
    }

    /// Dispatch a step to its handler.
    pub fn dispatch<'a>(
        &self,
        step: &'a WorkflowStep,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value, HandlerError>> {
        let handler = self.get(&step.step_type);
        Box::pin(async move {
            match handler {
                Some(handler) => handler.execute(step, ctx).await,
                None => Err(HandlerError::NoHandler(step.step_type.clone())),
            }
        })
    }
}

/// Parse a step's opaque config map into a typed config struct.
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(
    step: &WorkflowStep,
) -> Result<T, HandlerError> {
    serde_json::from_value(Value::Object(step.config.clone()))
        .map_err(|e| HandlerError::InvalidConfig(format!("step '{}': {e}", step.id)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use super::agent::{AgentReply, AgentRequest};
    use crate::workflow::executor::{ExecutionConfig, ExecutionContext};
    use skein_types::workflow::WorkflowState;

    /// Echo collaborator used across handler tests: replies with the prompt,
    /// uppercased when the agent id says so.
    pub(crate) struct EchoInvoker;

    impl AgentInvoker for EchoInvoker {
        fn invoke<'a>(
            &'a self,
            request: AgentRequest,
        ) -> BoxFuture<'a, Result<AgentReply, String>> {
            Box::pin(async move {
                let response = if request.agent_id.contains("upper") {
                    request.prompt.to_uppercase()
                } else {
                    request.prompt.clone()
                };
                Ok(AgentReply {
                    response,
                    tokens_input: request.prompt.len() as u64,
                    tokens_output: 10,
                    model: request.model.unwrap_or_else(|| "default".to_string()),
                })
            })
        }
    }

    pub(crate) fn test_context() -> ExecutionContext {
        ExecutionContext::new(
            WorkflowState::new("exec_test", "wf_test"),
            ExecutionConfig::default(),
        )
    }

    #[tokio::test]
    async fn dispatch_without_handler_errors() {
        let registry = HandlerRegistry::empty();
        let step = WorkflowStep::new("s1", "ghost", "Ghost");
        let ctx = test_context();

        let err = registry.dispatch(&step, &ctx).await.unwrap_err();
        assert!(matches!(err, HandlerError::NoHandler(t) if t == "ghost"));
    }

    #[tokio::test]
    async fn default_registry_contains_builtins() {
        let registry = HandlerRegistry::with_defaults(Arc::new(EchoInvoker));
        for step_type in ["agent", "condition", "parallel", "loop", "multi_agent"] {
            assert!(registry.contains(step_type), "missing {step_type}");
        }
    }
}
