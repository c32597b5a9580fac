//! Multi-agent step: coordination patterns over a roster of agents.
//!
//! Patterns:
//! - `sequential`: each agent's output feeds the next agent's input;
//! - `hierarchical`: a manager plans, workers execute, the manager
//!   synthesizes;
//! - `collaborative`: agents contribute once per round to a shared list;
//! - `debate`: agents state positions and revise them given the others';
//! - `router`: a router invocation picks exactly one agent to run;
//! - `voting`: every agent answers, majority (exact equality) wins;
//! - `chain`: like sequential but per-agent prompt templates with an
//!   `${input}` placeholder.
//!
//! Every pattern records the roster, each round's `(agent, output)` pairs,
//! and a `final_output`.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};

use skein_types::workflow::WorkflowStep;

use super::agent::{AgentInvoker, AgentRequest};
use super::{HandlerError, StepHandler, parse_config};
use crate::workflow::executor::ExecutionContext;

/// One agent in the roster.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default, alias = "prompt")]
    pub prompt_template: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentSpec {
    /// `id` and `agent_id` default to each other when only one is given.
    fn normalize(mut self) -> Self {
        if self.id.is_empty() {
            self.id = self.agent_id.clone();
        }
        if self.agent_id.is_empty() {
            self.agent_id = self.id.clone();
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MultiAgentConfig {
    #[serde(default = "default_pattern")]
    pattern: String,
    #[serde(default)]
    agents: Vec<AgentSpec>,
    #[serde(default)]
    manager_agent: Option<AgentSpec>,
    #[serde(default, alias = "input_template")]
    task: String,
    #[serde(default = "default_max_rounds")]
    max_rounds: u32,
    #[serde(default)]
    router_prompt: Option<String>,
    #[serde(default)]
    output_variable: Option<String>,
}

fn default_pattern() -> String {
    "sequential".to_string()
}

fn default_max_rounds() -> u32 {
    10
}

/// Handler for `multi_agent` steps.
pub struct MultiAgentStepHandler {
    invoker: Arc<dyn AgentInvoker>,
}

impl MultiAgentStepHandler {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self { invoker }
    }

    async fn run_agent(&self, agent: &AgentSpec, prompt: String) -> Result<String, HandlerError> {
        tracing::debug!(
            agent = agent.id.as_str(),
            role = agent.role.as_str(),
            "running roster agent"
        );
        let reply = self
            .invoker
            .invoke(AgentRequest {
                agent_id: agent.agent_id.clone(),
                prompt,
                system_prompt: None,
                model: None,
                temperature: None,
                max_tokens: None,
                tools: agent.tools.clone(),
                retrieval: None,
            })
            .await
            .map_err(HandlerError::Agent)?;
        Ok(reply.response)
    }

    async fn sequential(
        &self,
        agents: &[AgentSpec],
        task: &str,
        rounds: &mut Vec<Value>,
    ) -> Result<String, HandlerError> {
        let mut current = task.to_string();
        for agent in agents {
            let output = self.run_agent(agent, current.clone()).await?;
            rounds.push(json!({
                "agent": agent.id,
                "input": truncate(&current, 100),
                "output": output,
            }));
            current = output;
        }
        Ok(current)
    }

    async fn hierarchical(
        &self,
        config: &MultiAgentConfig,
        agents: &[AgentSpec],
        task: &str,
        rounds: &mut Vec<Value>,
    ) -> Result<String, HandlerError> {
        let manager = match &config.manager_agent {
            Some(m) => m.clone().normalize(),
            // Degrades to sequential when no manager is configured
            None => return self.sequential(agents, task, rounds).await,
        };

        let roles: Vec<&str> = agents.iter().map(|a| a.role.as_str()).collect();
        let plan = self
            .run_agent(
                &manager,
                format!("Plan how to accomplish: {task}\nAvailable workers: {roles:?}"),
            )
            .await?;
        rounds.push(json!({"agent": "manager", "action": "plan", "output": plan}));

        let mut worker_results: Vec<Value> = Vec::new();
        for agent in agents {
            let output = self
                .run_agent(agent, format!("Execute your part of: {task}\nPlan: {plan}"))
                .await?;
            worker_results.push(json!({"agent": agent.id, "result": output}));
            rounds.push(json!({"agent": agent.id, "action": "execute", "output": output}));
        }

        let synthesis = self
            .run_agent(
                &manager,
                format!("Synthesize results:\n{}", json!(worker_results)),
            )
            .await?;
        rounds.push(json!({"agent": "manager", "action": "synthesize", "output": synthesis}));
        Ok(synthesis)
    }

    async fn collaborative(
        &self,
        config: &MultiAgentConfig,
        agents: &[AgentSpec],
        task: &str,
        rounds: &mut Vec<Value>,
    ) -> Result<String, HandlerError> {
        let mut contributions: Vec<Value> = Vec::new();

        for round in 0..config.max_rounds {
            let mut round_entries: Vec<Value> = Vec::new();
            for agent in agents {
                let recent: Vec<&Value> =
                    contributions.iter().rev().take(3).rev().collect();
                let prompt = format!(
                    "Task: {task}\nPrevious contributions: {}\nAdd your contribution:",
                    json!(recent)
                );
                let output = self.run_agent(agent, prompt).await?;
                round_entries.push(json!({"agent": agent.id, "contribution": output}));
                contributions.push(json!({"agent": agent.id, "text": output}));
            }
            rounds.push(json!({"round": round, "contributions": round_entries}));
        }

        Ok(contributions
            .last()
            .and_then(|c| c["text"].as_str())
            .unwrap_or_default()
            .to_string())
    }

    async fn debate(
        &self,
        config: &MultiAgentConfig,
        agents: &[AgentSpec],
        task: &str,
        rounds: &mut Vec<Value>,
    ) -> Result<(String, Value), HandlerError> {
        let mut positions: HashMap<String, String> = HashMap::new();

        for agent in agents {
            let position = self
                .run_agent(agent, format!("State your position on: {task}"))
                .await?;
            rounds.push(json!({"round": 0, "agent": agent.id, "position": position}));
            positions.insert(agent.id.clone(), position);
        }

        for round in 1..config.max_rounds {
            let mut next_positions: HashMap<String, String> = HashMap::new();
            for agent in agents {
                let others: HashMap<&String, &String> = positions
                    .iter()
                    .filter(|(id, _)| *id != &agent.id)
                    .collect();
                let own = positions.get(&agent.id).cloned().unwrap_or_default();
                let prompt = format!(
                    "Task: {task}\nYour position: {own}\nOther positions: {}\nRevise your position:",
                    json!(others)
                );
                let revised = self.run_agent(agent, prompt).await?;
                rounds.push(json!({"round": round, "agent": agent.id, "position": revised}));
                next_positions.insert(agent.id.clone(), revised);
            }
            positions = next_positions;

            // Converged: every position is literally identical
            let mut distinct: Vec<&str> = positions.values().map(|p| p.trim()).collect();
            distinct.sort_unstable();
            distinct.dedup();
            if distinct.len() <= 1 {
                break;
            }
        }

        // Final answer is the first roster agent's settled position
        let final_position = agents
            .first()
            .and_then(|a| positions.get(&a.id))
            .cloned()
            .unwrap_or_default();
        let positions_json = json!(positions);
        Ok((final_position, positions_json))
    }

    async fn router(
        &self,
        config: &MultiAgentConfig,
        agents: &[AgentSpec],
        task: &str,
        rounds: &mut Vec<Value>,
    ) -> Result<(String, String), HandlerError> {
        let descriptions: Vec<String> = agents
            .iter()
            .map(|a| format!("- {}: {} - {}", a.id, a.role, a.goal))
            .collect();
        let router_prompt = config.router_prompt.clone().unwrap_or_else(|| {
            format!(
                "Select best agent for: {task}\nAgents:\n{}\nRespond with just the agent id.",
                descriptions.join("\n")
            )
        });

        let router = AgentSpec {
            id: "router".to_string(),
            agent_id: "router".to_string(),
            role: "Router".to_string(),
            goal: String::new(),
            prompt_template: String::new(),
            tools: Vec::new(),
        };
        let selection = self.run_agent(&router, router_prompt).await?;
        let selection_lower = selection.to_lowercase();

        let selected = agents
            .iter()
            .find(|a| selection_lower.contains(&a.id.to_lowercase()))
            .unwrap_or(&agents[0]);
        rounds.push(json!({"agent": "router", "selected": selected.id}));

        let output = self.run_agent(selected, task.to_string()).await?;
        rounds.push(json!({"agent": selected.id, "output": output}));
        Ok((output, selected.id.clone()))
    }

    async fn voting(
        &self,
        agents: &[AgentSpec],
        task: &str,
        rounds: &mut Vec<Value>,
    ) -> Result<(String, Value), HandlerError> {
        let mut responses: Vec<(String, String)> = Vec::new();
        for agent in agents {
            let response = self.run_agent(agent, task.to_string()).await?;
            rounds.push(json!({"agent": agent.id, "response": response}));
            responses.push((agent.id.clone(), response));
        }

        // Exact-equality majority; ties break toward the earliest roster
        // position that produced the winning answer.
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (_, response) in &responses {
            *counts.entry(response.trim()).or_insert(0) += 1;
        }
        let best_count = counts.values().copied().max().unwrap_or(0);
        let winner = responses
            .iter()
            .find(|(_, r)| counts[r.trim()] == best_count)
            .map(|(_, r)| r.clone())
            .unwrap_or_default();

        let responses_json = json!(
            responses
                .iter()
                .map(|(id, r)| json!({"agent": id, "response": r}))
                .collect::<Vec<_>>()
        );
        Ok((winner, responses_json))
    }

    async fn chain(
        &self,
        agents: &[AgentSpec],
        task: &str,
        ctx: &ExecutionContext,
        rounds: &mut Vec<Value>,
    ) -> Result<String, HandlerError> {
        let mut current = task.to_string();
        for agent in agents {
            let prompt = if agent.prompt_template.is_empty() {
                current.clone()
            } else {
                ctx.resolve_string(&agent.prompt_template.replace("${input}", &current))
            };
            let output = self.run_agent(agent, prompt).await?;
            rounds.push(json!({
                "agent": agent.id,
                "input": truncate(&current, 100),
                "output": output,
            }));
            current = output;
        }
        Ok(current)
    }
}

impl StepHandler for MultiAgentStepHandler {
    fn step_type(&self) -> &str {
        "multi_agent"
    }

    fn execute<'a>(
        &'a self,
        step: &'a WorkflowStep,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Value, HandlerError>> {
        Box::pin(async move {
            let mut config: MultiAgentConfig = parse_config(step)?;
            config.agents = config
                .agents
                .into_iter()
                .map(AgentSpec::normalize)
                .collect();

            if config.agents.is_empty() {
                return Err(HandlerError::InvalidConfig(format!(
                    "step '{}': multi_agent requires a non-empty agent roster",
                    step.id
                )));
            }
            if config.pattern == "hierarchical" && config.manager_agent.is_none() {
                return Err(HandlerError::InvalidConfig(format!(
                    "step '{}': hierarchical pattern requires manager_agent",
                    step.id
                )));
            }

            let task = ctx.resolve_string(&config.task);
            let mut rounds: Vec<Value> = Vec::new();
            let mut extra: Vec<(&str, Value)> = Vec::new();

            let final_output = match config.pattern.as_str() {
                "sequential" => self.sequential(&config.agents, &task, &mut rounds).await?,
                "hierarchical" => {
                    self.hierarchical(&config, &config.agents, &task, &mut rounds)
                        .await?
                }
                "collaborative" => {
                    self.collaborative(&config, &config.agents, &task, &mut rounds)
                        .await?
                }
                "debate" => {
                    let (output, positions) =
                        self.debate(&config, &config.agents, &task, &mut rounds).await?;
                    extra.push(("positions", positions));
                    output
                }
                "router" => {
                    let (output, selected) =
                        self.router(&config, &config.agents, &task, &mut rounds).await?;
                    extra.push(("selected_agent", json!(selected)));
                    output
                }
                "voting" => {
                    let (output, responses) =
                        self.voting(&config.agents, &task, &mut rounds).await?;
                    extra.push(("responses", responses));
                    output
                }
                "chain" => self.chain(&config.agents, &task, ctx, &mut rounds).await?,
                other => {
                    return Err(HandlerError::InvalidConfig(format!(
                        "step '{}': unknown orchestration pattern: {other}",
                        step.id
                    )));
                }
            };

            let mut result = json!({
                "pattern": config.pattern,
                "agents": config.agents.iter().map(|a| a.id.clone()).collect::<Vec<_>>(),
                "task": task,
                "rounds": rounds,
                "final_output": final_output,
            });
            for (key, value) in extra {
                result[key] = value;
            }

            if let Some(var) = &config.output_variable {
                ctx.set_variable(var.clone(), result["final_output"].clone());
            }

            tracing::info!(
                step_id = step.id.as_str(),
                pattern = config.pattern.as_str(),
                rounds = result["rounds"].as_array().map(|r| r.len()).unwrap_or(0),
                "multi-agent step completed"
            );

            Ok(result)
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
