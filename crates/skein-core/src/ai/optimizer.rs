//! Workflow optimizer: structural and historical analyses.
//!
//! Inspects a definition (and optionally its execution history) and emits
//! prioritized recommendations: parallelization opportunities, missing
//! retry/timeout/max_tokens configuration, latency bottlenecks, and
//! high-variance steps.

use std::collections::HashMap;

use petgraph::graph::DiGraph;
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use skein_types::workflow::WorkflowDefinition;

use crate::workflow::executor::ExecutionResult;

/// Average step latency above which a bottleneck is reported (ms).
const BOTTLENECK_THRESHOLD_MS: f64 = 5000.0;

// ---------------------------------------------------------------------------
// Recommendation types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationKind {
    Performance,
    Cost,
    Reliability,
    Parallelization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// A single optimization recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecommendation {
    pub id: String,
    pub kind: OptimizationKind,
    pub priority: Priority,
    pub title: String,
    pub description: String,
    pub impact: String,
    #[serde(default)]
    pub steps_affected: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_improvement: Option<f64>,
    #[serde(default = "default_effort")]
    pub implementation_effort: String,
}

fn default_effort() -> String {
    "medium".to_string()
}

// ---------------------------------------------------------------------------
// WorkflowOptimizer
// ---------------------------------------------------------------------------

/// Structural analyzer over workflow definitions and execution histories.
pub struct WorkflowOptimizer {
    counter: std::sync::atomic::AtomicU64,
}

impl WorkflowOptimizer {
    pub fn new() -> Self {
        Self {
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Run every analysis and return recommendations sorted by priority.
    pub fn analyze(
        &self,
        workflow: &WorkflowDefinition,
        history: &[ExecutionResult],
    ) -> Vec<OptimizationRecommendation> {
        let mut recommendations = Vec::new();

        recommendations.extend(self.analyze_structure(workflow));
        recommendations.extend(self.analyze_parallelization(workflow));
        if !history.is_empty() {
            recommendations.extend(self.analyze_performance(history));
        }
        recommendations.extend(self.analyze_cost(workflow));
        recommendations.extend(self.analyze_reliability(workflow));

        recommendations.sort_by_key(|r| r.priority);
        recommendations
    }

    fn next_id(&self) -> String {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("opt_{}", n + 1)
    }

    /// Consecutive agent runs and overall length.
    fn analyze_structure(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Vec<OptimizationRecommendation> {
        let mut recommendations = Vec::new();
        let mut consecutive_agents: Vec<String> = Vec::new();

        let mut flush = |run: &mut Vec<String>, recs: &mut Vec<OptimizationRecommendation>| {
            if run.len() >= 3 {
                recs.push(OptimizationRecommendation {
                    id: self.next_id(),
                    kind: OptimizationKind::Parallelization,
                    priority: Priority::Medium,
                    title: "Consider parallelizing consecutive agents".to_string(),
                    description: format!(
                        "{} sequential agent steps could run in parallel",
                        run.len()
                    ),
                    impact: format!(
                        "potential {}% reduction in wall-clock time",
                        (run.len() - 1) * 30
                    ),
                    steps_affected: run.clone(),
                    estimated_improvement: Some(30.0),
                    implementation_effort: "medium".to_string(),
                });
            }
            run.clear();
        };

        for step in &workflow.steps {
            if step.step_type == "agent" {
                consecutive_agents.push(step.id.clone());
            } else {
                flush(&mut consecutive_agents, &mut recommendations);
            }
        }
        flush(&mut consecutive_agents, &mut recommendations);

        if workflow.steps.len() > 10 {
            recommendations.push(OptimizationRecommendation {
                id: self.next_id(),
                kind: OptimizationKind::Performance,
                priority: Priority::Low,
                title: "Long workflow".to_string(),
                description: format!(
                    "workflow has {} steps; consider splitting into sub-workflows",
                    workflow.steps.len()
                ),
                impact: "better maintainability and reuse".to_string(),
                steps_affected: Vec::new(),
                estimated_improvement: None,
                implementation_effort: "high".to_string(),
            });
        }

        recommendations
    }

    /// Steps with no dependency edges between them can fan out.
    fn analyze_parallelization(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Vec<OptimizationRecommendation> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut indices = HashMap::new();
        for step in &workflow.steps {
            indices.insert(step.id.as_str(), graph.add_node(step.id.as_str()));
        }
        for step in &workflow.steps {
            for target in [&step.next_step, &step.on_error].into_iter().flatten() {
                if let Some(&to) = indices.get(target.as_str()) {
                    graph.add_edge(indices[step.id.as_str()], to, ());
                }
            }
        }

        // Weakly connected components; singleton components share no
        // dependency edges with anything and are mutually independent.
        let mut union = UnionFind::new(graph.node_count());
        for edge in graph.edge_references() {
            union.union(edge.source().index(), edge.target().index());
        }

        let mut component_sizes: HashMap<usize, usize> = HashMap::new();
        for idx in graph.node_indices() {
            *component_sizes.entry(union.find(idx.index())).or_insert(0) += 1;
        }

        let independent: Vec<String> = graph
            .node_indices()
            .filter(|idx| component_sizes[&union.find(idx.index())] == 1)
            .map(|idx| graph[idx].to_string())
            .collect();

        if independent.len() >= 2 {
            let improvement = (independent.len() as f64 * 20.0).min(50.0);
            return vec![OptimizationRecommendation {
                id: self.next_id(),
                kind: OptimizationKind::Parallelization,
                priority: Priority::High,
                title: "Independent steps can run in parallel".to_string(),
                description: format!(
                    "steps {} have no dependencies between them",
                    independent.join(", ")
                ),
                impact: "parallel execution can cut total time significantly".to_string(),
                steps_affected: independent,
                estimated_improvement: Some(improvement),
                implementation_effort: "medium".to_string(),
            }];
        }

        Vec::new()
    }

    /// Latency bottlenecks and high variance from execution history.
    fn analyze_performance(
        &self,
        history: &[ExecutionResult],
    ) -> Vec<OptimizationRecommendation> {
        let mut step_times: HashMap<String, Vec<f64>> = HashMap::new();
        for execution in history {
            for step in &execution.step_results {
                step_times
                    .entry(step.step_id.clone())
                    .or_default()
                    .push(step.duration_ms);
            }
        }

        let mut recommendations = Vec::new();
        for (step_id, times) in &step_times {
            let avg = times.iter().sum::<f64>() / times.len() as f64;

            if avg > BOTTLENECK_THRESHOLD_MS {
                recommendations.push(OptimizationRecommendation {
                    id: self.next_id(),
                    kind: OptimizationKind::Performance,
                    priority: Priority::High,
                    title: format!("Performance bottleneck: {step_id}"),
                    description: format!(
                        "step averages {:.1}s per execution",
                        avg / 1000.0
                    ),
                    impact: "optimizing this step reduces total time the most".to_string(),
                    steps_affected: vec![step_id.clone()],
                    estimated_improvement: Some(20.0),
                    implementation_effort: "medium".to_string(),
                });
            }

            if times.len() >= 3 {
                let variance = times
                    .iter()
                    .map(|t| (t - avg) * (t - avg))
                    .sum::<f64>()
                    / times.len() as f64;
                if variance > avg * 0.5 {
                    recommendations.push(OptimizationRecommendation {
                        id: self.next_id(),
                        kind: OptimizationKind::Reliability,
                        priority: Priority::Medium,
                        title: format!("High latency variance: {step_id}"),
                        description: "execution time varies widely between runs".to_string(),
                        impact: "investigate unstable inputs or dependencies".to_string(),
                        steps_affected: vec![step_id.clone()],
                        estimated_improvement: None,
                        implementation_effort: "medium".to_string(),
                    });
                }
            }
        }

        recommendations
    }

    /// Agent steps without token caps cost more than they need to.
    fn analyze_cost(&self, workflow: &WorkflowDefinition) -> Vec<OptimizationRecommendation> {
        let uncapped: Vec<String> = workflow
            .steps
            .iter()
            .filter(|s| s.step_type == "agent" && !s.config.contains_key("max_tokens"))
            .map(|s| s.id.clone())
            .collect();

        if uncapped.is_empty() {
            return Vec::new();
        }

        vec![OptimizationRecommendation {
            id: self.next_id(),
            kind: OptimizationKind::Cost,
            priority: Priority::Low,
            title: "Agent steps without max_tokens".to_string(),
            description: format!(
                "{} agent step(s) have no output token cap",
                uncapped.len()
            ),
            impact: "bounding output tokens bounds cost per run".to_string(),
            steps_affected: uncapped,
            estimated_improvement: None,
            implementation_effort: "low".to_string(),
        }]
    }

    /// Missing retry policies and timeouts.
    fn analyze_reliability(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Vec<OptimizationRecommendation> {
        let mut recommendations = Vec::new();

        let no_retry: Vec<String> = workflow
            .steps
            .iter()
            .filter(|s| s.retry_policy.is_none())
            .map(|s| s.id.clone())
            .collect();
        if !no_retry.is_empty() {
            recommendations.push(OptimizationRecommendation {
                id: self.next_id(),
                kind: OptimizationKind::Reliability,
                priority: Priority::Medium,
                title: "Steps without retry policy".to_string(),
                description: format!("{} step(s) will not retry on failure", no_retry.len()),
                impact: "transient failures become workflow failures".to_string(),
                steps_affected: no_retry,
                estimated_improvement: None,
                implementation_effort: "low".to_string(),
            });
        }

        let no_timeout: Vec<String> = workflow
            .steps
            .iter()
            .filter(|s| s.timeout_seconds.is_none())
            .map(|s| s.id.clone())
            .collect();
        if !no_timeout.is_empty() {
            recommendations.push(OptimizationRecommendation {
                id: self.next_id(),
                kind: OptimizationKind::Reliability,
                priority: Priority::Low,
                title: "Steps without explicit timeout".to_string(),
                description: format!(
                    "{} step(s) rely on the engine-wide default timeout",
                    no_timeout.len()
                ),
                impact: "slow steps block the run until the global default".to_string(),
                steps_affected: no_timeout,
                estimated_improvement: None,
                implementation_effort: "low".to_string(),
            });
        }

        recommendations
    }
}

impl Default for WorkflowOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::executor::{ExecutionStatus, StepResult};
    use serde_json::json;
    use skein_types::workflow::{RetryPolicy, WorkflowStep};

    fn optimizer() -> WorkflowOptimizer {
        WorkflowOptimizer::new()
    }

    fn chained_agents(n: usize) -> WorkflowDefinition {
        // Steps linked by explicit next_step so they form one chain
        let steps: Vec<WorkflowStep> = (0..n)
            .map(|i| {
                let mut s = WorkflowStep::new(format!("a{i}"), "agent", format!("A{i}"));
                if i + 1 < n {
                    s.next_step = Some(format!("a{}", i + 1));
                }
                s
            })
            .collect();
        WorkflowDefinition::new("chain", "Chain", steps)
    }

    fn history_with(step_id: &str, durations: &[f64]) -> Vec<ExecutionResult> {
        durations
            .iter()
            .map(|&d| ExecutionResult {
                execution_id: "e".to_string(),
                workflow_id: "w".to_string(),
                status: ExecutionStatus::Success,
                outputs: HashMap::new(),
                step_results: vec![StepResult {
                    step_id: step_id.to_string(),
                    status: ExecutionStatus::Success,
                    output: Some(json!(null)),
                    error: None,
                    started_at: None,
                    completed_at: None,
                    duration_ms: d,
                    retry_count: 0,
                    metadata: HashMap::new(),
                }],
                started_at: None,
                completed_at: None,
                duration_ms: d,
                error: None,
            })
            .collect()
    }

    #[test]
    fn three_consecutive_agents_suggest_parallelization() {
        let recs = optimizer().analyze(&chained_agents(3), &[]);
        assert!(
            recs.iter()
                .any(|r| r.kind == OptimizationKind::Parallelization
                    && r.title.contains("consecutive"))
        );
    }

    #[test]
    fn two_agents_do_not_trigger_the_consecutive_rule() {
        let recs = optimizer().analyze(&chained_agents(2), &[]);
        assert!(!recs.iter().any(|r| r.title.contains("consecutive")));
    }

    #[test]
    fn independent_steps_are_detected_via_the_graph() {
        // Three steps, none linked: every one is its own component
        let def = WorkflowDefinition::new(
            "iso",
            "Iso",
            vec![
                WorkflowStep::new("x", "agent", "X"),
                WorkflowStep::new("y", "agent", "Y"),
                WorkflowStep::new("z", "agent", "Z"),
            ],
        );
        let recs = optimizer().analyze(&def, &[]);
        let parallel = recs
            .iter()
            .find(|r| r.title.contains("Independent"))
            .unwrap();
        assert_eq!(parallel.priority, Priority::High);
        assert_eq!(parallel.steps_affected.len(), 3);
        assert_eq!(parallel.estimated_improvement, Some(50.0));
    }

    #[test]
    fn linked_steps_are_not_reported_independent() {
        let recs = optimizer().analyze(&chained_agents(2), &[]);
        assert!(!recs.iter().any(|r| r.title.contains("Independent")));
    }

    #[test]
    fn slow_steps_are_bottlenecks() {
        let def = chained_agents(1);
        let history = history_with("a0", &[6000.0, 7000.0]);
        let recs = optimizer().analyze(&def, &history);
        assert!(
            recs.iter()
                .any(|r| r.title.contains("bottleneck") || r.title.contains("Bottleneck")
                    || r.title.contains("Performance bottleneck"))
        );
    }

    #[test]
    fn high_variance_is_flagged_with_three_samples() {
        let def = chained_agents(1);
        // mean = 400, variance = ((300)^2 + 0 + (300)^2)/3 = 60000 > 200
        let history = history_with("a0", &[100.0, 400.0, 700.0]);
        let recs = optimizer().analyze(&def, &history);
        assert!(recs.iter().any(|r| r.title.contains("variance")));
    }

    #[test]
    fn stable_fast_steps_are_not_flagged() {
        let def = chained_agents(1);
        let history = history_with("a0", &[100.0, 101.0, 99.0]);
        let recs = optimizer().analyze(&def, &history);
        assert!(!recs.iter().any(|r| r.title.contains("variance")));
        assert!(!recs.iter().any(|r| r.title.contains("bottleneck")));
    }

    #[test]
    fn missing_retry_and_timeout_are_reported() {
        let recs = optimizer().analyze(&chained_agents(2), &[]);
        assert!(recs.iter().any(|r| r.title.contains("retry")));
        assert!(recs.iter().any(|r| r.title.contains("timeout")));
    }

    #[test]
    fn configured_steps_are_not_reported() {
        let mut step = WorkflowStep::new("a", "agent", "A")
            .with_config("max_tokens", json!(512));
        step.retry_policy = Some(RetryPolicy::default());
        step.timeout_seconds = Some(60);
        let def = WorkflowDefinition::new("tuned", "Tuned", vec![step]);

        let recs = optimizer().analyze(&def, &[]);
        assert!(!recs.iter().any(|r| r.title.contains("retry")));
        assert!(!recs.iter().any(|r| r.title.contains("timeout")));
        assert!(!recs.iter().any(|r| r.kind == OptimizationKind::Cost));
    }

    #[test]
    fn agent_without_max_tokens_is_a_cost_recommendation() {
        let recs = optimizer().analyze(&chained_agents(1), &[]);
        assert!(recs.iter().any(|r| r.kind == OptimizationKind::Cost));
    }

    #[test]
    fn long_workflows_get_a_split_suggestion() {
        let recs = optimizer().analyze(&chained_agents(11), &[]);
        assert!(recs.iter().any(|r| r.title == "Long workflow"));
    }

    #[test]
    fn recommendations_are_sorted_by_priority() {
        let def = WorkflowDefinition::new(
            "iso",
            "Iso",
            vec![
                WorkflowStep::new("x", "agent", "X"),
                WorkflowStep::new("y", "agent", "Y"),
            ],
        );
        let recs = optimizer().analyze(&def, &[]);
        let priorities: Vec<Priority> = recs.iter().map(|r| r.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort();
        assert_eq!(priorities, sorted);
    }
}
