//! Workflow assistant: template synthesis and structural advice.
//!
//! Given a freeform description, the assistant scores a set of built-in
//! workflow templates by keyword hits; a template with two or more hits
//! wins, otherwise a generic step list is synthesized by scanning the
//! description for step-type keywords. It also suggests plausible next
//! steps for a partial workflow and flags structural problems.

use serde::{Deserialize, Serialize};
use serde_json::json;

use skein_types::workflow::{WorkflowDefinition, WorkflowStep};

/// Keyword hits required before a template is preferred over synthesis.
const TEMPLATE_SCORE_THRESHOLD: usize = 2;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// A suggested step to append to a workflow under construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSuggestion {
    pub step_type: String,
    pub name: String,
    pub description: String,
    pub confidence: f64,
    pub reason: String,
}

/// A synthesized workflow plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSuggestion {
    pub definition: WorkflowDefinition,
    /// The matched template name, or `None` for keyword synthesis.
    pub template: Option<String>,
    pub confidence: f64,
}

/// Severity of a detected problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemSeverity {
    Warning,
    Error,
}

/// A structural problem found in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemDetection {
    pub severity: ProblemSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

struct Template {
    name: &'static str,
    title: &'static str,
    keywords: &'static [&'static str],
    steps: &'static [(&'static str, &'static str, &'static str)],
}

const TEMPLATES: &[Template] = &[
    Template {
        name: "email_handler",
        title: "Email Handler",
        keywords: &["email", "message", "inbox", "mail"],
        steps: &[
            ("receive", "agent", "Receive Email"),
            ("analyze", "agent", "Analyze Content"),
            ("respond", "agent", "Generate Response"),
            ("send", "agent", "Send Reply"),
        ],
    },
    Template {
        name: "data_pipeline",
        title: "Data Pipeline",
        keywords: &["data", "etl", "extract", "transform", "load", "pipeline"],
        steps: &[
            ("extract", "agent", "Extract Data"),
            ("validate", "condition", "Validate Data"),
            ("transform", "agent", "Transform Data"),
            ("load", "agent", "Load to Destination"),
        ],
    },
    Template {
        name: "content_creation",
        title: "Content Creation",
        keywords: &["content", "write", "article", "blog", "post"],
        steps: &[
            ("research", "agent", "Research Topic"),
            ("outline", "agent", "Create Outline"),
            ("write", "agent", "Write Content"),
            ("review", "agent", "Review & Edit"),
        ],
    },
    Template {
        name: "customer_support",
        title: "Customer Support",
        keywords: &["support", "ticket", "help", "customer", "client"],
        steps: &[
            ("classify", "agent", "Classify Request"),
            ("route", "condition", "Route by Type"),
            ("resolve", "agent", "Generate Solution"),
            ("escalate", "condition", "Check Escalation"),
        ],
    },
    Template {
        name: "approval_flow",
        title: "Approval Flow",
        keywords: &["approval", "review", "validate", "authorize"],
        steps: &[
            ("submit", "agent", "Submit Request"),
            ("validate", "agent", "Validate Request"),
            ("approve", "condition", "Approval Decision"),
            ("notify", "agent", "Notify Requester"),
        ],
    },
];

/// Keywords hinting at each step type during generic synthesis.
const STEP_PATTERNS: &[(&str, &[&str])] = &[
    ("agent", &["analyze", "write", "generate", "summarize", "classify", "answer"]),
    ("condition", &["if", "when", "check", "decide", "verify", "route"]),
    ("parallel", &["parallel", "simultaneous", "all at once", "fan out"]),
    ("loop", &["each", "every", "repeat", "iterate", "for all"]),
    ("multi_agent", &["team", "crew", "debate", "collaborate", "agents"]),
];

// ---------------------------------------------------------------------------
// WorkflowAssistant
// ---------------------------------------------------------------------------

/// Template-matching workflow assistant. One shared instance is intended to
/// serve all callers.
#[derive(Debug, Default)]
pub struct WorkflowAssistant;

impl WorkflowAssistant {
    pub fn new() -> Self {
        Self
    }

    /// Synthesize a workflow definition from a freeform description.
    pub fn generate_from_description(&self, description: &str) -> WorkflowSuggestion {
        let lowered = description.to_lowercase();

        let best = TEMPLATES
            .iter()
            .map(|t| {
                let score = t
                    .keywords
                    .iter()
                    .filter(|k| lowered.contains(*k))
                    .count();
                (t, score)
            })
            .max_by_key(|(_, score)| *score);

        if let Some((template, score)) = best {
            if score >= TEMPLATE_SCORE_THRESHOLD {
                let steps = template
                    .steps
                    .iter()
                    .map(|(id, step_type, name)| self.build_step(id, step_type, name))
                    .collect();
                let mut definition = WorkflowDefinition::new(
                    slugify(template.title),
                    template.title,
                    steps,
                );
                definition.description = description.to_string();
                return WorkflowSuggestion {
                    definition,
                    template: Some(template.name.to_string()),
                    confidence: (0.5 + 0.1 * score as f64).min(0.95),
                };
            }
        }

        // Generic synthesis from step-type keywords, in description order
        let mut hits: Vec<(usize, &str)> = Vec::new();
        for (step_type, keywords) in STEP_PATTERNS {
            for keyword in *keywords {
                if let Some(pos) = lowered.find(keyword) {
                    hits.push((pos, step_type));
                    break;
                }
            }
        }
        hits.sort_by_key(|(pos, _)| *pos);

        let mut steps: Vec<WorkflowStep> = hits
            .iter()
            .enumerate()
            .map(|(i, (_, step_type))| {
                self.build_step(
                    &format!("step_{}", i + 1),
                    step_type,
                    &format!("Step {}", i + 1),
                )
            })
            .collect();
        if steps.is_empty() {
            steps.push(self.build_step("process", "agent", "Process Input"));
        }

        let mut definition =
            WorkflowDefinition::new(slugify(description), workflow_name(description), steps);
        definition.description = description.to_string();
        WorkflowSuggestion {
            definition,
            template: None,
            confidence: 0.4,
        }
    }

    /// Suggest plausible continuations for a partial workflow.
    pub fn suggest_next_steps(&self, current_steps: &[WorkflowStep]) -> Vec<StepSuggestion> {
        let mut suggestions = Vec::new();

        let Some(last) = current_steps.last() else {
            suggestions.push(StepSuggestion {
                step_type: "agent".to_string(),
                name: "Process Input".to_string(),
                description: "Process the initial input".to_string(),
                confidence: 0.9,
                reason: "Every workflow needs an initial step to process input".to_string(),
            });
            return suggestions;
        };

        match last.step_type.as_str() {
            "agent" => {
                suggestions.push(StepSuggestion {
                    step_type: "condition".to_string(),
                    name: "Validate Result".to_string(),
                    description: "Validate the agent output".to_string(),
                    confidence: 0.8,
                    reason: "Agent output is usually checked before proceeding".to_string(),
                });
                suggestions.push(StepSuggestion {
                    step_type: "agent".to_string(),
                    name: "Save Result".to_string(),
                    description: "Persist the result to an external system".to_string(),
                    confidence: 0.7,
                    reason: "Agent results frequently need to be persisted".to_string(),
                });
            }
            "condition" => {
                suggestions.push(StepSuggestion {
                    step_type: "agent".to_string(),
                    name: "Process Branch".to_string(),
                    description: "Process the selected branch".to_string(),
                    confidence: 0.85,
                    reason: "Condition branches usually lead to branch-specific work"
                        .to_string(),
                });
            }
            "parallel" => {
                suggestions.push(StepSuggestion {
                    step_type: "agent".to_string(),
                    name: "Aggregate Results".to_string(),
                    description: "Combine the parallel outputs".to_string(),
                    confidence: 0.9,
                    reason: "Parallel results need aggregation".to_string(),
                });
            }
            _ => {}
        }

        if current_steps.len() >= 3 {
            suggestions.push(StepSuggestion {
                step_type: "agent".to_string(),
                name: "Complete Workflow".to_string(),
                description: "Finalize and notify completion".to_string(),
                confidence: 0.6,
                reason: "The workflow may be ready to wrap up".to_string(),
            });
        }

        suggestions
    }

    /// Flag structural problems: duplicate ids, dangling transitions,
    /// self-loops, and missing required configs.
    pub fn detect_problems(&self, workflow: &WorkflowDefinition) -> Vec<ProblemDetection> {
        let mut problems = Vec::new();
        let steps = &workflow.steps;

        if steps.is_empty() {
            problems.push(ProblemDetection {
                severity: ProblemSeverity::Error,
                message: "workflow has no steps".to_string(),
                step_id: None,
                suggestion: None,
            });
            return problems;
        }

        let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        let unique: std::collections::HashSet<&str> = ids.iter().copied().collect();
        if unique.len() != ids.len() {
            problems.push(ProblemDetection {
                severity: ProblemSeverity::Error,
                message: "duplicate step ids found".to_string(),
                step_id: None,
                suggestion: None,
            });
        }

        for step in steps {
            if let Some(next) = &step.next_step {
                if !unique.contains(next.as_str()) {
                    problems.push(ProblemDetection {
                        severity: ProblemSeverity::Error,
                        message: format!("step references unknown next_step: {next}"),
                        step_id: Some(step.id.clone()),
                        suggestion: Some(format!(
                            "remove the reference or create step '{next}'"
                        )),
                    });
                }
                if next == &step.id {
                    problems.push(ProblemDetection {
                        severity: ProblemSeverity::Error,
                        message: "step transitions to itself".to_string(),
                        step_id: Some(step.id.clone()),
                        suggestion: Some("point next_step at another step".to_string()),
                    });
                }
            }

            match step.step_type.as_str() {
                "agent" => {
                    if !step.config.contains_key("prompt")
                        && !step.config.contains_key("agent_id")
                    {
                        problems.push(ProblemDetection {
                            severity: ProblemSeverity::Warning,
                            message: "agent step without prompt or agent_id".to_string(),
                            step_id: Some(step.id.clone()),
                            suggestion: Some(
                                "add a prompt or specify agent_id".to_string(),
                            ),
                        });
                    }
                }
                "condition" => {
                    if !step.config.contains_key("branches")
                        && !step.config.contains_key("cases")
                    {
                        problems.push(ProblemDetection {
                            severity: ProblemSeverity::Warning,
                            message: "condition step without branches".to_string(),
                            step_id: Some(step.id.clone()),
                            suggestion: Some(
                                "add branches or cases for the condition".to_string(),
                            ),
                        });
                    }
                }
                _ => {}
            }
        }

        problems
    }

    fn build_step(&self, id: &str, step_type: &str, name: &str) -> WorkflowStep {
        let mut step = WorkflowStep::new(id, step_type, name);
        if step_type == "agent" {
            step = step
                .with_config("agent_id", json!("assistant"))
                .with_config("prompt", json!(format!("{name}: ${{_last}}")));
        }
        step
    }
}

fn workflow_name(description: &str) -> String {
    let words: Vec<&str> = description.split_whitespace().take(4).collect();
    if words.is_empty() {
        "Generated Workflow".to_string()
    } else {
        words.join(" ")
    }
}

fn slugify(text: &str) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed: Vec<&str> = slug.split('-').filter(|s| !s.is_empty()).take(6).collect();
    if trimmed.is_empty() {
        "workflow".to_string()
    } else {
        trimmed.join("-")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
