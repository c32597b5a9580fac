//! Execution replay: a linear, steppable view derived from a trace.
//!
//! Each LLM span becomes a (REQUEST, RESPONSE) pair splitting its duration
//! equally; tool spans become (CALL, RESULT) pairs; other spans become a
//! single step typed by their kind. The replay keeps a cursor with
//! next/previous/jump navigation and progress reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::collector::{SpanKind, Trace};

// ---------------------------------------------------------------------------
// Replay model
// ---------------------------------------------------------------------------

/// Kind of a derived replay step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStepKind {
    Input,
    LlmRequest,
    LlmResponse,
    ToolCall,
    ToolResult,
    Retrieval,
    Embedding,
    Chain,
    Agent,
    Output,
    Error,
}

/// One step of the derived timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayStep {
    pub id: String,
    pub index: usize,
    pub kind: ReplayStepKind,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: f64,
    pub title: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

/// A steppable replay of one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReplay {
    pub id: String,
    pub trace_id: String,
    pub steps: Vec<ReplayStep>,
    pub current_step: usize,
    pub total_duration_ms: f64,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
}

impl ExecutionReplay {
    /// Derive a replay from a trace.
    ///
    /// Steps are ordered by span start time, bracketed by INPUT and OUTPUT
    /// steps; errored spans contribute a trailing ERROR step.
    pub fn from_trace(trace: &Trace) -> Self {
        let mut steps: Vec<ReplayStep> = Vec::new();
        let push = |kind: ReplayStepKind,
                        title: String,
                        content: Value,
                        timestamp: DateTime<Utc>,
                        duration_ms: f64,
                        span_id: Option<String>,
                        steps: &mut Vec<ReplayStep>| {
            steps.push(ReplayStep {
                id: format!("step_{}", steps.len()),
                index: steps.len(),
                kind,
                timestamp,
                duration_ms,
                title,
                content,
                span_id,
            });
        };

        push(
            ReplayStepKind::Input,
            "Input".to_string(),
            json!(trace.input),
            trace.start_time,
            0.0,
            None,
            &mut steps,
        );

        let mut spans: Vec<_> = trace.spans.iter().collect();
        spans.sort_by_key(|s| s.start_time);

        for span in spans {
            let half = span.duration_ms / 2.0;
            match span.kind {
                SpanKind::LlmCall => {
                    push(
                        ReplayStepKind::LlmRequest,
                        format!("{} (request)", span.name),
                        json!({"tokens_input": span.usage.tokens_input}),
                        span.start_time,
                        half,
                        Some(span.id.clone()),
                        &mut steps,
                    );
                    push(
                        ReplayStepKind::LlmResponse,
                        format!("{} (response)", span.name),
                        json!({
                            "tokens_output": span.usage.tokens_output,
                            "cost_usd": span.usage.cost_usd,
                        }),
                        span.start_time,
                        half,
                        Some(span.id.clone()),
                        &mut steps,
                    );
                }
                SpanKind::ToolCall => {
                    push(
                        ReplayStepKind::ToolCall,
                        format!("{} (call)", span.name),
                        json!(span.attributes),
                        span.start_time,
                        half,
                        Some(span.id.clone()),
                        &mut steps,
                    );
                    push(
                        ReplayStepKind::ToolResult,
                        format!("{} (result)", span.name),
                        json!({"status": span.status}),
                        span.start_time,
                        half,
                        Some(span.id.clone()),
                        &mut steps,
                    );
                }
                other => {
                    let kind = match other {
                        SpanKind::Retrieval => ReplayStepKind::Retrieval,
                        SpanKind::Embedding => ReplayStepKind::Embedding,
                        SpanKind::Chain => ReplayStepKind::Chain,
                        _ => ReplayStepKind::Agent,
                    };
                    push(
                        kind,
                        span.name.clone(),
                        json!(span.attributes),
                        span.start_time,
                        span.duration_ms,
                        Some(span.id.clone()),
                        &mut steps,
                    );
                }
            }

            if let Some(error) = &span.error {
                push(
                    ReplayStepKind::Error,
                    format!("{} failed", span.name),
                    json!(error),
                    span.end_time.unwrap_or(span.start_time),
                    0.0,
                    Some(span.id.clone()),
                    &mut steps,
                );
            }
        }

        push(
            ReplayStepKind::Output,
            "Output".to_string(),
            json!(trace.output),
            trace.end_time.unwrap_or(trace.start_time),
            0.0,
            None,
            &mut steps,
        );

        let total_duration_ms = steps.iter().map(|s| s.duration_ms).sum();
        Self {
            id: format!("replay_{}", trace.id),
            trace_id: trace.id.clone(),
            steps,
            current_step: 0,
            total_duration_ms,
            input: trace.input.clone(),
            output: trace.output.clone(),
        }
    }

    pub fn step(&self, index: usize) -> Option<&ReplayStep> {
        self.steps.get(index)
    }

    /// Advance the cursor; `None` at the end.
    pub fn next_step(&mut self) -> Option<&ReplayStep> {
        if self.current_step + 1 < self.steps.len() {
            self.current_step += 1;
            self.steps.get(self.current_step)
        } else {
            None
        }
    }

    /// Move the cursor back; `None` at the start.
    pub fn previous_step(&mut self) -> Option<&ReplayStep> {
        if self.current_step > 0 {
            self.current_step -= 1;
            self.steps.get(self.current_step)
        } else {
            None
        }
    }

    /// Jump to an index; `None` when out of range.
    pub fn go_to_step(&mut self, index: usize) -> Option<&ReplayStep> {
        if index < self.steps.len() {
            self.current_step = index;
            self.steps.get(index)
        } else {
            None
        }
    }

    /// Reset the cursor to the start.
    pub fn reset(&mut self) {
        self.current_step = 0;
    }

    /// Cursor progress in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.steps.len() <= 1 {
            return 0.0;
        }
        self.current_step as f64 / (self.steps.len() - 1) as f64
    }

    /// Duration covered up to and including the cursor.
    pub fn elapsed_ms(&self) -> f64 {
        self.steps
            .iter()
            .take(self.current_step + 1)
            .map(|s| s.duration_ms)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
