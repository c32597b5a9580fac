//! Trace collection for LLM/agent executions.
//!
//! A trace is a set of spans sharing a `trace_id`; each span may point at a
//! parent span. Storage is flat -- the tree view is derived on read, with
//! dangling parents and cycles rejected. Cost and token aggregates are
//! folded in incrementally as spans finish.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Traces retained in memory.
const MAX_TRACES: usize = 10_000;

// ---------------------------------------------------------------------------
// Span model
// ---------------------------------------------------------------------------

/// Kind of work a span represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    LlmCall,
    ToolCall,
    Retrieval,
    Embedding,
    Chain,
    Agent,
}

/// Span (and trace) completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Pending,
    Running,
    Success,
    Error,
}

/// Token and cost accounting for a span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanUsage {
    #[serde(default)]
    pub tokens_input: u64,
    #[serde(default)]
    pub tokens_output: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl SpanUsage {
    pub fn tokens_total(&self) -> u64 {
        self.tokens_input + self.tokens_output
    }
}

/// A timed unit of work inside a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSpan {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub trace_id: String,
    /// `None` for root spans; otherwise must resolve within the trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    #[serde(default = "Utc::now")]
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: f64,
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    /// Point-in-time annotations.
    #[serde(default)]
    pub events: Vec<SpanEvent>,
    #[serde(default)]
    pub usage: SpanUsage,
}

/// An annotation inside a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// A complete trace: flat span list plus aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub spans: Vec<TraceSpan>,
    #[serde(default = "Utc::now")]
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_duration_ms: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
    pub status: SpanStatus,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Trace {
    /// Spans of one kind.
    pub fn spans_of(&self, kind: SpanKind) -> Vec<&TraceSpan> {
        self.spans.iter().filter(|s| s.kind == kind).collect()
    }

    /// Waterfall view: spans ordered by start, each with its offset from
    /// the trace start.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let mut spans: Vec<&TraceSpan> = self.spans.iter().collect();
        spans.sort_by_key(|s| s.start_time);
        spans
            .into_iter()
            .map(|s| TimelineEntry {
                span_id: s.id.clone(),
                name: s.name.clone(),
                kind: s.kind,
                offset_ms: (s.start_time - self.start_time).num_milliseconds().max(0) as f64,
                duration_ms: s.duration_ms,
                status: s.status,
                tokens: s.usage.tokens_total(),
            })
            .collect()
    }

    /// Derive the span tree. Fails on parents outside the trace or cycles.
    pub fn tree(&self) -> Result<Vec<SpanNode>, TraceError> {
        let ids: HashMap<&str, &TraceSpan> =
            self.spans.iter().map(|s| (s.id.as_str(), s)).collect();

        // Every parent pointer must resolve within the trace
        for span in &self.spans {
            if let Some(parent) = &span.parent_id {
                if !ids.contains_key(parent.as_str()) {
                    return Err(TraceError::DanglingParent {
                        span_id: span.id.clone(),
                        parent_id: parent.clone(),
                    });
                }
            }
        }

        // Cycle check: walk each span's ancestry
        for span in &self.spans {
            let mut seen = std::collections::HashSet::new();
            let mut current = span;
            while let Some(parent_id) = &current.parent_id {
                if !seen.insert(current.id.as_str()) {
                    return Err(TraceError::Cycle {
                        span_id: span.id.clone(),
                    });
                }
                current = ids[parent_id.as_str()];
            }
        }

        let mut children: HashMap<&str, Vec<&TraceSpan>> = HashMap::new();
        let mut roots: Vec<&TraceSpan> = Vec::new();
        for span in &self.spans {
            match &span.parent_id {
                Some(parent) => children.entry(parent.as_str()).or_default().push(span),
                None => roots.push(span),
            }
        }

        fn build(span: &TraceSpan, children: &HashMap<&str, Vec<&TraceSpan>>) -> SpanNode {
            let kids = children
                .get(span.id.as_str())
                .map(|list| list.iter().map(|s| build(s, children)).collect())
                .unwrap_or_default();
            SpanNode {
                span: span.clone(),
                children: kids,
            }
        }

        Ok(roots.into_iter().map(|r| build(r, &children)).collect())
    }
}

/// One node in the derived span tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanNode {
    pub span: TraceSpan,
    pub children: Vec<SpanNode>,
}

/// One row of the waterfall view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub span_id: String,
    pub name: String,
    pub kind: SpanKind,
    pub offset_ms: f64,
    pub duration_ms: f64,
    pub status: SpanStatus,
    pub tokens: u64,
}

/// Errors from trace operations.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace not found: {0}")]
    TraceNotFound(String),

    #[error("span not found: {0}")]
    SpanNotFound(String),

    #[error("span '{span_id}' references parent '{parent_id}' outside the trace")]
    DanglingParent { span_id: String, parent_id: String },

    #[error("span '{span_id}' participates in a parent cycle")]
    Cycle { span_id: String },
}

// ---------------------------------------------------------------------------
// TraceCollector
// ---------------------------------------------------------------------------

/// Collects traces and spans; aggregates fold in at span finish.
pub struct TraceCollector {
    traces: Mutex<TraceStore>,
}

#[derive(Default)]
struct TraceStore {
    /// Insertion-ordered trace ids for eviction.
    order: Vec<String>,
    by_id: HashMap<String, Trace>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self {
            traces: Mutex::new(TraceStore::default()),
        }
    }

    /// Begin a trace; returns its id.
    pub fn start_trace(&self, input: impl Into<String>, session_id: Option<String>) -> String {
        let trace = Trace {
            id: new_id(),
            session_id,
            spans: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            total_duration_ms: 0.0,
            total_tokens: 0,
            total_cost_usd: 0.0,
            input: input.into(),
            output: String::new(),
            status: SpanStatus::Running,
            tags: Vec::new(),
        };
        let id = trace.id.clone();

        let mut store = self.traces.lock().unwrap();
        store.order.push(id.clone());
        store.by_id.insert(id.clone(), trace);
        if store.order.len() > MAX_TRACES {
            let evicted = store.order.remove(0);
            store.by_id.remove(&evicted);
        }
        id
    }

    /// Begin a span inside a trace; returns the span id.
    pub fn start_span(
        &self,
        trace_id: &str,
        name: impl Into<String>,
        kind: SpanKind,
        parent_id: Option<String>,
    ) -> Result<String, TraceError> {
        let mut store = self.traces.lock().unwrap();
        let trace = store
            .by_id
            .get_mut(trace_id)
            .ok_or_else(|| TraceError::TraceNotFound(trace_id.to_string()))?;

        let span = TraceSpan {
            id: new_id(),
            trace_id: trace_id.to_string(),
            parent_id,
            name: name.into(),
            kind,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: 0.0,
            status: SpanStatus::Running,
            error: None,
            attributes: HashMap::new(),
            events: Vec::new(),
            usage: SpanUsage::default(),
        };
        let id = span.id.clone();
        trace.spans.push(span);
        Ok(id)
    }

    /// Finish a span, folding its usage into the trace aggregates.
    pub fn finish_span(
        &self,
        trace_id: &str,
        span_id: &str,
        status: SpanStatus,
        error: Option<String>,
        usage: SpanUsage,
    ) -> Result<(), TraceError> {
        let mut store = self.traces.lock().unwrap();
        let trace = store
            .by_id
            .get_mut(trace_id)
            .ok_or_else(|| TraceError::TraceNotFound(trace_id.to_string()))?;

        let span = trace
            .spans
            .iter_mut()
            .find(|s| s.id == span_id)
            .ok_or_else(|| TraceError::SpanNotFound(span_id.to_string()))?;

        let now = Utc::now();
        span.end_time = Some(now);
        span.duration_ms = (now - span.start_time).num_milliseconds().max(0) as f64;
        span.status = status;
        span.error = error;
        span.usage = usage;

        // Incremental aggregates
        trace.total_tokens += usage.tokens_total();
        trace.total_cost_usd += usage.cost_usd;
        Ok(())
    }

    /// Attach an annotation to a running span.
    pub fn add_span_event(
        &self,
        trace_id: &str,
        span_id: &str,
        name: impl Into<String>,
        attributes: HashMap<String, Value>,
    ) -> Result<(), TraceError> {
        let mut store = self.traces.lock().unwrap();
        let trace = store
            .by_id
            .get_mut(trace_id)
            .ok_or_else(|| TraceError::TraceNotFound(trace_id.to_string()))?;
        let span = trace
            .spans
            .iter_mut()
            .find(|s| s.id == span_id)
            .ok_or_else(|| TraceError::SpanNotFound(span_id.to_string()))?;
        span.events.push(SpanEvent {
            name: name.into(),
            timestamp: Utc::now(),
            attributes,
        });
        Ok(())
    }

    /// Finish a trace: stamp its end, duration, output, and final status
    /// (error when any span errored).
    pub fn finish_trace(
        &self,
        trace_id: &str,
        output: impl Into<String>,
    ) -> Result<Trace, TraceError> {
        let mut store = self.traces.lock().unwrap();
        let trace = store
            .by_id
            .get_mut(trace_id)
            .ok_or_else(|| TraceError::TraceNotFound(trace_id.to_string()))?;

        let now = Utc::now();
        trace.end_time = Some(now);
        trace.total_duration_ms = (now - trace.start_time).num_milliseconds().max(0) as f64;
        trace.output = output.into();
        trace.status = if trace.spans.iter().any(|s| s.status == SpanStatus::Error) {
            SpanStatus::Error
        } else {
            SpanStatus::Success
        };
        Ok(trace.clone())
    }

    pub fn get_trace(&self, trace_id: &str) -> Option<Trace> {
        self.traces.lock().unwrap().by_id.get(trace_id).cloned()
    }

    /// Most recent traces, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Trace> {
        let store = self.traces.lock().unwrap();
        store
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| store.by_id.get(id).cloned())
            .collect()
    }

    /// Aggregate cost/latency across all stored traces.
    pub fn aggregates(&self) -> TraceAggregates {
        let store = self.traces.lock().unwrap();
        let traces: Vec<&Trace> = store.by_id.values().collect();
        let finished: Vec<&&Trace> =
            traces.iter().filter(|t| t.end_time.is_some()).collect();

        let total_cost = traces.iter().map(|t| t.total_cost_usd).sum();
        let total_tokens = traces.iter().map(|t| t.total_tokens).sum();
        let avg_duration_ms = if finished.is_empty() {
            0.0
        } else {
            finished.iter().map(|t| t.total_duration_ms).sum::<f64>()
                / finished.len() as f64
        };

        TraceAggregates {
            trace_count: traces.len(),
            total_tokens,
            total_cost_usd: total_cost,
            avg_duration_ms,
        }
    }
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Cost/latency rollup across traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceAggregates {
    pub trace_count: usize,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_duration_ms: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
