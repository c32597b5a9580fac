//! Metric collector: unified registration and recording of metrics.
//!
//! A `Metric` owns a bounded point buffer; the `MetricCollector` registers
//! metrics by name, records values (with label maps), increments counters,
//! and can render the whole set in Prometheus text exposition format.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Points retained per metric.
pub const MAX_POINTS: usize = 10_000;

// ---------------------------------------------------------------------------
// Metric model
// ---------------------------------------------------------------------------

/// Kinds of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonically increasing.
    Counter,
    /// Can go up or down.
    Gauge,
    /// Distribution of observations.
    Histogram,
    /// Pre-aggregated percentiles.
    Summary,
}

/// One recorded data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A metric definition plus its bounded point buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unit: String,
    /// Declared label keys.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub points: VecDeque<MetricPoint>,
}

impl Metric {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            unit: String::new(),
            labels: Vec::new(),
            points: VecDeque::new(),
        }
    }

    /// Append a point, evicting the oldest beyond [`MAX_POINTS`].
    pub fn record(&mut self, value: f64, labels: HashMap<String, String>) {
        self.points.push_back(MetricPoint {
            timestamp: Utc::now(),
            value,
            labels,
        });
        while self.points.len() > MAX_POINTS {
            self.points.pop_front();
        }
    }

    /// Latest value, optionally restricted to points carrying all the given
    /// label pairs.
    pub fn latest(&self, labels: Option<&HashMap<String, String>>) -> Option<f64> {
        match labels {
            None => self.points.back().map(|p| p.value),
            Some(wanted) => self
                .points
                .iter()
                .rev()
                .find(|p| label_subset(wanted, &p.labels))
                .map(|p| p.value),
        }
    }

    /// Time-ordered series within an optional window and label filter.
    pub fn series(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        labels: Option<&HashMap<String, String>>,
    ) -> Vec<MetricPoint> {
        self.points
            .iter()
            .filter(|p| start.is_none_or(|s| p.timestamp >= s))
            .filter(|p| end.is_none_or(|e| p.timestamp <= e))
            .filter(|p| labels.is_none_or(|wanted| label_subset(wanted, &p.labels)))
            .cloned()
            .collect()
    }
}

fn label_subset(wanted: &HashMap<String, String>, actual: &HashMap<String, String>) -> bool {
    wanted.iter().all(|(k, v)| actual.get(k) == Some(v))
}

// ---------------------------------------------------------------------------
// MetricCollector
// ---------------------------------------------------------------------------

/// Central registry of metrics, serialized behind one mutex.
pub struct MetricCollector {
    metrics: Mutex<HashMap<String, Metric>>,
}

impl MetricCollector {
    /// Empty collector.
    pub fn new() -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Collector pre-seeded with the standard agent/system metric catalog.
    pub fn with_default_metrics() -> Self {
        let collector = Self::new();
        for (name, kind, description, unit, labels) in DEFAULT_METRICS {
            collector.register(name, *kind, description, unit, labels);
        }
        collector
    }

    /// Register a metric; re-registering an existing name is a no-op.
    pub fn register(
        &self,
        name: &str,
        kind: MetricKind,
        description: &str,
        unit: &str,
        labels: &[&str],
    ) {
        let mut metrics = self.metrics.lock().unwrap();
        metrics.entry(name.to_string()).or_insert_with(|| {
            let mut metric = Metric::new(name, kind);
            metric.description = description.to_string();
            metric.unit = unit.to_string();
            metric.labels = labels.iter().map(|l| l.to_string()).collect();
            metric
        });
    }

    /// Record a value against a registered metric. Unregistered names are
    /// dropped with a warning.
    pub fn record(&self, name: &str, value: f64, labels: HashMap<String, String>) {
        let mut metrics = self.metrics.lock().unwrap();
        match metrics.get_mut(name) {
            Some(metric) => metric.record(value, labels),
            None => tracing::warn!(metric = name, "recording to unregistered metric dropped"),
        }
    }

    /// Add `value` to a counter's latest value (per label set).
    pub fn increment(&self, name: &str, value: f64, labels: HashMap<String, String>) {
        let mut metrics = self.metrics.lock().unwrap();
        if let Some(metric) = metrics.get_mut(name) {
            if metric.kind == MetricKind::Counter {
                let current = metric.latest(Some(&labels)).unwrap_or(0.0);
                metric.record(current + value, labels);
            }
        }
    }

    /// Snapshot of a metric.
    pub fn get(&self, name: &str) -> Option<Metric> {
        self.metrics.lock().unwrap().get(name).cloned()
    }

    /// Latest value of a metric, optionally filtered by labels.
    pub fn value(&self, name: &str, labels: Option<&HashMap<String, String>>) -> Option<f64> {
        self.metrics
            .lock()
            .unwrap()
            .get(name)
            .and_then(|m| m.latest(labels))
    }

    /// Series for a metric (see [`Metric::series`]).
    pub fn series(
        &self,
        name: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        labels: Option<&HashMap<String, String>>,
    ) -> Vec<MetricPoint> {
        self.metrics
            .lock()
            .unwrap()
            .get(name)
            .map(|m| m.series(start, end, labels))
            .unwrap_or_default()
    }

    /// All registered metric names.
    pub fn names(&self) -> Vec<String> {
        self.metrics.lock().unwrap().keys().cloned().collect()
    }

    /// Render every metric in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let metrics = self.metrics.lock().unwrap();
        let mut names: Vec<&String> = metrics.keys().collect();
        names.sort();

        let mut lines = Vec::new();
        for name in names {
            let metric = &metrics[name];
            lines.push(format!("# HELP {} {}", metric.name, metric.description));
            let kind = match metric.kind {
                MetricKind::Counter => "counter",
                MetricKind::Gauge => "gauge",
                MetricKind::Histogram => "histogram",
                MetricKind::Summary => "summary",
            };
            lines.push(format!("# TYPE {} {kind}", metric.name));
            if let Some(latest) = metric.latest(None) {
                lines.push(format!("{} {latest}", metric.name));
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

impl Default for MetricCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Standard metrics every deployment starts with.
const DEFAULT_METRICS: &[(&str, MetricKind, &str, &str, &[&str])] = &[
    (
        "agent_executions_total",
        MetricKind::Counter,
        "Total agent executions",
        "",
        &["agent_name", "status"],
    ),
    (
        "agent_execution_duration_seconds",
        MetricKind::Histogram,
        "Agent execution duration",
        "seconds",
        &["agent_name"],
    ),
    (
        "agent_tokens_total",
        MetricKind::Counter,
        "Total tokens used",
        "",
        &["agent_name", "model"],
    ),
    (
        "agent_cost_usd",
        MetricKind::Counter,
        "Total cost in USD",
        "USD",
        &["agent_name", "model"],
    ),
    (
        "agent_success_rate",
        MetricKind::Gauge,
        "Agent success rate",
        "",
        &["agent_name"],
    ),
    ("active_agents", MetricKind::Gauge, "Active agents", "", &[]),
    (
        "workflow_executions_total",
        MetricKind::Counter,
        "Total workflow executions",
        "",
        &["workflow_id", "status"],
    ),
    (
        "api_requests_total",
        MetricKind::Counter,
        "Total API requests",
        "",
        &["endpoint", "method", "status"],
    ),
    (
        "api_latency_seconds",
        MetricKind::Histogram,
        "API latency",
        "seconds",
        &["endpoint"],
    ),
];

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn register_and_record() {
        let collector = MetricCollector::new();
        collector.register("requests", MetricKind::Counter, "Requests", "", &["route"]);
        collector.record("requests", 1.0, labels(&[("route", "/a")]));
        collector.record("requests", 2.0, labels(&[("route", "/b")]));

        assert_eq!(collector.value("requests", None), Some(2.0));
        assert_eq!(
            collector.value("requests", Some(&labels(&[("route", "/a")]))),
            Some(1.0)
        );
    }

    #[test]
    fn reregistering_keeps_existing_points() {
        let collector = MetricCollector::new();
        collector.register("m", MetricKind::Gauge, "first", "", &[]);
        collector.record("m", 5.0, HashMap::new());
        collector.register("m", MetricKind::Gauge, "second", "", &[]);

        let metric = collector.get("m").unwrap();
        assert_eq!(metric.description, "first");
        assert_eq!(metric.points.len(), 1);
    }

    #[test]
    fn unregistered_recording_is_dropped() {
        let collector = MetricCollector::new();
        collector.record("ghost", 1.0, HashMap::new());
        assert!(collector.get("ghost").is_none());
    }

    #[test]
    fn increment_accumulates_per_label_set() {
        let collector = MetricCollector::new();
        collector.register("hits", MetricKind::Counter, "", "", &["k"]);

        collector.increment("hits", 1.0, labels(&[("k", "a")]));
        collector.increment("hits", 1.0, labels(&[("k", "a")]));
        collector.increment("hits", 5.0, labels(&[("k", "b")]));

        assert_eq!(collector.value("hits", Some(&labels(&[("k", "a")]))), Some(2.0));
        assert_eq!(collector.value("hits", Some(&labels(&[("k", "b")]))), Some(5.0));
    }

    #[test]
    fn increment_ignores_non_counters() {
        let collector = MetricCollector::new();
        collector.register("g", MetricKind::Gauge, "", "", &[]);
        collector.increment("g", 1.0, HashMap::new());
        assert_eq!(collector.value("g", None), None);
    }

    #[test]
    fn point_buffer_is_bounded() {
        let mut metric = Metric::new("m", MetricKind::Gauge);
        for i in 0..(MAX_POINTS + 100) {
            metric.record(i as f64, HashMap::new());
        }
        assert_eq!(metric.points.len(), MAX_POINTS);
        // Oldest evicted, newest kept
        assert_eq!(metric.points.back().unwrap().value, (MAX_POINTS + 99) as f64);
    }

    #[test]
    fn series_filters_by_labels() {
        let collector = MetricCollector::new();
        collector.register("m", MetricKind::Gauge, "", "", &["env"]);
        collector.record("m", 1.0, labels(&[("env", "prod")]));
        collector.record("m", 2.0, labels(&[("env", "dev")]));
        collector.record("m", 3.0, labels(&[("env", "prod")]));

        let prod = collector.series("m", None, None, Some(&labels(&[("env", "prod")])));
        assert_eq!(prod.len(), 2);
        assert_eq!(prod[1].value, 3.0);
    }

    #[test]
    fn default_catalog_is_registered() {
        let collector = MetricCollector::with_default_metrics();
        assert!(collector.get("agent_executions_total").is_some());
        assert!(collector.get("workflow_executions_total").is_some());
        assert!(collector.names().len() >= 9);
    }

    #[test]
    fn prometheus_format_has_help_and_type_lines() {
        let collector = MetricCollector::new();
        collector.register("reqs", MetricKind::Counter, "Request count", "", &[]);
        collector.record("reqs", 7.0, HashMap::new());

        let text = collector.to_prometheus();
        assert!(text.contains("# HELP reqs Request count"));
        assert!(text.contains("# TYPE reqs counter"));
        assert!(text.contains("reqs 7"));
    }

    #[test]
    fn metric_roundtrip() {
        let mut metric = Metric::new("m", MetricKind::Histogram);
        metric.record(1.5, labels(&[("k", "v")]));
        let json = serde_json::to_string(&metric).unwrap();
        let parsed: Metric = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.points.len(), 1);
        assert_eq!(parsed.kind, MetricKind::Histogram);
    }
}
