//! Query engine: a PromQL-subset over the metric storage.
//!
//! Supported forms:
//! - bare metric with optional `{label="value", ...}` selector;
//! - optional range suffix `[Nd]` (any interval unit);
//! - unary functions `sum avg min max count rate increase delta absent
//!   histogram_quantile(q, e) label_values(e, "label")`.
//!
//! Every result carries `execution_time_ms` and `points_scanned`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::aggregator::{parse_interval, percentile};
use super::storage::{MetricStorage, StoredPoint};

// ---------------------------------------------------------------------------
// Query model
// ---------------------------------------------------------------------------

/// Time window for a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// The last `duration` (an interval string like `1h` or `7d`).
    pub fn last(duration: &str) -> Self {
        let delta = parse_interval(duration).unwrap_or(Duration::hours(1));
        let now = Utc::now();
        Self {
            start: now - delta,
            end: now,
        }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

/// Result of a query: a vector of points, a scalar, or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub execution_time_ms: f64,
    pub points_scanned: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalar: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    fn empty() -> Self {
        Self {
            data: Vec::new(),
            metric: String::new(),
            labels: HashMap::new(),
            execution_time_ms: 0.0,
            points_scanned: 0,
            scalar: None,
            error: None,
        }
    }

    fn scalar(value: f64, scanned: usize) -> Self {
        Self {
            scalar: Some(value),
            points_scanned: scanned,
            ..Self::empty()
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::empty()
        }
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct ParsedQuery {
    metric: Option<String>,
    labels: HashMap<String, String>,
    function: Option<String>,
    args: Vec<String>,
    range: Option<String>,
}

struct QueryParser {
    metric_re: Regex,
    labels_re: Regex,
    function_re: Regex,
    range_re: Regex,
}

impl QueryParser {
    fn new() -> Self {
        Self {
            metric_re: Regex::new(r"^([a-zA-Z_][a-zA-Z0-9_]*)").unwrap(),
            labels_re: Regex::new(r"\{([^}]*)\}").unwrap(),
            function_re: Regex::new(r"^(\w+)\((.*)\)$").unwrap(),
            range_re: Regex::new(r"\[(\d+[smhdwM])\]").unwrap(),
        }
    }

    fn parse(&self, query: &str) -> ParsedQuery {
        let query = query.trim();
        let mut parsed = ParsedQuery::default();

        if let Some(caps) = self.function_re.captures(query) {
            let name = caps.get(1).map(|m| m.as_str().to_string());
            let inner = caps.get(2).map(|m| m.as_str()).unwrap_or("");

            // Only treat as a function call when the name is not itself a
            // metric selector like `metric{...}` (no parens there).
            parsed.function = name;
            parsed.args = split_args(inner);
            // The metric may sit in any argument (histogram_quantile puts
            // the quantile first); take the first arg that parses to one.
            for arg in parsed.args.clone() {
                let inner_parsed = self.parse(&arg);
                if inner_parsed.metric.is_some() {
                    parsed.metric = inner_parsed.metric;
                    parsed.labels = inner_parsed.labels;
                    parsed.range = inner_parsed.range;
                    break;
                }
            }
            return parsed;
        }

        if let Some(caps) = self.metric_re.captures(query) {
            parsed.metric = Some(caps[1].to_string());
        }
        if let Some(caps) = self.labels_re.captures(query) {
            parsed.labels = parse_labels(&caps[1]);
        }
        if let Some(caps) = self.range_re.captures(query) {
            parsed.range = Some(caps[1].to_string());
        }
        parsed
    }
}

fn parse_labels(labels_str: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    for part in labels_str.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim().to_string();
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            if !key.is_empty() {
                labels.insert(key, value.to_string());
            }
        }
    }
    labels
}

/// Split function arguments on top-level commas.
fn split_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    for c in args.chars() {
        match c {
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

// ---------------------------------------------------------------------------
// QueryEngine
// ---------------------------------------------------------------------------

/// Executes queries against a metric storage handle.
pub struct QueryEngine {
    storage: Arc<MetricStorage>,
    parser: QueryParser,
}

impl QueryEngine {
    pub fn new(storage: Arc<MetricStorage>) -> Self {
        Self {
            storage,
            parser: QueryParser::new(),
        }
    }

    /// Execute a query over an optional time range (default: last hour).
    pub fn execute(&self, query: &str, time_range: Option<TimeRange>) -> QueryResult {
        let start = std::time::Instant::now();
        let mut result = self.execute_inner(query, time_range);
        result.execution_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        result
    }

    fn execute_inner(&self, query: &str, time_range: Option<TimeRange>) -> QueryResult {
        let parsed = self.parser.parse(query);

        let Some(metric) = parsed.metric.clone() else {
            return QueryResult::error("no metric specified");
        };

        // An explicit [range] suffix overrides the caller's window
        let range = match &parsed.range {
            Some(r) => TimeRange::last(r),
            None => time_range.unwrap_or_else(|| TimeRange::last("1h")),
        };

        let labels = if parsed.labels.is_empty() {
            None
        } else {
            Some(&parsed.labels)
        };
        let points =
            self.storage
                .read(&metric, Some(range.start), Some(range.end), labels, 100_000);

        match parsed.function.as_deref() {
            None => QueryResult {
                data: points
                    .iter()
                    .map(|p| {
                        json!({"timestamp": p.timestamp.to_rfc3339(), "value": p.value})
                    })
                    .collect(),
                metric,
                labels: parsed.labels,
                points_scanned: points.len(),
                ..QueryResult::empty()
            },
            Some("sum") => QueryResult::scalar(
                points.iter().map(|p| p.value).sum(),
                points.len(),
            ),
            Some("avg") => {
                if points.is_empty() {
                    QueryResult::scalar(0.0, 0)
                } else {
                    QueryResult::scalar(
                        points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64,
                        points.len(),
                    )
                }
            }
            Some("min") => QueryResult::scalar(
                points.iter().map(|p| p.value).reduce(f64::min).unwrap_or(0.0),
                points.len(),
            ),
            Some("max") => QueryResult::scalar(
                points.iter().map(|p| p.value).reduce(f64::max).unwrap_or(0.0),
                points.len(),
            ),
            Some("count") => QueryResult::scalar(points.len() as f64, points.len()),
            Some("rate") => QueryResult::scalar(rate_of(&points), points.len()),
            Some("increase") => QueryResult::scalar(
                if points.len() < 2 {
                    0.0
                } else {
                    (points[points.len() - 1].value - points[0].value).max(0.0)
                },
                points.len(),
            ),
            Some("delta") => QueryResult::scalar(
                if points.len() < 2 {
                    0.0
                } else {
                    points[points.len() - 1].value - points[0].value
                },
                points.len(),
            ),
            Some("absent") => {
                QueryResult::scalar(if points.is_empty() { 1.0 } else { 0.0 }, points.len())
            }
            Some("histogram_quantile") => {
                // First argument is the quantile, second the inner query
                let quantile = parsed
                    .args
                    .first()
                    .and_then(|a| a.parse::<f64>().ok())
                    .unwrap_or(0.95);
                // When the first arg parsed as a number, the metric actually
                // came from the second argument
                let metric_points = if parsed.args.len() >= 2 {
                    let inner = self.parser.parse(&parsed.args[1]);
                    match inner.metric {
                        Some(m) => self.storage.read(
                            &m,
                            Some(range.start),
                            Some(range.end),
                            None,
                            100_000,
                        ),
                        None => points,
                    }
                } else {
                    points
                };
                let values: Vec<f64> = metric_points.iter().map(|p| p.value).collect();
                QueryResult::scalar(percentile(&values, quantile * 100.0), values.len())
            }
            Some("label_values") => {
                let label_key = parsed
                    .args
                    .get(1)
                    .map(|a| a.trim_matches(|c| c == '"' || c == '\'').to_string())
                    .unwrap_or_default();
                let mut values: Vec<String> = points
                    .iter()
                    .filter_map(|p| p.labels.get(&label_key).cloned())
                    .collect::<std::collections::HashSet<_>>()
                    .into_iter()
                    .collect();
                values.sort();
                QueryResult {
                    data: values.into_iter().map(Value::String).collect(),
                    metric,
                    points_scanned: points.len(),
                    ..QueryResult::empty()
                }
            }
            Some(other) => QueryResult::error(format!("unknown function: {other}")),
        }
    }
}

fn rate_of(points: &[StoredPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let first = &points[0];
    let last = &points[points.len() - 1];
    let seconds = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;
    if seconds > 0.0 {
        (last.value - first.value) / seconds
    } else {
        0.0
    }
}

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

    fn engine_with_data() -> QueryEngine {
        let storage = Arc::new(MetricStorage::new());
        let now = Utc::now();
        for (offset, value, route) in [
            (50, 10.0, "/a"),
            (40, 20.0, "/a"),
            (30, 30.0, "/b"),
            (20, 40.0, "/b"),
            (10, 50.0, "/a"),
        ] {
            storage.write(
                "requests_total",
                value,
                Some(now - Duration::minutes(offset)),
                labels(&[("route", route)]),
            );
        }
        QueryEngine::new(storage)
    }

    // -------------------------------------------------------------------
    // Parsing
    // -------------------------------------------------------------------

    #[test]
    fn parses_bare_metric() {
        let parser = QueryParser::new();
        let parsed = parser.parse("requests_total");
        assert_eq!(parsed.metric.as_deref(), Some("requests_total"));
        assert!(parsed.function.is_none());
    }

    #[test]
    fn parses_label_selector() {
        let parser = QueryParser::new();
        let parsed = parser.parse(r#"requests_total{route="/a", method="GET"}"#);
        assert_eq!(parsed.labels["route"], "/a");
        assert_eq!(parsed.labels["method"], "GET");
    }

    #[test]
    fn parses_function_and_range() {
        let parser = QueryParser::new();
        let parsed = parser.parse("sum(requests_total[7d])");
        assert_eq!(parsed.function.as_deref(), Some("sum"));
        assert_eq!(parsed.metric.as_deref(), Some("requests_total"));
        assert_eq!(parsed.range.as_deref(), Some("7d"));
    }

    #[test]
    fn parses_two_argument_functions() {
        let parser = QueryParser::new();
        let parsed = parser.parse(r#"histogram_quantile(0.95, latency_seconds)"#);
        assert_eq!(parsed.function.as_deref(), Some("histogram_quantile"));
        assert_eq!(parsed.args.len(), 2);
    }

    // -------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------

    #[test]
    fn bare_metric_returns_vector() {
        let engine = engine_with_data();
        let result = engine.execute("requests_total", None);
        assert!(result.error.is_none());
        assert_eq!(result.data.len(), 5);
        assert_eq!(result.points_scanned, 5);
        assert!(result.execution_time_ms >= 0.0);
    }

    #[test]
    fn label_selector_restricts_points() {
        let engine = engine_with_data();
        let result = engine.execute(r#"requests_total{route="/a"}"#, None);
        assert_eq!(result.data.len(), 3);
    }

    #[test]
    fn sum_and_avg() {
        let engine = engine_with_data();
        assert_eq!(
            engine.execute("sum(requests_total)", None).scalar,
            Some(150.0)
        );
        assert_eq!(
            engine.execute("avg(requests_total)", None).scalar,
            Some(30.0)
        );
    }

    #[test]
    fn min_max_count() {
        let engine = engine_with_data();
        assert_eq!(engine.execute("min(requests_total)", None).scalar, Some(10.0));
        assert_eq!(engine.execute("max(requests_total)", None).scalar, Some(50.0));
        assert_eq!(engine.execute("count(requests_total)", None).scalar, Some(5.0));
    }

    #[test]
    fn sum_on_empty_storage_is_zero_with_zero_scanned() {
        let engine = QueryEngine::new(Arc::new(MetricStorage::new()));
        let result = engine.execute("sum(anything)", None);
        assert_eq!(result.scalar, Some(0.0));
        assert_eq!(result.points_scanned, 0);
        assert!(result.error.is_none());
    }

    #[test]
    fn rate_delta_increase() {
        let engine = engine_with_data();
        // 10 -> 50 over 40 minutes = 40 / 2400s
        let rate = engine.execute("rate(requests_total)", None).scalar.unwrap();
        assert!((rate - 40.0 / 2400.0).abs() < 1e-9);
        assert_eq!(engine.execute("delta(requests_total)", None).scalar, Some(40.0));
        assert_eq!(
            engine.execute("increase(requests_total)", None).scalar,
            Some(40.0)
        );
    }

    #[test]
    fn absent_flags_missing_metrics() {
        let engine = engine_with_data();
        assert_eq!(engine.execute("absent(requests_total)", None).scalar, Some(0.0));
        assert_eq!(engine.execute("absent(nothing_here)", None).scalar, Some(1.0));
    }

    #[test]
    fn histogram_quantile_over_values() {
        let storage = Arc::new(MetricStorage::new());
        let now = Utc::now();
        for i in 1..=100 {
            storage.write(
                "latency_ms",
                i as f64,
                Some(now - Duration::seconds(100 - i)),
                HashMap::new(),
            );
        }
        let engine = QueryEngine::new(storage);
        let result = engine.execute("histogram_quantile(0.95, latency_ms)", None);
        assert_eq!(result.scalar, Some(96.0));
    }

    #[test]
    fn label_values_lists_unique_sorted() {
        let engine = engine_with_data();
        let result = engine.execute(r#"label_values(requests_total, "route")"#, None);
        assert_eq!(result.data, vec![json!("/a"), json!("/b")]);
    }

    #[test]
    fn missing_metric_is_an_error() {
        let engine = engine_with_data();
        let result = engine.execute("{}", None);
        assert!(result.error.is_some());
    }

    #[test]
    fn unknown_function_is_an_error() {
        let engine = engine_with_data();
        let result = engine.execute("frobnicate(requests_total)", None);
        assert!(result.error.unwrap().contains("unknown function"));
    }

    #[test]
    fn range_suffix_restricts_window() {
        let storage = Arc::new(MetricStorage::new());
        let now = Utc::now();
        storage.write("m", 1.0, Some(now - Duration::minutes(30)), HashMap::new());
        storage.write("m", 2.0, Some(now - Duration::minutes(2)), HashMap::new());
        let engine = QueryEngine::new(storage);

        let result = engine.execute("count(m[5m])", None);
        assert_eq!(result.scalar, Some(1.0));
    }
}
