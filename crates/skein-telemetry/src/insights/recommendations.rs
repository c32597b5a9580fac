//! Rule-based recommendations derived from observed metrics.
//!
//! Each rule is a predicate over a metric snapshot plus a typed message;
//! matched rules become recommendations with priority derived from the
//! metric magnitudes. Recommendations carry per-item dismissal and
//! implementation flags.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// What a recommendation is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Optimization,
    CostSaving,
    Reliability,
    Scaling,
    Configuration,
}

/// Urgency derived from the triggering metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// One actionable recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    pub kind: RecommendationKind,
    pub priority: RecommendationPriority,
    pub title: String,
    pub description: String,
    pub action: String,
    pub expected_impact: String,
    #[serde(default)]
    pub related_metrics: Vec<String>,
    #[serde(default)]
    pub dismissed: bool,
    #[serde(default)]
    pub implemented: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

type Predicate = fn(&HashMap<String, f64>) -> bool;
type PriorityFn = fn(&HashMap<String, f64>) -> RecommendationPriority;

struct Rule {
    id: &'static str,
    kind: RecommendationKind,
    predicate: Predicate,
    priority: PriorityFn,
    title: &'static str,
    description: &'static str,
    action: &'static str,
    impact: &'static str,
    related: &'static [&'static str],
}

fn metric(snapshot: &HashMap<String, f64>, name: &str) -> f64 {
    snapshot.get(name).copied().unwrap_or(0.0)
}

const RULES: &[Rule] = &[
    Rule {
        id: "high_cost_per_request",
        kind: RecommendationKind::CostSaving,
        predicate: |m| metric(m, "avg_cost_per_request") > 0.05,
        priority: |m| {
            if metric(m, "avg_cost_per_request") > 0.25 {
                RecommendationPriority::High
            } else {
                RecommendationPriority::Medium
            }
        },
        title: "Consider a more cost-effective model",
        description: "Average cost per request is high; simpler tasks can run on a cheaper model.",
        action: "Review model selection per use case",
        impact: "Could reduce costs by 50-80%",
        related: &["avg_cost_per_request"],
    },
    Rule {
        id: "inactive_agents",
        kind: RecommendationKind::CostSaving,
        predicate: |m| metric(m, "inactive_agents") > 3.0,
        priority: |_| RecommendationPriority::Low,
        title: "Remove or consolidate inactive agents",
        description: "Several agents have not run recently.",
        action: "Review and remove unused agents",
        impact: "Less maintenance overhead",
        related: &["inactive_agents"],
    },
    Rule {
        id: "high_latency",
        kind: RecommendationKind::Optimization,
        predicate: |m| metric(m, "p95_latency_ms") > 5000.0,
        priority: |m| {
            if metric(m, "p95_latency_ms") > 15000.0 {
                RecommendationPriority::Critical
            } else {
                RecommendationPriority::High
            }
        },
        title: "Optimize high-latency requests",
        description: "P95 latency is above 5 seconds.",
        action: "Profile slow requests; add caching",
        impact: "Shorter waits for every caller",
        related: &["p95_latency_ms"],
    },
    Rule {
        id: "low_cache_hit_rate",
        kind: RecommendationKind::Optimization,
        predicate: |m| {
            m.contains_key("cache_hit_rate") && metric(m, "cache_hit_rate") < 0.3
        },
        priority: |_| RecommendationPriority::Medium,
        title: "Improve cache hit rate",
        description: "Most responses are recomputed.",
        action: "Enable response caching",
        impact: "Reduce latency and cost by 30-50%",
        related: &["cache_hit_rate"],
    },
    Rule {
        id: "high_error_rate",
        kind: RecommendationKind::Reliability,
        predicate: |m| metric(m, "error_rate") > 0.05,
        priority: |m| {
            if metric(m, "error_rate") > 0.2 {
                RecommendationPriority::Critical
            } else {
                RecommendationPriority::High
            }
        },
        title: "Address high error rate",
        description: "More than 5% of requests fail.",
        action: "Analyze error patterns; add retries",
        impact: "Higher success rate",
        related: &["error_rate"],
    },
    Rule {
        id: "rate_limit_pressure",
        kind: RecommendationKind::Scaling,
        predicate: |m| metric(m, "rate_limit_usage") > 0.8,
        priority: |m| {
            if metric(m, "rate_limit_usage") > 0.95 {
                RecommendationPriority::Critical
            } else {
                RecommendationPriority::High
            }
        },
        title: "Rate limit approaching",
        description: "Usage exceeds 80% of the provider rate limit.",
        action: "Request a higher limit or queue requests",
        impact: "Avoid throttling",
        related: &["rate_limit_usage"],
    },
];

// ---------------------------------------------------------------------------
// RecommendationEngine
// ---------------------------------------------------------------------------

/// Evaluates the rule set against metric snapshots and tracks per-item
/// dismissal/implementation state across evaluations.
pub struct RecommendationEngine {
    items: Mutex<HashMap<String, Recommendation>>,
}

impl RecommendationEngine {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate every rule against the snapshot. Matching rules produce
    /// (or refresh) recommendations; dismissed items stay dismissed.
    pub fn analyze(&self, metrics: &HashMap<String, f64>) -> Vec<Recommendation> {
        let mut items = self.items.lock().unwrap();
        let mut matched = Vec::new();

        for rule in RULES {
            if !(rule.predicate)(metrics) {
                continue;
            }

            let recommendation = items
                .entry(rule.id.to_string())
                .or_insert_with(|| Recommendation {
                    id: rule.id.to_string(),
                    kind: rule.kind,
                    priority: (rule.priority)(metrics),
                    title: rule.title.to_string(),
                    description: rule.description.to_string(),
                    action: rule.action.to_string(),
                    expected_impact: rule.impact.to_string(),
                    related_metrics: rule.related.iter().map(|m| m.to_string()).collect(),
                    dismissed: false,
                    implemented: false,
                    created_at: Utc::now(),
                });
            // Priority tracks the latest observation
            recommendation.priority = (rule.priority)(metrics);
            matched.push(recommendation.clone());
        }

        matched.sort_by(|a, b| b.priority.cmp(&a.priority));
        matched
    }

    /// Active (neither dismissed nor implemented) recommendations.
    pub fn active(&self) -> Vec<Recommendation> {
        let items = self.items.lock().unwrap();
        let mut active: Vec<Recommendation> = items
            .values()
            .filter(|r| !r.dismissed && !r.implemented)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.priority.cmp(&a.priority));
        active
    }

    /// Mark a recommendation dismissed. Returns whether it exists.
    pub fn dismiss(&self, id: &str) -> bool {
        let mut items = self.items.lock().unwrap();
        match items.get_mut(id) {
            Some(r) => {
                r.dismissed = true;
                true
            }
            None => false,
        }
    }

    /// Mark a recommendation implemented. Returns whether it exists.
    pub fn mark_implemented(&self, id: &str) -> bool {
        let mut items = self.items.lock().unwrap();
        match items.get_mut(id) {
            Some(r) => {
                r.implemented = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Recommendation> {
        self.items.lock().unwrap().get(id).cloned()
    }
}

impl Default for RecommendationEngine {
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

    fn snapshot(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn healthy_metrics_produce_no_recommendations() {
        let engine = RecommendationEngine::new();
        let recs = engine.analyze(&snapshot(&[
            ("avg_cost_per_request", 0.001),
            ("p95_latency_ms", 200.0),
            ("error_rate", 0.001),
            ("cache_hit_rate", 0.9),
            ("rate_limit_usage", 0.1),
        ]));
        assert!(recs.is_empty());
    }

    #[test]
    fn high_error_rate_is_flagged() {
        let engine = RecommendationEngine::new();
        let recs = engine.analyze(&snapshot(&[("error_rate", 0.08)]));
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].id, "high_error_rate");
        assert_eq!(recs[0].kind, RecommendationKind::Reliability);
        assert_eq!(recs[0].priority, RecommendationPriority::High);
    }

    #[test]
    fn priority_scales_with_magnitude() {
        let engine = RecommendationEngine::new();
        let recs = engine.analyze(&snapshot(&[("error_rate", 0.5)]));
        assert_eq!(recs[0].priority, RecommendationPriority::Critical);

        // A later, calmer snapshot lowers the priority on the same item
        let recs = engine.analyze(&snapshot(&[("error_rate", 0.06)]));
        assert_eq!(recs[0].priority, RecommendationPriority::High);
    }

    #[test]
    fn multiple_rules_sorted_by_priority() {
        let engine = RecommendationEngine::new();
        let recs = engine.analyze(&snapshot(&[
            ("error_rate", 0.5),       // critical
            ("inactive_agents", 5.0),  // low
            ("p95_latency_ms", 6000.0), // high
        ]));
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].priority, RecommendationPriority::Critical);
        assert_eq!(recs[2].priority, RecommendationPriority::Low);
    }

    #[test]
    fn missing_cache_metric_does_not_trigger_cache_rule() {
        let engine = RecommendationEngine::new();
        let recs = engine.analyze(&snapshot(&[("error_rate", 0.5)]));
        assert!(recs.iter().all(|r| r.id != "low_cache_hit_rate"));

        let recs = engine.analyze(&snapshot(&[("cache_hit_rate", 0.1)]));
        assert!(recs.iter().any(|r| r.id == "low_cache_hit_rate"));
    }

    #[test]
    fn dismissal_is_sticky_across_evaluations() {
        let engine = RecommendationEngine::new();
        engine.analyze(&snapshot(&[("error_rate", 0.08)]));
        assert!(engine.dismiss("high_error_rate"));

        // The rule still matches, but the item stays dismissed
        engine.analyze(&snapshot(&[("error_rate", 0.09)]));
        assert!(engine.get("high_error_rate").unwrap().dismissed);
        assert!(engine.active().is_empty());
    }

    #[test]
    fn implemented_items_leave_the_active_list() {
        let engine = RecommendationEngine::new();
        engine.analyze(&snapshot(&[("error_rate", 0.08), ("rate_limit_usage", 0.9)]));
        assert_eq!(engine.active().len(), 2);

        engine.mark_implemented("high_error_rate");
        let active = engine.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "rate_limit_pressure");
    }

    #[test]
    fn unknown_ids_are_reported() {
        let engine = RecommendationEngine::new();
        assert!(!engine.dismiss("nope"));
        assert!(!engine.mark_implemented("nope"));
        assert!(engine.get("nope").is_none());
    }

    #[test]
    fn recommendation_roundtrip() {
        let engine = RecommendationEngine::new();
        let recs = engine.analyze(&snapshot(&[("error_rate", 0.08)]));
        let json = serde_json::to_string(&recs[0]).unwrap();
        let parsed: Recommendation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, recs[0]);
    }
}
