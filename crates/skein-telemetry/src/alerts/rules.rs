//! Alert rules: conditions, severity, and the rule state machine.
//!
//! A rule combines conditions over metric values with `and`/`or` logic.
//! Its state walks `OK -> PENDING -> FIRING -> RESOLVED -> OK`: PENDING
//! becomes FIRING once the conditions have held for the required number of
//! consecutive evaluation ticks; any tick with the conditions false sends a
//! pending or firing rule to RESOLVED, and the next quiet tick returns it
//! to OK. A silenced rule skips evaluation entirely.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Comparison operators for conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Gt,
    Lt,
    Eq,
    Ne,
    Gte,
    Lte,
}

/// Rule state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Ok,
    Pending,
    Firing,
    Resolved,
}

/// How multiple conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLogic {
    And,
    Or,
}

// ---------------------------------------------------------------------------
// AlertCondition
// ---------------------------------------------------------------------------

/// One threshold comparison against a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCondition {
    pub metric: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub threshold: f64,
    /// Consecutive firing evaluations required before FIRING. `None`
    /// transitions on the second firing tick (OK -> PENDING -> FIRING).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_duration: Option<u32>,
    /// Label filters forwarded to the metric read.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl AlertCondition {
    pub fn new(metric: impl Into<String>, operator: ConditionOperator, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            operator,
            threshold,
            min_duration: None,
            labels: HashMap::new(),
        }
    }

    /// Evaluate against a freshly read metric value.
    pub fn evaluate(&self, value: f64) -> bool {
        match self.operator {
            ConditionOperator::Gt => value > self.threshold,
            ConditionOperator::Lt => value < self.threshold,
            ConditionOperator::Eq => value == self.threshold,
            ConditionOperator::Ne => value != self.threshold,
            ConditionOperator::Gte => value >= self.threshold,
            ConditionOperator::Lte => value <= self.threshold,
        }
    }
}

// ---------------------------------------------------------------------------
// AlertRule
// ---------------------------------------------------------------------------

/// A rule: ordered conditions, combination logic, severity, channels, and
/// live state-machine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    #[serde(default = "default_rule_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub conditions: Vec<AlertCondition>,
    #[serde(default = "default_logic")]
    pub condition_logic: ConditionLogic,
    #[serde(default = "default_severity")]
    pub severity: AlertSeverity,
    /// Channels notified on state changes.
    #[serde(default)]
    pub channel_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silenced_until: Option<DateTime<Utc>>,
    /// Message template rendered into alert events.
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default = "default_state")]
    pub state: AlertState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluation: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state_change: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firing_since: Option<DateTime<Utc>>,
    /// Consecutive firing evaluations observed while pending.
    #[serde(default)]
    pub pending_ticks: u32,
}

fn default_rule_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_logic() -> ConditionLogic {
    ConditionLogic::And
}

fn default_severity() -> AlertSeverity {
    AlertSeverity::Warning
}

fn default_state() -> AlertState {
    AlertState::Ok
}

fn default_true() -> bool {
    true
}

impl AlertRule {
    pub fn new(name: impl Into<String>, conditions: Vec<AlertCondition>) -> Self {
        Self {
            id: default_rule_id(),
            name: name.into(),
            description: String::new(),
            conditions,
            condition_logic: ConditionLogic::And,
            severity: AlertSeverity::Warning,
            channel_ids: Vec::new(),
            enabled: true,
            silenced_until: None,
            summary: String::new(),
            labels: HashMap::new(),
            state: AlertState::Ok,
            last_evaluation: None,
            last_state_change: None,
            firing_since: None,
            pending_ticks: 0,
        }
    }

    /// Convenience rule: error rate above a threshold.
    pub fn high_error_rate(threshold: f64) -> Self {
        let mut rule = Self::new(
            "High Error Rate",
            vec![AlertCondition::new(
                "error_rate",
                ConditionOperator::Gt,
                threshold,
            )],
        );
        rule.severity = AlertSeverity::Error;
        rule.summary = format!("error rate is above {}%", threshold * 100.0);
        rule
    }

    /// Convenience rule: p95 latency above a millisecond threshold.
    pub fn high_latency(threshold_ms: f64) -> Self {
        let mut rule = Self::new(
            "High Latency",
            vec![AlertCondition::new(
                "latency_p95",
                ConditionOperator::Gt,
                threshold_ms,
            )],
        );
        rule.summary = format!("p95 latency is above {threshold_ms}ms");
        rule
    }

    /// Whether the rule is currently silenced.
    pub fn is_silenced(&self) -> bool {
        self.silenced_until
            .map(|until| Utc::now() < until)
            .unwrap_or(false)
    }

    /// Silence for a duration from now.
    pub fn silence(&mut self, duration: Duration) {
        self.silenced_until = Some(Utc::now() + duration);
    }

    pub fn unsilence(&mut self) {
        self.silenced_until = None;
    }

    /// Combine the conditions over a metric-value map. A metric missing
    /// from the map evaluates false.
    pub fn evaluate(&self, values: &HashMap<String, f64>) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        let results = self
            .conditions
            .iter()
            .map(|c| values.get(&c.metric).map(|v| c.evaluate(*v)).unwrap_or(false));
        match self.condition_logic {
            ConditionLogic::And => results.into_iter().all(|r| r),
            ConditionLogic::Or => results.into_iter().any(|r| r),
        }
    }

    /// Required consecutive firing ticks before FIRING: the largest
    /// `min_duration` across conditions, or 1 when none declares one.
    fn required_ticks(&self) -> u32 {
        self.conditions
            .iter()
            .filter_map(|c| c.min_duration)
            .max()
            .unwrap_or(1)
    }

    /// Advance the state machine for one evaluation tick.
    ///
    /// Returns whether the state changed (a transition to publish).
    pub fn update_state(&mut self, is_firing: bool) -> bool {
        let now = Utc::now();
        self.last_evaluation = Some(now);
        let old_state = self.state;

        if is_firing {
            self.pending_ticks += 1;
            match self.state {
                AlertState::Ok | AlertState::Resolved => {
                    // A resolved rule re-triggering restarts the count
                    if self.state == AlertState::Resolved {
                        self.pending_ticks = 1;
                    }
                    self.state = AlertState::Pending;
                }
                AlertState::Pending => {
                    if self.pending_ticks >= self.required_ticks() {
                        self.state = AlertState::Firing;
                        self.firing_since = Some(now);
                    }
                }
                AlertState::Firing => {}
            }
        } else {
            self.pending_ticks = 0;
            match self.state {
                AlertState::Pending | AlertState::Firing => {
                    self.state = AlertState::Resolved;
                    self.firing_since = None;
                }
                AlertState::Resolved => {
                    self.state = AlertState::Ok;
                }
                AlertState::Ok => {}
            }
        }

        if self.state != old_state {
            self.last_state_change = Some(now);
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
