//! Alert engine: periodic rule evaluation and event dispatch.
//!
//! Each evaluation tick reads the metrics the rules reference (through a
//! caller-supplied reader, typically backed by the query engine), evaluates
//! every enabled, un-silenced rule, advances its state machine, and
//! delivers an `AlertEvent` synchronously to registered handlers on every
//! transition. The loop sleeps `interval` between ticks and stops on a
//! flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rules::{AlertRule, AlertSeverity, AlertState};

/// Events retained by the engine.
const MAX_EVENTS: usize = 1000;

// ---------------------------------------------------------------------------
// AlertEvent
// ---------------------------------------------------------------------------

/// A rule state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub rule_id: String,
    pub rule_name: String,
    pub state: AlertState,
    pub severity: AlertSeverity,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
    /// The metric values observed at evaluation time.
    #[serde(default)]
    pub values: HashMap<String, f64>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Synchronous event handler (channel delivery, bus forwarding, ...).
pub type AlertHandler = Arc<dyn Fn(&AlertEvent) + Send + Sync>;

/// Reads fresh values for the requested metric names.
pub type MetricReader = Arc<dyn Fn(&[String]) -> HashMap<String, f64> + Send + Sync>;

// ---------------------------------------------------------------------------
// AlertEngine
// ---------------------------------------------------------------------------

/// Holds the rule set, evaluates it, and dispatches transitions.
pub struct AlertEngine {
    rules: Mutex<HashMap<String, AlertRule>>,
    events: Mutex<Vec<AlertEvent>>,
    handlers: Mutex<Vec<AlertHandler>>,
    running: AtomicBool,
}

impl AlertEngine {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn add_rule(&self, rule: AlertRule) {
        tracing::info!(rule = rule.name.as_str(), "alert rule added");
        self.rules.lock().unwrap().insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        self.rules.lock().unwrap().remove(rule_id).is_some()
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<AlertRule> {
        self.rules.lock().unwrap().get(rule_id).cloned()
    }

    pub fn list_rules(&self) -> Vec<AlertRule> {
        self.rules.lock().unwrap().values().cloned().collect()
    }

    /// Silence a rule for a duration. Returns whether it exists.
    pub fn silence_rule(&self, rule_id: &str, duration: chrono::Duration) -> bool {
        let mut rules = self.rules.lock().unwrap();
        match rules.get_mut(rule_id) {
            Some(rule) => {
                rule.silence(duration);
                true
            }
            None => false,
        }
    }

    /// Register a synchronous transition handler.
    pub fn add_handler(&self, handler: AlertHandler) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// Evaluate one rule against fresh metric reads. Returns the event when
    /// the evaluation produced a state change.
    pub fn evaluate_rule(&self, rule_id: &str, reader: &MetricReader) -> Option<AlertEvent> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.get_mut(rule_id)?;

        if !rule.enabled || rule.is_silenced() {
            return None;
        }

        let metric_names: Vec<String> =
            rule.conditions.iter().map(|c| c.metric.clone()).collect();
        let values = reader(&metric_names);

        let is_firing = rule.evaluate(&values);
        if !rule.update_state(is_firing) {
            return None;
        }

        let event = AlertEvent {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            state: rule.state,
            severity: rule.severity,
            timestamp: Utc::now(),
            message: rule.summary.clone(),
            values,
            labels: rule.labels.clone(),
        };
        drop(rules);

        self.record_and_dispatch(event.clone());
        Some(event)
    }

    /// Evaluate every rule once. Returns the transitions produced.
    pub fn evaluate_all(&self, reader: &MetricReader) -> Vec<AlertEvent> {
        let rule_ids: Vec<String> =
            self.rules.lock().unwrap().keys().cloned().collect();
        rule_ids
            .iter()
            .filter_map(|id| self.evaluate_rule(id, reader))
            .collect()
    }

    /// Run the evaluation loop until [`AlertEngine::stop`] is called.
    pub async fn run(&self, reader: MetricReader, interval: Duration) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(interval_secs = interval.as_secs_f64(), "alert engine started");

        while self.running.load(Ordering::SeqCst) {
            let events = self.evaluate_all(&reader);
            if !events.is_empty() {
                tracing::debug!(transitions = events.len(), "alert evaluation tick");
            }
            tokio::time::sleep(interval).await;
        }

        tracing::info!("alert engine stopped");
    }

    /// Stop the evaluation loop at the next tick boundary.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Recent events, newest first, optionally filtered.
    pub fn get_events(
        &self,
        limit: usize,
        severity: Option<AlertSeverity>,
        state: Option<AlertState>,
    ) -> Vec<AlertEvent> {
        let events = self.events.lock().unwrap();
        let mut filtered: Vec<AlertEvent> = events
            .iter()
            .filter(|e| severity.is_none_or(|s| e.severity == s))
            .filter(|e| state.is_none_or(|s| e.state == s))
            .cloned()
            .collect();
        filtered.reverse();
        filtered.truncate(limit);
        filtered
    }

    /// Rules currently in the FIRING state.
    pub fn firing_rules(&self) -> Vec<AlertRule> {
        self.rules
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.state == AlertState::Firing)
            .cloned()
            .collect()
    }

    /// Counts by state and severity plus the firing set.
    pub fn summary(&self) -> AlertSummary {
        let rules = self.rules.lock().unwrap();
        let mut by_state: HashMap<AlertState, usize> = HashMap::new();
        let mut by_severity: HashMap<AlertSeverity, usize> = HashMap::new();
        for rule in rules.values() {
            *by_state.entry(rule.state).or_insert(0) += 1;
            *by_severity.entry(rule.severity).or_insert(0) += 1;
        }
        AlertSummary {
            total_rules: rules.len(),
            enabled: rules.values().filter(|r| r.enabled).count(),
            by_state,
            by_severity,
            firing: rules
                .values()
                .filter(|r| r.state == AlertState::Firing)
                .map(|r| r.name.clone())
                .collect(),
        }
    }

    fn record_and_dispatch(&self, event: AlertEvent) {
        {
            let mut events = self.events.lock().unwrap();
            events.push(event.clone());
            if events.len() > MAX_EVENTS {
                let excess = events.len() - MAX_EVENTS;
                events.drain(..excess);
            }
        }

        let handlers = self.handlers.lock().unwrap().clone();
        for handler in handlers {
            handler(&event);
        }

        tracing::info!(
            rule = event.rule_name.as_str(),
            state = ?event.state,
            severity = ?event.severity,
            "alert transition"
        );
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Rollup of the engine's rule set.
#[derive(Debug, Clone, Serialize)]
pub struct AlertSummary {
    pub total_rules: usize,
    pub enabled: usize,
    pub by_state: HashMap<AlertState, usize>,
    pub by_severity: HashMap<AlertSeverity, usize>,
    pub firing: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
