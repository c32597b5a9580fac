//! Event trigger: fire workflows from matching bus events.
//!
//! Subscribes to each declared event-type pattern on the event bus; every
//! delivered event is additionally checked against an [`EventFilter`]
//! (type globs, source glob, data-field equality) before the trigger fires
//! with the event's data as workflow inputs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use skein_types::event::WorkflowEvent;
use skein_types::trigger::{TriggerConfig, TriggerKind};

use super::{Trigger, TriggerError, TriggerState};
use crate::event::{EventBus, matches_pattern};

// ---------------------------------------------------------------------------
// EventFilter
// ---------------------------------------------------------------------------

/// Declarative filter over bus events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Event-type patterns (globs); empty matches nothing at trigger level.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Glob over the event source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_pattern: Option<String>,
    /// Exact-equality conditions over top-level data fields.
    #[serde(default)]
    pub data_conditions: HashMap<String, Value>,
}

impl EventFilter {
    /// Whether the event passes every declared constraint.
    pub fn matches(&self, event: &WorkflowEvent) -> bool {
        if !self.event_types.is_empty() {
            let type_matched = self
                .event_types
                .iter()
                .any(|pattern| matches_pattern(pattern, &event.event_type));
            if !type_matched {
                return false;
            }
        }

        if let Some(source_pattern) = &self.source_pattern {
            if !matches_pattern(source_pattern, &event.source) {
                return false;
            }
        }

        for (key, expected) in &self.data_conditions {
            if event.data.get(key) != Some(expected) {
                return false;
            }
        }

        true
    }
}

// ---------------------------------------------------------------------------
// EventTrigger
// ---------------------------------------------------------------------------

/// Trigger fired by matching events on the bus.
pub struct EventTrigger {
    state: Arc<TriggerState>,
    filter: EventFilter,
    bus: EventBus,
    subscription_ids: Mutex<Vec<u64>>,
}

impl EventTrigger {
    pub fn new(config: TriggerConfig, bus: EventBus) -> Result<Self, TriggerError> {
        let filter: EventFilter = serde_json::from_value(Value::Object(config.config.clone()))
            .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            state: Arc::new(TriggerState::new(config)),
            filter,
            bus,
            subscription_ids: Mutex::new(Vec::new()),
        })
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }
}

impl Trigger for EventTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Event
    }

    fn state(&self) -> &TriggerState {
        &self.state
    }

    fn start<'a>(&'a self) -> BoxFuture<'a, Result<(), TriggerError>> {
        Box::pin(async move {
            let patterns = if self.filter.event_types.is_empty() {
                vec!["*".to_string()]
            } else {
                self.filter.event_types.clone()
            };

            let mut ids = self.subscription_ids.lock().unwrap();
            for pattern in patterns {
                let state = Arc::clone(&self.state);
                let filter = self.filter.clone();
                let id = self.bus.subscribe(
                    pattern,
                    Arc::new(move |event: WorkflowEvent| {
                        let state = Arc::clone(&state);
                        let filter = filter.clone();
                        Box::pin(async move {
                            if !state.is_active() || !filter.matches(&event) {
                                return;
                            }
                            let mut metadata = HashMap::new();
                            metadata.insert("event_id".to_string(), json!(event.id));
                            metadata
                                .insert("event_type".to_string(), json!(event.event_type));
                            metadata.insert("source".to_string(), json!(event.source));
                            state.fire(event.data, metadata).await;
                        })
                    }),
                    None,
                );
                ids.push(id);
            }

            tracing::info!(
                trigger_id = self.state.config.id.as_str(),
                patterns = ?self.filter.event_types,
                "event trigger started"
            );
            Ok(())
        })
    }

    fn stop<'a>(&'a self) -> BoxFuture<'a, Result<(), TriggerError>> {
        Box::pin(async move {
            let ids: Vec<u64> = self.subscription_ids.lock().unwrap().drain(..).collect();
            for id in ids {
                self.bus.unsubscribe(id);
            }
            tracing::info!(
                trigger_id = self.state.config.id.as_str(),
                "event trigger stopped"
            );
            Ok(())
        })
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.state.config.workflow_id.is_empty() {
            errors.push("workflow_id is required".to_string());
        }
        if self.filter.event_types.is_empty() {
            errors.push("event_types is required".to_string());
        }
        errors
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
