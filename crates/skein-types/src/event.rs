//! The event envelope exchanged on the Skein event bus.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A typed event flowing through the bus.
///
/// `event_type` is dot-separated (`workflow.completed`, `user.created`) so
/// subscribers can match on prefixes (`workflow.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    #[serde(default = "default_event_id")]
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub source: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_event_id() -> String {
    format!("evt_{}", Uuid::new_v4().simple())
}

impl WorkflowEvent {
    /// Create an event of the given type with data.
    pub fn new(event_type: impl Into<String>, data: HashMap<String, Value>) -> Self {
        Self {
            id: default_event_id(),
            event_type: event_type.into(),
            data,
            source: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Builder-style source attribution.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// Well-known event types emitted by the platform itself.
pub mod system_events {
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";

    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";

    pub const AGENT_INVOKED: &str = "agent.invoked";
    pub const AGENT_RESPONSE: &str = "agent.response";

    pub const ALERT_STATE_CHANGED: &str = "alert.state_changed";

    pub const SYSTEM_ERROR: &str = "system.error";
    pub const SYSTEM_WARNING: &str = "system.warning";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_roundtrip() {
        let mut data = HashMap::new();
        data.insert("user_id".to_string(), json!("123"));
        let event = WorkflowEvent::new("user.created", data).with_source("api");

        let json_str = serde_json::to_string(&event).unwrap();
        let parsed: WorkflowEvent = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn event_id_is_generated_when_missing() {
        let event: WorkflowEvent = serde_json::from_value(json!({
            "event_type": "user.created",
        }))
        .unwrap();
        assert!(event.id.starts_with("evt_"));
        assert!(event.data.is_empty());
    }
}
