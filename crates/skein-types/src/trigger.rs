//! Trigger configuration and result types.
//!
//! A trigger is an external source that initiates workflow executions. The
//! concrete trigger implementations (webhook, schedule, event, file watch)
//! live in `skein-core`; this module holds the serializable configuration and
//! the result record every firing produces.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kinds of trigger sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Schedule,
    Event,
    FileWatch,
    ApiPoll,
}

/// Lifecycle status of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Active,
    Paused,
    Disabled,
    Error,
}

/// Configuration shared by all triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Trigger ID; generated if not provided.
    #[serde(default = "default_trigger_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// The workflow this trigger launches.
    pub workflow_id: String,
    pub trigger_kind: TriggerKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Kind-specific configuration payload.
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_trigger_id() -> String {
    format!("trigger_{}", &Uuid::new_v4().simple().to_string()[..8])
}

fn default_true() -> bool {
    true
}

impl TriggerConfig {
    /// Create a config for the given workflow and kind.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        workflow_id: impl Into<String>,
        trigger_kind: TriggerKind,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            workflow_id: workflow_id.into(),
            trigger_kind,
            enabled: true,
            config: serde_json::Map::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Builder-style kind-specific config entry.
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

/// Record of a single trigger firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerResult {
    pub trigger_id: String,
    pub workflow_id: String,
    #[serde(default = "Utc::now")]
    pub triggered_at: DateTime<Utc>,
    /// Inputs passed to the workflow execution.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// The execution the firing dispatched, when one was started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TriggerResult {
    /// A successful firing with the given inputs.
    pub fn fired(
        trigger_id: impl Into<String>,
        workflow_id: impl Into<String>,
        inputs: HashMap<String, Value>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            workflow_id: workflow_id.into(),
            triggered_at: Utc::now(),
            inputs,
            metadata,
            execution_id: None,
            success: true,
            error: None,
        }
    }

    /// A rejected firing with a distinct error message.
    pub fn rejected(
        trigger_id: impl Into<String>,
        workflow_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            workflow_id: workflow_id.into(),
            triggered_at: Utc::now(),
            inputs: HashMap::new(),
            metadata: HashMap::new(),
            execution_id: None,
            success: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trigger_config_roundtrip() {
        let config = TriggerConfig::new("github-push", "GitHub Push", "deploy", TriggerKind::Webhook)
            .with_config("path", json!("github-push"))
            .with_config("require_signature", json!(true));

        let json_str = serde_json::to_string(&config).unwrap();
        let parsed: TriggerConfig = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, config);
        assert!(json_str.contains("\"trigger_kind\":\"webhook\""));
    }

    #[test]
    fn default_trigger_id_is_generated() {
        let config: TriggerConfig = serde_json::from_value(json!({
            "workflow_id": "wf",
            "trigger_kind": "manual",
        }))
        .unwrap();
        assert!(config.id.starts_with("trigger_"));
        assert!(config.enabled);
    }

    #[test]
    fn trigger_result_rejected_carries_error() {
        let result = TriggerResult::rejected("t1", "wf", "Invalid signature");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Invalid signature"));
        assert!(result.execution_id.is_none());
    }

    #[test]
    fn trigger_result_roundtrip() {
        let mut inputs = HashMap::new();
        inputs.insert("branch".to_string(), json!("main"));
        let result = TriggerResult::fired("t1", "wf", inputs, HashMap::new());

        let json_str = serde_json::to_string(&result).unwrap();
        let parsed: TriggerResult = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, result);
    }

    #[test]
    fn trigger_kind_snake_case() {
        assert_eq!(
            serde_json::to_string(&TriggerKind::FileWatch).unwrap(),
            "\"file_watch\""
        );
        assert_eq!(
            serde_json::to_string(&TriggerKind::ApiPoll).unwrap(),
            "\"api_poll\""
        );
    }
}
