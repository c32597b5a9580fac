//! Workflow triggers: external sources that initiate executions.
//!
//! Every trigger shares a [`TriggerState`] (config, lifecycle status, firing
//! history, dispatch callback) and implements [`Trigger`] for its
//! kind-specific start/stop behavior. Firing a trigger invokes the dispatch
//! callback -- typically a closure that runs the workflow engine -- and
//! records the resulting [`TriggerResult`].

pub mod event;
pub mod file_watch;
pub mod schedule;
pub mod webhook;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde_json::Value;

use skein_types::trigger::{TriggerConfig, TriggerKind, TriggerResult, TriggerStatus};

/// Firing records kept per trigger.
pub const MAX_TRIGGER_HISTORY: usize = 1000;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from trigger operations.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// The trigger configuration is invalid.
    #[error("invalid trigger config: {0}")]
    InvalidConfig(String),

    /// The trigger could not be started.
    #[error("trigger start failed: {0}")]
    StartFailed(String),
}

// ---------------------------------------------------------------------------
// Dispatch callback
// ---------------------------------------------------------------------------

/// Invoked when a trigger fires: receives the firing record and returns the
/// dispatched execution id (or an error message).
pub type TriggerCallback =
    Arc<dyn Fn(TriggerResult) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

// ---------------------------------------------------------------------------
// TriggerState
// ---------------------------------------------------------------------------

/// Shared lifecycle state for all trigger kinds.
pub struct TriggerState {
    pub config: TriggerConfig,
    status: Mutex<TriggerStatus>,
    history: Mutex<Vec<TriggerResult>>,
    callback: Mutex<Option<TriggerCallback>>,
}

impl TriggerState {
    pub fn new(config: TriggerConfig) -> Self {
        let status = if config.enabled {
            TriggerStatus::Active
        } else {
            TriggerStatus::Disabled
        };
        Self {
            config,
            status: Mutex::new(status),
            history: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
        }
    }

    pub fn status(&self) -> TriggerStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.status() == TriggerStatus::Active
    }

    /// Set the dispatch callback invoked on each firing.
    pub fn set_callback(&self, callback: TriggerCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    pub fn pause(&self) {
        *self.status.lock().unwrap() = TriggerStatus::Paused;
    }

    pub fn resume(&self) {
        if self.config.enabled {
            *self.status.lock().unwrap() = TriggerStatus::Active;
        }
    }

    pub fn disable(&self) {
        *self.status.lock().unwrap() = TriggerStatus::Disabled;
    }

    pub fn enable(&self) {
        *self.status.lock().unwrap() = TriggerStatus::Active;
    }

    /// The most recent firings, oldest first.
    pub fn get_history(&self, limit: usize) -> Vec<TriggerResult> {
        let history = self.history.lock().unwrap();
        let skip = history.len().saturating_sub(limit);
        history[skip..].to_vec()
    }

    /// Fire the trigger with the given inputs and metadata.
    ///
    /// Invokes the dispatch callback (when set) and records the result in
    /// the bounded history.
    pub async fn fire(
        &self,
        inputs: HashMap<String, Value>,
        metadata: HashMap<String, Value>,
    ) -> TriggerResult {
        let mut result = TriggerResult::fired(
            self.config.id.clone(),
            self.config.workflow_id.clone(),
            inputs,
            metadata,
        );

        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            match callback(result.clone()).await {
                Ok(execution_id) => {
                    result.execution_id = Some(execution_id);
                }
                Err(error) => {
                    result.success = false;
                    result.error = Some(error);
                }
            }
        }

        self.record(result.clone());
        result
    }

    /// Record a firing result (also used for rejected firings that never
    /// reach the callback).
    pub fn record(&self, result: TriggerResult) {
        let mut history = self.history.lock().unwrap();
        history.push(result);
        if history.len() > MAX_TRIGGER_HISTORY {
            let excess = history.len() - MAX_TRIGGER_HISTORY;
            history.drain(..excess);
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger trait
// ---------------------------------------------------------------------------

/// A workflow trigger.
///
/// `start`/`stop` manage the kind-specific listener (HTTP route, cron loop,
/// bus subscription, file watcher); the lifecycle toggles and history are
/// provided through the shared state.
pub trait Trigger: Send + Sync {
    fn kind(&self) -> TriggerKind;

    fn state(&self) -> &TriggerState;

    /// Begin listening for the external condition.
    fn start<'a>(&'a self) -> BoxFuture<'a, Result<(), TriggerError>>;

    /// Stop listening.
    fn stop<'a>(&'a self) -> BoxFuture<'a, Result<(), TriggerError>>;

    /// Validate the configuration, returning human-readable problems.
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.state().config.workflow_id.is_empty() {
            errors.push("workflow_id is required".to_string());
        }
        errors
    }

    /// Fire manually with the given inputs.
    fn trigger<'a>(
        &'a self,
        inputs: HashMap<String, Value>,
        metadata: HashMap<String, Value>,
    ) -> BoxFuture<'a, TriggerResult> {
        Box::pin(async move { self.state().fire(inputs, metadata).await })
    }

    fn pause(&self) {
        self.state().pause();
    }

    fn resume(&self) {
        self.state().resume();
    }

    fn disable(&self) {
        self.state().disable();
    }

    fn enable(&self) {
        self.state().enable();
    }

    fn get_history(&self, limit: usize) -> Vec<TriggerResult> {
        self.state().get_history(limit)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> TriggerState {
        TriggerState::new(TriggerConfig::new(
            "t1",
            "Test Trigger",
            "wf",
            TriggerKind::Manual,
        ))
    }

    #[tokio::test]
    async fn fire_without_callback_still_records() {
        let state = state();
        let result = state.fire(HashMap::new(), HashMap::new()).await;
        assert!(result.success);
        assert!(result.execution_id.is_none());
        assert_eq!(state.get_history(10).len(), 1);
    }

    #[tokio::test]
    async fn fire_invokes_callback_and_captures_execution_id() {
        let state = state();
        state.set_callback(Arc::new(|_result| {
            Box::pin(async { Ok("exec_42".to_string()) })
        }));

        let result = state.fire(HashMap::new(), HashMap::new()).await;
        assert!(result.success);
        assert_eq!(result.execution_id.as_deref(), Some("exec_42"));
    }

    #[tokio::test]
    async fn callback_error_marks_firing_failed() {
        let state = state();
        state.set_callback(Arc::new(|_result| {
            Box::pin(async { Err("dispatch refused".to_string()) })
        }));

        let result = state.fire(HashMap::new(), HashMap::new()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("dispatch refused"));
    }

    #[tokio::test]
    async fn history_is_bounded_and_ordered() {
        let state = state();
        for i in 0..(MAX_TRIGGER_HISTORY + 10) {
            let mut inputs = HashMap::new();
            inputs.insert("i".to_string(), json!(i));
            state.fire(inputs, HashMap::new()).await;
        }

        let history = state.get_history(MAX_TRIGGER_HISTORY + 100);
        assert_eq!(history.len(), MAX_TRIGGER_HISTORY);

        let recent = state.get_history(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(
            recent[2].inputs["i"],
            json!(MAX_TRIGGER_HISTORY + 9)
        );
    }

    #[test]
    fn lifecycle_transitions() {
        let state = state();
        assert!(state.is_active());

        state.pause();
        assert_eq!(state.status(), TriggerStatus::Paused);

        state.resume();
        assert!(state.is_active());

        state.disable();
        assert_eq!(state.status(), TriggerStatus::Disabled);

        state.enable();
        assert!(state.is_active());
    }

    #[test]
    fn disabled_config_starts_disabled() {
        let mut config = TriggerConfig::new("t2", "Off", "wf", TriggerKind::Manual);
        config.enabled = false;
        let state = TriggerState::new(config);
        assert_eq!(state.status(), TriggerStatus::Disabled);

        // resume() does not reactivate a trigger disabled by config
        state.resume();
        assert_eq!(state.status(), TriggerStatus::Disabled);
    }
}
