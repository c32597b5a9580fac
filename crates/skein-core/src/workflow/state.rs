//! Durable execution state store with integrity-checked checkpoints.
//!
//! The `StateStore` holds live `WorkflowState` records and an append-only
//! checkpoint log per execution. A checkpoint is a deep copy of the state
//! plus a digest over its canonical JSON form; recovery scans newest-first
//! and installs the first checkpoint whose digest still validates, so a
//! corrupted entry is skipped rather than trusted.
//!
//! All reads and writes go through a single mutex region per store instance.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use skein_types::workflow::{WorkflowState, WorkflowStatus};

/// Checkpoints kept per execution; older entries are dropped.
pub const MAX_CHECKPOINTS: usize = 10;

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// An immutable snapshot of a workflow's state with a content digest.
///
/// The digest is SHA-256 over the canonical (key-sorted) JSON serialization
/// of `state`, truncated to 16 hex characters. Mutating the live state after
/// a checkpoint is taken never alters the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub execution_id: String,
    pub state: WorkflowState,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    pub digest: String,
}

impl Checkpoint {
    /// Snapshot `state` under the given id, computing the digest.
    pub fn capture(checkpoint_id: impl Into<String>, state: &WorkflowState) -> Self {
        Self {
            checkpoint_id: checkpoint_id.into(),
            execution_id: state.execution_id.clone(),
            state: state.clone(),
            created_at: Utc::now(),
            digest: state_digest(state),
        }
    }

    /// Whether the stored digest matches a fresh recomputation.
    pub fn validate(&self) -> bool {
        self.digest == state_digest(&self.state)
    }
}

/// Canonical digest of a workflow state: SHA-256 over key-sorted JSON,
/// truncated to 16 hex characters.
pub fn state_digest(state: &WorkflowState) -> String {
    // Going through `Value` sorts object keys (serde_json's map is ordered),
    // which makes the serialization canonical regardless of HashMap iteration.
    let canonical = serde_json::to_value(state)
        .and_then(|v| serde_json::to_string(&v))
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let full = hasher.finalize();
    hex_encode(&full)[..16].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

struct StoreInner {
    states: HashMap<String, WorkflowState>,
    checkpoints: HashMap<String, Vec<Checkpoint>>,
}

/// In-memory state store with durable-execution checkpointing.
pub struct StateStore {
    inner: Mutex<StoreInner>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                states: HashMap::new(),
                checkpoints: HashMap::new(),
            }),
        }
    }

    /// Create a fresh execution state seeded with the initial variables.
    pub async fn create_state(
        &self,
        execution_id: &str,
        workflow_id: &str,
        initial_variables: HashMap<String, serde_json::Value>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> WorkflowState {
        let mut state = WorkflowState::new(execution_id, workflow_id);
        state.variables = initial_variables;
        state.metadata = metadata;

        let mut inner = self.inner.lock().await;
        inner.states.insert(execution_id.to_string(), state.clone());
        inner.checkpoints.entry(execution_id.to_string()).or_default();
        state
    }

    /// Fetch a copy of an execution's live state.
    pub async fn get_state(&self, execution_id: &str) -> Option<WorkflowState> {
        self.inner.lock().await.states.get(execution_id).cloned()
    }

    /// Replace an execution's live state.
    pub async fn update_state(&self, state: &WorkflowState) {
        let mut inner = self.inner.lock().await;
        inner
            .states
            .insert(state.execution_id.clone(), state.clone());
    }

    /// Take a checkpoint of the given state.
    ///
    /// The snapshot is captured inside the lock and deep-copied, so the
    /// caller cannot retroactively modify it. Only the newest
    /// [`MAX_CHECKPOINTS`] are retained per execution.
    pub async fn checkpoint(&self, state: &WorkflowState) -> Checkpoint {
        let mut inner = self.inner.lock().await;
        let log = inner
            .checkpoints
            .entry(state.execution_id.clone())
            .or_default();
        let checkpoint = Checkpoint::capture(
            format!("cp_{}_{}", state.execution_id, log.len()),
            state,
        );
        log.push(checkpoint.clone());
        if log.len() > MAX_CHECKPOINTS {
            let excess = log.len() - MAX_CHECKPOINTS;
            log.drain(..excess);
        }

        tracing::debug!(
            execution_id = state.execution_id.as_str(),
            checkpoint_id = checkpoint.checkpoint_id.as_str(),
            digest = checkpoint.digest.as_str(),
            "checkpointed state"
        );

        checkpoint
    }

    /// Newest checkpoint whose digest validates, if any.
    pub async fn latest_valid_checkpoint(&self, execution_id: &str) -> Option<Checkpoint> {
        let inner = self.inner.lock().await;
        Self::latest_valid_in(&inner, execution_id)
    }

    fn latest_valid_in(inner: &StoreInner, execution_id: &str) -> Option<Checkpoint> {
        inner
            .checkpoints
            .get(execution_id)?
            .iter()
            .rev()
            .find(|cp| cp.validate())
            .cloned()
    }

    /// Restore the latest valid checkpoint as the live state.
    ///
    /// Returns a deep copy of the recovered state, or `None` when every
    /// checkpoint is missing or corrupt (the caller starts fresh).
    pub async fn recover(&self, execution_id: &str) -> Option<WorkflowState> {
        let mut inner = self.inner.lock().await;
        let checkpoint = Self::latest_valid_in(&inner, execution_id)?;
        let state = checkpoint.state.clone();
        inner.states.insert(execution_id.to_string(), state.clone());
        tracing::info!(
            execution_id,
            checkpoint_id = checkpoint.checkpoint_id.as_str(),
            "recovered state from checkpoint"
        );
        Some(state)
    }

    /// Mark an execution completed, stashing the output under `_output`.
    pub async fn mark_completed(
        &self,
        execution_id: &str,
        output: Option<serde_json::Value>,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.states.get_mut(execution_id) {
            state.status = WorkflowStatus::Completed;
            state.completed_at = Some(Utc::now());
            if let Some(output) = output {
                state.variables.insert("_output".to_string(), output);
            }
        }
    }

    /// Mark an execution failed with an error message.
    pub async fn mark_failed(&self, execution_id: &str, error: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.states.get_mut(execution_id) {
            state.status = WorkflowStatus::Failed;
            state.completed_at = Some(Utc::now());
            state.error = Some(error.to_string());
        }
    }

    /// List executions, optionally filtered by workflow and status.
    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
        status: Option<WorkflowStatus>,
    ) -> Vec<WorkflowState> {
        let inner = self.inner.lock().await;
        inner
            .states
            .values()
            .filter(|s| workflow_id.is_none_or(|w| s.workflow_id == w))
            .filter(|s| status.is_none_or(|st| s.status == st))
            .cloned()
            .collect()
    }

    /// Drop completed executions older than `max_age`, returning the count.
    pub async fn cleanup_completed(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now() - max_age;
        let stale: Vec<String> = inner
            .states
            .iter()
            .filter(|(_, s)| {
                s.is_complete() && s.completed_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            inner.states.remove(id);
            inner.checkpoints.remove(id);
        }
        stale.len()
    }

    /// Number of checkpoints held for an execution.
    pub async fn checkpoint_count(&self, execution_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .checkpoints
            .get(execution_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
