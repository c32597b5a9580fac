//! Workflow registry: CRUD and validation of workflow definitions.
//!
//! Re-registering an existing id preserves the previous definition in a
//! per-id version history and bumps the patch component of the semantic
//! version; registering a definition identical to the stored one is a
//! no-op. The registry can persist itself to a JSON document and reload it
//! at construction.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use skein_types::workflow::WorkflowDefinition;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The definition failed validation.
    #[error("invalid workflow: {}", .0.join("; "))]
    Invalid(Vec<String>),

    /// No definition with the given id exists.
    #[error("workflow not found: {0}")]
    NotFound(String),

    /// Persistence read/write failed.
    #[error("registry persistence error: {0}")]
    Persistence(String),
}

// ---------------------------------------------------------------------------
// Persistence document
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct RegistryDocument {
    definitions: Vec<WorkflowDefinition>,
    updated_at: chrono::DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WorkflowRegistry
// ---------------------------------------------------------------------------

struct RegistryInner {
    workflows: HashMap<String, WorkflowDefinition>,
    versions: HashMap<String, Vec<WorkflowDefinition>>,
}

/// Central registry of workflow definitions.
pub struct WorkflowRegistry {
    inner: Mutex<RegistryInner>,
    storage_path: Option<PathBuf>,
}

impl WorkflowRegistry {
    /// In-memory registry with no persistence.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                workflows: HashMap::new(),
                versions: HashMap::new(),
            }),
            storage_path: None,
        }
    }

    /// Registry persisted at `path`. An existing document is loaded;
    /// a missing or malformed one falls back to empty.
    pub async fn with_storage(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut workflows = HashMap::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<RegistryDocument>(&content) {
                Ok(doc) => {
                    for def in doc.definitions {
                        workflows.insert(def.id.clone(), def);
                    }
                    tracing::info!(
                        path = %path.display(),
                        count = workflows.len(),
                        "loaded workflow registry"
                    );
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "malformed registry file, starting empty");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "failed to read registry file, starting empty");
            }
        }

        Self {
            inner: Mutex::new(RegistryInner {
                workflows,
                versions: HashMap::new(),
            }),
            storage_path: Some(path),
        }
    }

    /// Register a workflow definition.
    ///
    /// With `validate` set, rejects invalid definitions with the full list
    /// of problems. Re-registering an id pushes the previous definition
    /// onto its version history and bumps the patch component; registering
    /// an identical definition changes nothing.
    pub async fn register(
        &self,
        mut definition: WorkflowDefinition,
        validate: bool,
    ) -> Result<WorkflowDefinition, RegistryError> {
        if validate {
            let errors = definition.validate();
            if !errors.is_empty() {
                return Err(RegistryError::Invalid(errors));
            }
        }

        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.workflows.get(&definition.id) {
            if definitions_equal(existing, &definition) {
                // Byte-identical re-registration: no version bump, no churn
                return Ok(existing.clone());
            }

            let previous = existing.clone();
            definition.version = bump_patch(&previous.version);
            inner
                .versions
                .entry(definition.id.clone())
                .or_default()
                .push(previous);
        }

        definition.updated_at = Utc::now();
        let stored = definition.clone();
        inner.workflows.insert(definition.id.clone(), definition);

        tracing::info!(
            workflow_id = stored.id.as_str(),
            version = stored.version.as_str(),
            "registered workflow"
        );

        drop(inner);
        self.persist().await?;
        Ok(stored)
    }

    /// Fetch a definition by id.
    pub async fn get(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.inner.lock().await.workflows.get(workflow_id).cloned()
    }

    /// All registered definitions.
    pub async fn list(&self) -> Vec<WorkflowDefinition> {
        self.inner.lock().await.workflows.values().cloned().collect()
    }

    /// Remove a definition (its version history goes with it).
    pub async fn remove(&self, workflow_id: &str) -> Result<WorkflowDefinition, RegistryError> {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.versions.remove(workflow_id);
            inner
                .workflows
                .remove(workflow_id)
                .ok_or_else(|| RegistryError::NotFound(workflow_id.to_string()))?
        };
        self.persist().await?;
        Ok(removed)
    }

    /// Preserved prior versions of a definition, oldest first.
    pub async fn get_versions(&self, workflow_id: &str) -> Vec<WorkflowDefinition> {
        self.inner
            .lock()
            .await
            .versions
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Enable or disable a workflow.
    pub async fn set_enabled(
        &self,
        workflow_id: &str,
        enabled: bool,
    ) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.lock().await;
            let def = inner
                .workflows
                .get_mut(workflow_id)
                .ok_or_else(|| RegistryError::NotFound(workflow_id.to_string()))?;
            def.enabled = enabled;
            def.updated_at = Utc::now();
        }
        self.persist().await
    }

    /// Number of registered definitions.
    pub async fn count(&self) -> usize {
        self.inner.lock().await.workflows.len()
    }

    async fn persist(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };

        let doc = {
            let inner = self.inner.lock().await;
            RegistryDocument {
                definitions: inner.workflows.values().cloned().collect(),
                updated_at: Utc::now(),
            }
        };

        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| RegistryError::Persistence(e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| RegistryError::Persistence(e.to_string()))
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Equality that ignores the registration-managed timestamps, so a caller
/// re-submitting the same document is recognized as identical.
fn definitions_equal(a: &WorkflowDefinition, b: &WorkflowDefinition) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.created_at = b.created_at;
    a.updated_at = b.updated_at;
    a == b
}

/// Bump the patch component of a semantic version string. Unparseable
/// versions restart at 0.0.1.
fn bump_patch(version: &str) -> String {
    match Version::parse(version) {
        Ok(mut v) => {
            v.patch += 1;
            v.to_string()
        }
        Err(_) => "0.0.1".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use skein_types::workflow::WorkflowStep;

    fn pipeline() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "data-pipeline",
            "Data Pipeline",
            vec![
                WorkflowStep::new("extract", "agent", "Extract"),
                WorkflowStep::new("load", "agent", "Load"),
            ],
        )
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = WorkflowRegistry::new();
        registry.register(pipeline(), true).await.unwrap();

        let fetched = registry.get("data-pipeline").await.unwrap();
        assert_eq!(fetched.id, "data-pipeline");
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn invalid_definition_is_rejected() {
        let registry = WorkflowRegistry::new();
        let bad = WorkflowDefinition::new("bad", "Bad", vec![]);
        let err = registry.register(bad, true).await.unwrap_err();
        assert!(matches!(err, RegistryError::Invalid(_)));
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn validation_can_be_skipped() {
        let registry = WorkflowRegistry::new();
        let bad = WorkflowDefinition::new("bad", "Bad", vec![]);
        assert!(registry.register(bad, false).await.is_ok());
    }

    #[tokio::test]
    async fn reregistering_changed_definition_bumps_patch() {
        let registry = WorkflowRegistry::new();
        registry.register(pipeline(), true).await.unwrap();

        let mut changed = pipeline();
        changed.description = "now with docs".to_string();
        let stored = registry.register(changed, true).await.unwrap();

        assert_eq!(stored.version, "1.0.1");
        let versions = registry.get_versions("data-pipeline").await;
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, "1.0.0");
    }

    #[tokio::test]
    async fn patch_grows_by_at_most_one_per_register() {
        let registry = WorkflowRegistry::new();
        registry.register(pipeline(), true).await.unwrap();

        for i in 0..3 {
            let mut changed = pipeline();
            changed.description = format!("rev {i}");
            let before = registry.get("data-pipeline").await.unwrap();
            let stored = registry.register(changed, true).await.unwrap();

            let prev = Version::parse(&before.version).unwrap();
            let next = Version::parse(&stored.version).unwrap();
            assert_eq!(next.patch, prev.patch + 1);
        }
    }

    #[tokio::test]
    async fn identical_reregistration_is_idempotent() {
        let registry = WorkflowRegistry::new();
        let stored = registry.register(pipeline(), true).await.unwrap();

        let again = registry.register(stored.clone(), true).await.unwrap();
        assert_eq!(again.version, stored.version);
        assert_eq!(registry.count().await, 1);
        assert!(registry.get_versions("data-pipeline").await.is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_definition_and_history() {
        let registry = WorkflowRegistry::new();
        registry.register(pipeline(), true).await.unwrap();
        let mut changed = pipeline();
        changed.tags.push("v2".to_string());
        registry.register(changed, true).await.unwrap();

        registry.remove("data-pipeline").await.unwrap();
        assert!(registry.get("data-pipeline").await.is_none());
        assert!(registry.get_versions("data-pipeline").await.is_empty());
        assert!(matches!(
            registry.remove("data-pipeline").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn set_enabled_toggles_flag() {
        let registry = WorkflowRegistry::new();
        registry.register(pipeline(), true).await.unwrap();
        registry.set_enabled("data-pipeline", false).await.unwrap();
        assert!(!registry.get("data-pipeline").await.unwrap().enabled);
    }

    #[tokio::test]
    async fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows.json");

        {
            let registry = WorkflowRegistry::with_storage(&path).await;
            registry.register(pipeline(), true).await.unwrap();
        }

        let reloaded = WorkflowRegistry::with_storage(&path).await;
        assert_eq!(reloaded.count().await, 1);
        let def = reloaded.get("data-pipeline").await.unwrap();
        assert_eq!(def.name, "Data Pipeline");
    }

    #[tokio::test]
    async fn malformed_storage_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let registry = WorkflowRegistry::with_storage(&path).await;
        assert_eq!(registry.count().await, 0);
    }

    #[test]
    fn bump_patch_handles_garbage() {
        assert_eq!(bump_patch("1.2.3"), "1.2.4");
        assert_eq!(bump_patch("not-a-version"), "0.0.1");
    }
}
