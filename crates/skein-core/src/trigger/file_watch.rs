//! File-watch trigger: fire workflows on filesystem changes.
//!
//! Wraps a debounced `notify` watcher. Change events are filtered by glob
//! patterns (matched against the file name and the full path) before the
//! trigger fires with the changed path as payload.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
// The debouncer re-exports its own notify version; using those types keeps
// the watcher and debouncer compiled against the same crate.
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebounceEventResult, DebouncedEvent, Debouncer, new_debouncer};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use skein_types::trigger::{TriggerConfig, TriggerKind};

use super::{Trigger, TriggerError, TriggerState};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// File-watch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FileWatchSettings {
    /// Filesystem paths to watch recursively.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Optional glob patterns; empty means every change passes.
    #[serde(default)]
    pub patterns: Option<Vec<String>>,
    /// Debounce window in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Glob matching
// ---------------------------------------------------------------------------

/// Minimal glob matching: `*` any sequence, `?` any single character.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn matches(pattern: &[char], text: &[char]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some('*') => {
                // Collapse consecutive stars, then try every split point
                let rest = &pattern[1..];
                (0..=text.len()).any(|i| matches(rest, &text[i..]))
            }
            Some('?') => !text.is_empty() && matches(&pattern[1..], &text[1..]),
            Some(c) => text.first() == Some(c) && matches(&pattern[1..], &text[1..]),
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    matches(&pattern, &text)
}

/// Keep events whose file name or full path matches any pattern.
fn filter_events(events: Vec<DebouncedEvent>, patterns: Option<&[String]>) -> Vec<DebouncedEvent> {
    let Some(patterns) = patterns else {
        return events;
    };
    if patterns.is_empty() {
        return events;
    }

    events
        .into_iter()
        .filter(|event| {
            let file_name = event
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("");
            let full_path = event.path.display().to_string();
            patterns
                .iter()
                .any(|p| glob_match(p, file_name) || glob_match(p, &full_path))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// FileWatchTrigger
// ---------------------------------------------------------------------------

/// Trigger fired by debounced filesystem change events.
pub struct FileWatchTrigger {
    state: Arc<TriggerState>,
    settings: FileWatchSettings,
    /// Owning the debouncer keeps the watch alive; dropping it stops it.
    debouncer: Mutex<Option<Debouncer<RecommendedWatcher>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileWatchTrigger {
    pub fn new(config: TriggerConfig) -> Result<Self, TriggerError> {
        let settings: FileWatchSettings =
            serde_json::from_value(Value::Object(config.config.clone()))
                .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            state: Arc::new(TriggerState::new(config)),
            settings,
            debouncer: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &FileWatchSettings {
        &self.settings
    }
}

impl Trigger for FileWatchTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::FileWatch
    }

    fn state(&self) -> &TriggerState {
        &self.state
    }

    fn start<'a>(&'a self) -> BoxFuture<'a, Result<(), TriggerError>> {
        Box::pin(async move {
            if self.settings.paths.is_empty() {
                return Err(TriggerError::InvalidConfig(
                    "file watch must have at least one path".to_string(),
                ));
            }

            let (tx, mut rx) = mpsc::channel::<Vec<PathBuf>>(64);
            let patterns = self.settings.patterns.clone();

            let mut debouncer = new_debouncer(
                Duration::from_millis(self.settings.debounce_ms),
                move |result: DebounceEventResult| {
                    if let Ok(events) = result {
                        let filtered = filter_events(events, patterns.as_deref());
                        if filtered.is_empty() {
                            return;
                        }
                        let paths: Vec<PathBuf> =
                            filtered.into_iter().map(|e| e.path).collect();
                        // Non-blocking: a full channel drops the batch
                        let _ = tx.try_send(paths);
                    }
                },
            )
            .map_err(|e| TriggerError::StartFailed(e.to_string()))?;

            for path in &self.settings.paths {
                debouncer
                    .watcher()
                    .watch(std::path::Path::new(path), RecursiveMode::Recursive)
                    .map_err(|e| {
                        TriggerError::StartFailed(format!("watch '{path}': {e}"))
                    })?;
            }

            let state = Arc::clone(&self.state);
            let handle = tokio::spawn(async move {
                while let Some(paths) = rx.recv().await {
                    if !state.is_active() {
                        continue;
                    }
                    for path in paths {
                        let mut inputs = std::collections::HashMap::new();
                        inputs.insert(
                            "path".to_string(),
                            json!(path.display().to_string()),
                        );
                        inputs.insert(
                            "detected_at".to_string(),
                            json!(chrono::Utc::now().to_rfc3339()),
                        );
                        state.fire(inputs, std::collections::HashMap::new()).await;
                    }
                }
            });

            *self.debouncer.lock().unwrap() = Some(debouncer);
            *self.task.lock().unwrap() = Some(handle);

            tracing::info!(
                trigger_id = self.state.config.id.as_str(),
                paths = ?self.settings.paths,
                "file watch trigger started"
            );
            Ok(())
        })
    }

    fn stop<'a>(&'a self) -> BoxFuture<'a, Result<(), TriggerError>> {
        Box::pin(async move {
            // Dropping the debouncer stops the underlying watcher
            self.debouncer.lock().unwrap().take();
            if let Some(handle) = self.task.lock().unwrap().take() {
                handle.abort();
            }
            tracing::info!(
                trigger_id = self.state.config.id.as_str(),
                "file watch trigger stopped"
            );
            Ok(())
        })
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.state.config.workflow_id.is_empty() {
            errors.push("workflow_id is required".to_string());
        }
        if self.settings.paths.is_empty() {
            errors.push("file watch must have at least one path".to_string());
        }
        errors
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_sequences() {
        assert!(glob_match("*.csv", "data.csv"));
        assert!(glob_match("report-*", "report-2026.pdf"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("*.csv", "data.json"));
    }

    #[test]
    fn glob_question_matches_single_char() {
        assert!(glob_match("file?.txt", "file1.txt"));
        assert!(!glob_match("file?.txt", "file12.txt"));
    }

    #[test]
    fn glob_exact_match() {
        assert!(glob_match("exact.txt", "exact.txt"));
        assert!(!glob_match("exact.txt", "inexact.txt"));
    }

    fn config(paths: Vec<&str>) -> TriggerConfig {
        TriggerConfig::new("csv-drop", "CSV Drop", "ingest", TriggerKind::FileWatch)
            .with_config("paths", json!(paths))
            .with_config("patterns", json!(["*.csv"]))
            .with_config("debounce_ms", json!(50))
    }

    #[test]
    fn validation_requires_paths() {
        let trigger = FileWatchTrigger::new(config(vec![])).unwrap();
        let errors = trigger.validate();
        assert!(errors.iter().any(|e| e.contains("at least one path")));
    }

    #[tokio::test]
    async fn start_fails_without_paths() {
        let trigger = FileWatchTrigger::new(config(vec![])).unwrap();
        assert!(trigger.start().await.is_err());
    }

    #[tokio::test]
    async fn watcher_fires_on_matching_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().display().to_string();
        let trigger = FileWatchTrigger::new(config(vec![&dir_path])).unwrap();

        trigger.start().await.unwrap();

        tokio::fs::write(dir.path().join("data.csv"), "a,b,c")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("ignored.json"), "{}")
            .await
            .unwrap();

        // Give the debouncer time to flush
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if !trigger.get_history(10).is_empty() {
                break;
            }
        }

        trigger.stop().await.unwrap();

        let history = trigger.get_history(10);
        assert!(!history.is_empty(), "expected at least one firing");
        assert!(
            history
                .iter()
                .all(|r| r.inputs["path"].as_str().unwrap().ends_with(".csv"))
        );
    }
}
