//! Metric streams: periodic query execution pushed to subscribers.
//!
//! Each stream runs its own task: while RUNNING it invokes the configured
//! query, appends the point to a bounded ring buffer, calls the data
//! callback, and sleeps for the interval. Pause/resume toggle the status
//! without losing buffered history; repeated query errors back the loop
//! off to twice the interval.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Stream lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// One emitted stream point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPoint {
    pub timestamp: DateTime<Utc>,
    pub value: Value,
}

/// Executes a stream's query, yielding the next value (or an error).
pub type QueryFn = Arc<dyn Fn(&str) -> Result<Value, String> + Send + Sync>;

/// Receives each emitted point.
pub type DataCallback = Arc<dyn Fn(&StreamPoint) + Send + Sync>;

struct StreamState {
    name: String,
    query: String,
    interval: Duration,
    buffer_size: usize,
    status: StreamStatus,
    started_at: Option<DateTime<Utc>>,
    points_emitted: u64,
    errors: u64,
    last_error: Option<String>,
    buffer: VecDeque<StreamPoint>,
    callback: Option<DataCallback>,
}

/// Public stream snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub name: String,
    pub query: String,
    pub interval_secs: f64,
    pub status: StreamStatus,
    pub points_emitted: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub buffered: usize,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from stream management.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream already exists: {0}")]
    AlreadyExists(String),

    #[error("stream not found: {0}")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// StreamManager
// ---------------------------------------------------------------------------

/// Creates and drives metric streams against a query executor.
pub struct StreamManager {
    streams: Mutex<HashMap<String, Arc<Mutex<StreamState>>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    query: QueryFn,
}

impl StreamManager {
    pub fn new(query: QueryFn) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            query,
        }
    }

    /// Register a stream (idle until started).
    pub fn create_stream(
        &self,
        stream_id: &str,
        name: &str,
        query: &str,
        interval: Duration,
        buffer_size: usize,
        callback: Option<DataCallback>,
    ) -> Result<(), StreamError> {
        let mut streams = self.streams.lock().unwrap();
        if streams.contains_key(stream_id) {
            return Err(StreamError::AlreadyExists(stream_id.to_string()));
        }
        streams.insert(
            stream_id.to_string(),
            Arc::new(Mutex::new(StreamState {
                name: name.to_string(),
                query: query.to_string(),
                interval,
                buffer_size: buffer_size.max(1),
                status: StreamStatus::Idle,
                started_at: None,
                points_emitted: 0,
                errors: 0,
                last_error: None,
                buffer: VecDeque::new(),
                callback,
            })),
        );
        tracing::debug!(stream_id, "stream created");
        Ok(())
    }

    /// Start a stream's tick loop. Idempotent for a running stream.
    pub fn start_stream(&self, stream_id: &str) -> Result<(), StreamError> {
        let state = self.get(stream_id)?;
        {
            let mut s = state.lock().unwrap();
            if s.status == StreamStatus::Running {
                return Ok(());
            }
            s.status = StreamStatus::Running;
            s.started_at = Some(Utc::now());
        }

        let query_fn = Arc::clone(&self.query);
        let loop_state = Arc::clone(&state);
        let id = stream_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let (status, query, interval, had_error) = {
                    let s = loop_state.lock().unwrap();
                    (s.status, s.query.clone(), s.interval, s.last_error.is_some())
                };

                match status {
                    StreamStatus::Stopped => break,
                    StreamStatus::Paused => {
                        tokio::time::sleep(interval).await;
                        continue;
                    }
                    _ => {}
                }

                match query_fn(&query) {
                    Ok(value) => {
                        let point = StreamPoint {
                            timestamp: Utc::now(),
                            value,
                        };
                        let callback = {
                            let mut s = loop_state.lock().unwrap();
                            s.buffer.push_back(point.clone());
                            while s.buffer.len() > s.buffer_size {
                                s.buffer.pop_front();
                            }
                            s.points_emitted += 1;
                            s.last_error = None;
                            s.callback.clone()
                        };
                        if let Some(callback) = callback {
                            callback(&point);
                        }
                        tokio::time::sleep(interval).await;
                    }
                    Err(error) => {
                        {
                            let mut s = loop_state.lock().unwrap();
                            s.errors += 1;
                            s.last_error = Some(error.clone());
                        }
                        tracing::warn!(
                            stream_id = id.as_str(),
                            error = error.as_str(),
                            "stream query failed"
                        );
                        // Repeated failures back off to twice the interval
                        let backoff = if had_error { interval * 2 } else { interval };
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        });

        self.tasks.lock().unwrap().insert(stream_id.to_string(), handle);
        tracing::info!(stream_id, "stream started");
        Ok(())
    }

    /// Stop a stream and its task. The buffer is preserved.
    pub fn stop_stream(&self, stream_id: &str) -> Result<(), StreamError> {
        let state = self.get(stream_id)?;
        state.lock().unwrap().status = StreamStatus::Stopped;
        if let Some(handle) = self.tasks.lock().unwrap().remove(stream_id) {
            handle.abort();
        }
        tracing::info!(stream_id, "stream stopped");
        Ok(())
    }

    /// Pause a running stream (history kept, ticks skipped).
    pub fn pause_stream(&self, stream_id: &str) -> Result<bool, StreamError> {
        let state = self.get(stream_id)?;
        let mut s = state.lock().unwrap();
        if s.status != StreamStatus::Running {
            return Ok(false);
        }
        s.status = StreamStatus::Paused;
        Ok(true)
    }

    /// Resume a paused stream.
    pub fn resume_stream(&self, stream_id: &str) -> Result<bool, StreamError> {
        let state = self.get(stream_id)?;
        let mut s = state.lock().unwrap();
        if s.status != StreamStatus::Paused {
            return Ok(false);
        }
        s.status = StreamStatus::Running;
        Ok(true)
    }

    /// Remove a stream entirely.
    pub fn delete_stream(&self, stream_id: &str) -> Result<(), StreamError> {
        self.stop_stream(stream_id)?;
        self.streams.lock().unwrap().remove(stream_id);
        Ok(())
    }

    /// The most recent `count` buffered points.
    pub fn recent_points(&self, stream_id: &str, count: usize) -> Result<Vec<StreamPoint>, StreamError> {
        let state = self.get(stream_id)?;
        let s = state.lock().unwrap();
        let skip = s.buffer.len().saturating_sub(count);
        Ok(s.buffer.iter().skip(skip).cloned().collect())
    }

    /// Snapshot of a stream's counters and status.
    pub fn info(&self, stream_id: &str) -> Result<StreamInfo, StreamError> {
        let state = self.get(stream_id)?;
        let s = state.lock().unwrap();
        Ok(StreamInfo {
            id: stream_id.to_string(),
            name: s.name.clone(),
            query: s.query.clone(),
            interval_secs: s.interval.as_secs_f64(),
            status: s.status,
            points_emitted: s.points_emitted,
            errors: s.errors,
            last_error: s.last_error.clone(),
            buffered: s.buffer.len(),
        })
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.streams.lock().unwrap().keys().cloned().collect()
    }

    /// Stop every stream.
    pub fn shutdown(&self) {
        let ids = self.stream_ids();
        for id in ids {
            let _ = self.stop_stream(&id);
        }
    }

    fn get(&self, stream_id: &str) -> Result<Arc<Mutex<StreamState>>, StreamError> {
        self.streams
            .lock()
            .unwrap()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StreamError::NotFound(stream_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting_query() -> (QueryFn, Arc<AtomicU64>) {
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let query: QueryFn = Arc::new(move |_q: &str| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            Ok(json!(n))
        });
        (query, counter)
    }

    async fn wait_for_points(manager: &StreamManager, id: &str, minimum: u64) {
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if manager.info(id).unwrap().points_emitted >= minimum {
                return;
            }
        }
        panic!("stream never emitted {minimum} points");
    }

    #[tokio::test]
    async fn stream_emits_points_and_calls_back() {
        let (query, _) = counting_query();
        let manager = StreamManager::new(query);

        let received: Arc<Mutex<Vec<StreamPoint>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        manager
            .create_stream(
                "s1",
                "Counter",
                "count(things)",
                Duration::from_millis(5),
                100,
                Some(Arc::new(move |p| sink.lock().unwrap().push(p.clone()))),
            )
            .unwrap();
        manager.start_stream("s1").unwrap();

        wait_for_points(&manager, "s1", 3).await;
        manager.stop_stream("s1").unwrap();

        assert!(received.lock().unwrap().len() >= 3);
        let info = manager.info("s1").unwrap();
        assert_eq!(info.status, StreamStatus::Stopped);
        assert_eq!(info.errors, 0);
    }

    #[tokio::test]
    async fn duplicate_stream_ids_are_rejected() {
        let (query, _) = counting_query();
        let manager = StreamManager::new(query);
        manager
            .create_stream("s1", "A", "q", Duration::from_secs(1), 10, None)
            .unwrap();
        assert!(matches!(
            manager.create_stream("s1", "B", "q", Duration::from_secs(1), 10, None),
            Err(StreamError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn pause_preserves_history_and_resume_continues() {
        let (query, counter) = counting_query();
        let manager = StreamManager::new(query);
        manager
            .create_stream("s1", "Counter", "q", Duration::from_millis(5), 100, None)
            .unwrap();
        manager.start_stream("s1").unwrap();

        wait_for_points(&manager, "s1", 2).await;
        assert!(manager.pause_stream("s1").unwrap());

        let frozen = manager.info("s1").unwrap().points_emitted;
        let buffered = manager.recent_points("s1", 100).unwrap().len();
        let calls_at_pause = counter.load(Ordering::SeqCst);

        // While paused the loop ticks but emits nothing
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.info("s1").unwrap().points_emitted, frozen);
        assert_eq!(counter.load(Ordering::SeqCst), calls_at_pause);
        // History survives the pause
        assert_eq!(manager.recent_points("s1", 100).unwrap().len(), buffered);

        assert!(manager.resume_stream("s1").unwrap());
        wait_for_points(&manager, "s1", frozen + 1).await;
        manager.stop_stream("s1").unwrap();
    }

    #[tokio::test]
    async fn pause_on_idle_stream_is_a_no_op() {
        let (query, _) = counting_query();
        let manager = StreamManager::new(query);
        manager
            .create_stream("s1", "A", "q", Duration::from_secs(1), 10, None)
            .unwrap();
        assert!(!manager.pause_stream("s1").unwrap());
        assert!(!manager.resume_stream("s1").unwrap());
    }

    #[tokio::test]
    async fn buffer_is_a_bounded_ring() {
        let (query, _) = counting_query();
        let manager = StreamManager::new(query);
        manager
            .create_stream("s1", "Counter", "q", Duration::from_millis(2), 5, None)
            .unwrap();
        manager.start_stream("s1").unwrap();

        wait_for_points(&manager, "s1", 12).await;
        manager.stop_stream("s1").unwrap();

        let points = manager.recent_points("s1", 100).unwrap();
        assert!(points.len() <= 5);
        // The newest points are the ones kept
        let last_value = points.last().unwrap().value.as_u64().unwrap();
        let first_value = points.first().unwrap().value.as_u64().unwrap();
        assert!(last_value > first_value);
    }

    #[tokio::test]
    async fn query_errors_are_counted_and_surfaced() {
        let query: QueryFn = Arc::new(|_| Err("storage offline".to_string()));
        let manager = StreamManager::new(query);
        manager
            .create_stream("s1", "Failing", "q", Duration::from_millis(5), 10, None)
            .unwrap();
        manager.start_stream("s1").unwrap();

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if manager.info("s1").unwrap().errors >= 2 {
                break;
            }
        }
        manager.stop_stream("s1").unwrap();

        let info = manager.info("s1").unwrap();
        assert!(info.errors >= 2);
        assert_eq!(info.last_error.as_deref(), Some("storage offline"));
        assert_eq!(info.points_emitted, 0);
    }

    #[tokio::test]
    async fn delete_removes_the_stream() {
        let (query, _) = counting_query();
        let manager = StreamManager::new(query);
        manager
            .create_stream("s1", "A", "q", Duration::from_secs(1), 10, None)
            .unwrap();
        manager.delete_stream("s1").unwrap();
        assert!(matches!(manager.info("s1"), Err(StreamError::NotFound(_))));
    }

    #[tokio::test]
    async fn shutdown_stops_every_stream() {
        let (query, _) = counting_query();
        let manager = StreamManager::new(query);
        for id in ["a", "b"] {
            manager
                .create_stream(id, id, "q", Duration::from_millis(5), 10, None)
                .unwrap();
            manager.start_stream(id).unwrap();
        }
        manager.shutdown();
        for id in ["a", "b"] {
            assert_eq!(manager.info(id).unwrap().status, StreamStatus::Stopped);
        }
    }
}
