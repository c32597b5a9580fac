//! In-process pub/sub event bus with pattern subscriptions.
//!
//! Subscribers register a handler against a type pattern (`*`, `prefix.*`,
//! or a glob). `emit` delivers to every matching subscription in
//! subscription order and returns the notified count; `wait_for` parks until
//! a matching event arrives or a timeout elapses. A bounded history buffer
//! keeps the most recent events for inspection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use regex::Regex;
use tokio::sync::mpsc;

use skein_types::event::WorkflowEvent;

/// Events retained in the history buffer.
pub const MAX_HISTORY: usize = 1000;

/// An async event handler.
pub type EventHandler = Arc<dyn Fn(WorkflowEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// An optional per-subscription filter applied after pattern matching.
pub type EventPredicate = Arc<dyn Fn(&WorkflowEvent) -> bool + Send + Sync>;

struct Subscription {
    id: u64,
    pattern: String,
    handler: EventHandler,
    filter: Option<EventPredicate>,
}

struct BusInner {
    subscriptions: Vec<Subscription>,
    history: VecDeque<WorkflowEvent>,
    next_id: u64,
}

/// Pattern-matching pub/sub bus.
///
/// Cloning the bus clones a handle to the same broker, so producers and
/// consumers can share it freely.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                subscriptions: Vec::new(),
                history: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    /// Subscribe a handler to an event-type pattern.
    ///
    /// Returns a subscription id usable with [`EventBus::unsubscribe`].
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        handler: EventHandler,
        filter: Option<EventPredicate>,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        let pattern = pattern.into();
        tracing::debug!(pattern = pattern.as_str(), sub_id = id, "event subscription added");
        inner.subscriptions.push(Subscription {
            id,
            pattern,
            handler,
            filter,
        });
        id
    }

    /// Remove a subscription by id. Returns whether anything was removed.
    pub fn unsubscribe(&self, subscription_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != subscription_id);
        inner.subscriptions.len() != before
    }

    /// Emit an event to every matching subscription.
    ///
    /// Delivery is in subscription order. A handler that misbehaves cannot
    /// affect its siblings (handlers are infallible by construction; long
    /// handlers simply delay later ones). Returns the notified count.
    pub async fn emit(&self, event: WorkflowEvent) -> usize {
        // Snapshot matching handlers under the lock, deliver outside it.
        let matching: Vec<(EventHandler, Option<EventPredicate>)> = {
            let mut inner = self.inner.lock().unwrap();
            inner.history.push_back(event.clone());
            while inner.history.len() > MAX_HISTORY {
                inner.history.pop_front();
            }
            inner
                .subscriptions
                .iter()
                .filter(|s| matches_pattern(&s.pattern, &event.event_type))
                .map(|s| (Arc::clone(&s.handler), s.filter.clone()))
                .collect()
        };

        let mut notified = 0;
        for (handler, filter) in matching {
            if let Some(filter) = &filter {
                if !filter(&event) {
                    continue;
                }
            }
            handler(event.clone()).await;
            notified += 1;
        }

        tracing::debug!(
            event_type = event.event_type.as_str(),
            notified,
            "event emitted"
        );
        notified
    }

    /// Await the next event matching `event_type` (a pattern) and the
    /// optional predicate. Returns `None` on timeout.
    pub async fn wait_for(
        &self,
        event_type: &str,
        timeout: Option<std::time::Duration>,
        predicate: Option<EventPredicate>,
    ) -> Option<WorkflowEvent> {
        let (tx, mut rx) = mpsc::channel::<WorkflowEvent>(1);
        let tx = Arc::new(tx);

        let handler: EventHandler = {
            let tx = Arc::clone(&tx);
            Arc::new(move |event: WorkflowEvent| {
                let tx = Arc::clone(&tx);
                Box::pin(async move {
                    let _ = tx.try_send(event);
                })
            })
        };

        let sub_id = self.subscribe(event_type, handler, predicate);

        let received = match timeout {
            Some(dur) => tokio::time::timeout(dur, rx.recv()).await.ok().flatten(),
            None => rx.recv().await,
        };

        self.unsubscribe(sub_id);
        received
    }

    /// Recent events, newest last, optionally filtered by a type pattern.
    pub fn get_history(&self, event_type: Option<&str>, limit: usize) -> Vec<WorkflowEvent> {
        let inner = self.inner.lock().unwrap();
        let filtered: Vec<WorkflowEvent> = inner
            .history
            .iter()
            .filter(|e| {
                event_type.is_none_or(|pattern| matches_pattern(pattern, &e.event_type))
            })
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    /// Drop all retained history.
    pub fn clear_history(&self) {
        self.inner.lock().unwrap().history.clear();
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().subscriptions.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("EventBus")
            .field("subscriptions", &inner.subscriptions.len())
            .field("history", &inner.history.len())
            .finish()
    }
}

/// Event-type pattern matching: `*` matches everything, `prefix.*` matches
/// types beginning with `prefix.`, any other `*`-containing pattern is a
/// glob (with `.` literal), and everything else is exact equality.
pub fn matches_pattern(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type.starts_with(&format!("{prefix}."));
    }
    if pattern.contains('*') {
        let escaped = pattern.replace('.', r"\.").replace('*', ".*");
        return Regex::new(&format!("^{escaped}$"))
            .map(|re| re.is_match(event_type))
            .unwrap_or(false);
    }
    pattern == event_type
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
