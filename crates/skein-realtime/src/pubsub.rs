//! In-process pub/sub topics for dashboard data.
//!
//! Topics can retain their last message: a new subscriber on a retained
//! topic receives that payload synchronously during `subscribe`. Topic and
//! per-topic subscriber counts are capped. Publishing walks the subscriber
//! list synchronously; one failing callback never stops delivery to its
//! siblings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Default maximum number of topics.
pub const DEFAULT_MAX_TOPICS: usize = 1000;

/// Default subscribers per topic.
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 100;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Synchronous message callback. Returning `false` reports a delivery
/// failure (logged, not fatal).
pub type MessageCallback = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Optional per-subscription message filter.
pub type MessageFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Topic metadata.
#[derive(Debug, Clone)]
pub struct TopicInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub message_count: u64,
    pub subscriber_count: usize,
    pub retain_last: bool,
}

struct Subscription {
    id: u64,
    callback: MessageCallback,
    filter: Option<MessageFilter>,
    delivered: u64,
}

struct Topic {
    info: TopicInfo,
    retained: Option<Value>,
    subscriptions: Vec<Subscription>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from pub/sub operations.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("maximum number of topics ({0}) reached")]
    TopicLimit(usize),

    #[error("maximum subscribers for topic '{topic}' reached ({limit})")]
    SubscriberLimit { topic: String, limit: usize },

    #[error("topic not found: {0}")]
    TopicNotFound(String),
}

// ---------------------------------------------------------------------------
// PubSubManager
// ---------------------------------------------------------------------------

struct PubSubInner {
    topics: HashMap<String, Topic>,
    next_subscription_id: u64,
}

/// Topic registry and synchronous dispatcher.
pub struct PubSubManager {
    inner: Mutex<PubSubInner>,
    max_topics: usize,
    max_subscribers_per_topic: usize,
}

impl PubSubManager {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_TOPICS, DEFAULT_MAX_SUBSCRIBERS)
    }

    pub fn with_limits(max_topics: usize, max_subscribers_per_topic: usize) -> Self {
        Self {
            inner: Mutex::new(PubSubInner {
                topics: HashMap::new(),
                next_subscription_id: 0,
            }),
            max_topics,
            max_subscribers_per_topic,
        }
    }

    /// Create a topic (idempotent for an existing name).
    pub fn create_topic(&self, name: &str, retain_last: bool) -> Result<(), PubSubError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.topics.contains_key(name) {
            return Ok(());
        }
        if inner.topics.len() >= self.max_topics {
            return Err(PubSubError::TopicLimit(self.max_topics));
        }
        inner.topics.insert(
            name.to_string(),
            Topic {
                info: TopicInfo {
                    name: name.to_string(),
                    created_at: Utc::now(),
                    message_count: 0,
                    subscriber_count: 0,
                    retain_last,
                },
                retained: None,
                subscriptions: Vec::new(),
            },
        );
        tracing::debug!(topic = name, retain_last, "topic created");
        Ok(())
    }

    /// Delete a topic and its subscriptions.
    pub fn delete_topic(&self, name: &str) -> bool {
        self.inner.lock().unwrap().topics.remove(name).is_some()
    }

    /// Subscribe to a topic (created on demand). On a retained topic the
    /// subscriber receives the retained message synchronously, before this
    /// call returns. Returns the subscription id.
    pub fn subscribe(
        &self,
        topic_name: &str,
        callback: MessageCallback,
        filter: Option<MessageFilter>,
    ) -> Result<u64, PubSubError> {
        self.create_topic(topic_name, false)?;

        let (id, retained) = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_subscription_id += 1;
            let id = inner.next_subscription_id;

            let topic = inner
                .topics
                .get_mut(topic_name)
                .ok_or_else(|| PubSubError::TopicNotFound(topic_name.to_string()))?;
            if topic.subscriptions.len() >= self.max_subscribers_per_topic {
                return Err(PubSubError::SubscriberLimit {
                    topic: topic_name.to_string(),
                    limit: self.max_subscribers_per_topic,
                });
            }

            let retained = if topic.info.retain_last {
                topic.retained.clone()
            } else {
                None
            };

            topic.subscriptions.push(Subscription {
                id,
                callback: Arc::clone(&callback),
                filter: filter.clone(),
                delivered: 0,
            });
            topic.info.subscriber_count = topic.subscriptions.len();
            (id, retained)
        };

        // Retained delivery happens synchronously, outside the lock
        if let Some(message) = retained {
            let passes = filter.as_ref().map(|f| f(&message)).unwrap_or(true);
            if passes && !callback(&message) {
                tracing::warn!(topic = topic_name, "retained delivery failed");
            }
        }

        Ok(id)
    }

    /// Remove a subscription from a topic (or from every topic when
    /// `topic_name` is `None`).
    pub fn unsubscribe(&self, subscription_id: u64, topic_name: Option<&str>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = false;
        for (name, topic) in inner.topics.iter_mut() {
            if topic_name.is_some_and(|t| t != name) {
                continue;
            }
            let before = topic.subscriptions.len();
            topic.subscriptions.retain(|s| s.id != subscription_id);
            if topic.subscriptions.len() != before {
                topic.info.subscriber_count = topic.subscriptions.len();
                removed = true;
            }
        }
        removed
    }

    /// Publish a message: synchronous delivery to every subscriber in
    /// subscription order. Returns the number of successful deliveries.
    pub fn publish(&self, topic_name: &str, message: Value) -> Result<usize, PubSubError> {
        // Snapshot callbacks under the lock, deliver outside it
        let targets: Vec<(u64, MessageCallback, Option<MessageFilter>)> = {
            let mut inner = self.inner.lock().unwrap();
            let topic = inner
                .topics
                .get_mut(topic_name)
                .ok_or_else(|| PubSubError::TopicNotFound(topic_name.to_string()))?;

            topic.info.message_count += 1;
            if topic.info.retain_last {
                topic.retained = Some(message.clone());
            }

            topic
                .subscriptions
                .iter()
                .map(|s| (s.id, Arc::clone(&s.callback), s.filter.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut delivered_ids = Vec::new();
        for (id, callback, filter) in targets {
            if let Some(filter) = &filter {
                if !filter(&message) {
                    continue;
                }
            }
            if callback(&message) {
                delivered += 1;
                delivered_ids.push(id);
            } else {
                tracing::warn!(
                    topic = topic_name,
                    subscription = id,
                    "subscriber delivery failed"
                );
            }
        }

        // Fold delivery counters back in
        let mut inner = self.inner.lock().unwrap();
        if let Some(topic) = inner.topics.get_mut(topic_name) {
            for subscription in topic.subscriptions.iter_mut() {
                if delivered_ids.contains(&subscription.id) {
                    subscription.delivered += 1;
                }
            }
        }

        Ok(delivered)
    }

    pub fn topic_info(&self, name: &str) -> Option<TopicInfo> {
        self.inner
            .lock()
            .unwrap()
            .topics
            .get(name)
            .map(|t| t.info.clone())
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().topics.keys().cloned().collect()
    }

    pub fn topic_count(&self) -> usize {
        self.inner.lock().unwrap().topics.len()
    }
}

impl Default for PubSubManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
