//! WebSocket session manager.
//!
//! Transport-agnostic: a connection is an id plus a boxed send callback the
//! transport supplies. The manager tracks per-user connections (evicting
//! the oldest when the cap is exceeded), channel subscriptions, and last
//! activity, runs a periodic ping loop, and routes the JSON frame envelope
//! (`{type, channel?, data?, id?, timestamp}`).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

/// Default ping cadence in seconds.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

/// Default per-user connection cap.
pub const DEFAULT_MAX_CONNECTIONS_PER_USER: usize = 5;

// ---------------------------------------------------------------------------
// Frame envelope
// ---------------------------------------------------------------------------

/// Frame types on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Subscribe,
    Unsubscribe,
    Data,
    Error,
    Ping,
    Pong,
    Auth,
    AuthSuccess,
    AuthFailure,
}

/// The JSON frame envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WsMessage {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            channel: None,
            data: None,
            id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn data(channel: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: MessageType::Data,
            channel: Some(channel.into()),
            data: Some(data),
            id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Error,
            channel: None,
            data: Some(serde_json::json!({"error": message.into()})),
            id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Sends a serialized frame to the client; supplied by the transport.
pub type SendFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Authenticates `AUTH` frame data, returning a user id on success.
pub type AuthFn = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Bookkeeping for one connection.
#[derive(Clone)]
pub struct WsConnection {
    pub id: String,
    pub user_id: Option<String>,
    pub subscribed_channels: HashSet<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub authenticated: bool,
    send: SendFn,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("channels", &self.subscribed_channels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WebSocketManager
// ---------------------------------------------------------------------------

struct ManagerInner {
    connections: HashMap<String, WsConnection>,
    /// user id -> connection ids in connect order (oldest first).
    user_index: HashMap<String, Vec<String>>,
    /// channel -> subscribed connection ids.
    channel_subscribers: HashMap<String, HashSet<String>>,
}

/// Connection lifecycle, subscription routing, and fan-out.
pub struct WebSocketManager {
    inner: Mutex<ManagerInner>,
    ping_interval_secs: u64,
    max_connections_per_user: usize,
    auth: Mutex<Option<AuthFn>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketManager {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_PING_INTERVAL_SECS, DEFAULT_MAX_CONNECTIONS_PER_USER)
    }

    pub fn with_limits(ping_interval_secs: u64, max_connections_per_user: usize) -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                connections: HashMap::new(),
                user_index: HashMap::new(),
                channel_subscribers: HashMap::new(),
            }),
            ping_interval_secs,
            max_connections_per_user: max_connections_per_user.max(1),
            auth: Mutex::new(None),
            ping_task: Mutex::new(None),
        }
    }

    /// Install the authentication handler consulted on AUTH frames.
    pub fn set_auth_handler(&self, handler: AuthFn) {
        *self.auth.lock().unwrap() = Some(handler);
    }

    /// Register a new connection. When the user already holds the maximum
    /// number of connections, the oldest one is evicted first.
    pub fn connect(
        &self,
        connection_id: impl Into<String>,
        send: SendFn,
        user_id: Option<String>,
    ) -> WsConnection {
        let connection_id = connection_id.into();
        let mut evicted: Option<String> = None;

        let connection = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(user) = &user_id {
                let existing = inner.user_index.entry(user.clone()).or_default();
                if existing.len() >= self.max_connections_per_user {
                    evicted = Some(existing.remove(0));
                }
            }
            if let Some(old_id) = &evicted {
                Self::remove_connection(&mut inner, old_id);
                tracing::info!(
                    connection_id = old_id.as_str(),
                    "evicted oldest connection over per-user cap"
                );
            }

            let connection = WsConnection {
                id: connection_id.clone(),
                user_id: user_id.clone(),
                subscribed_channels: HashSet::new(),
                connected_at: Utc::now(),
                last_activity: Utc::now(),
                authenticated: false,
                send,
            };
            inner
                .connections
                .insert(connection_id.clone(), connection.clone());
            if let Some(user) = &user_id {
                inner
                    .user_index
                    .entry(user.clone())
                    .or_default()
                    .push(connection_id.clone());
            }
            connection
        };

        tracing::info!(connection_id = connection.id.as_str(), "websocket connected");
        connection
    }

    /// Drop a connection and its subscriptions.
    pub fn disconnect(&self, connection_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        Self::remove_connection(&mut inner, connection_id);
        tracing::info!(connection_id, "websocket disconnected");
    }

    fn remove_connection(inner: &mut ManagerInner, connection_id: &str) {
        let Some(connection) = inner.connections.remove(connection_id) else {
            return;
        };
        if let Some(user) = &connection.user_id {
            if let Some(ids) = inner.user_index.get_mut(user) {
                ids.retain(|id| id != connection_id);
                if ids.is_empty() {
                    inner.user_index.remove(user);
                }
            }
        }
        for channel in &connection.subscribed_channels {
            if let Some(subs) = inner.channel_subscribers.get_mut(channel) {
                subs.remove(connection_id);
            }
        }
    }

    /// Process a raw inbound frame for a connection.
    pub async fn handle_message(&self, connection_id: &str, raw: &str) {
        let send = {
            let mut inner = self.inner.lock().unwrap();
            let Some(connection) = inner.connections.get_mut(connection_id) else {
                return;
            };
            connection.last_activity = Utc::now();
            Arc::clone(&connection.send)
        };

        let message: WsMessage = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(err) => {
                let _ = send(WsMessage::error(format!("invalid message format: {err}")).to_json())
                    .await;
                return;
            }
        };

        match message.message_type {
            MessageType::Auth => self.handle_auth(connection_id, &message, send).await,
            MessageType::Subscribe => {
                let Some(channel) = message.channel else {
                    let _ = send(
                        WsMessage::error("channel required for subscription").to_json(),
                    )
                    .await;
                    return;
                };
                let mut inner = self.inner.lock().unwrap();
                if let Some(connection) = inner.connections.get_mut(connection_id) {
                    connection.subscribed_channels.insert(channel.clone());
                }
                inner
                    .channel_subscribers
                    .entry(channel.clone())
                    .or_default()
                    .insert(connection_id.to_string());
                tracing::debug!(connection_id, channel = channel.as_str(), "subscribed");
            }
            MessageType::Unsubscribe => {
                let Some(channel) = message.channel else { return };
                let mut inner = self.inner.lock().unwrap();
                if let Some(connection) = inner.connections.get_mut(connection_id) {
                    connection.subscribed_channels.remove(&channel);
                }
                if let Some(subs) = inner.channel_subscribers.get_mut(&channel) {
                    subs.remove(connection_id);
                }
            }
            MessageType::Ping => {
                let _ = send(WsMessage::new(MessageType::Pong).to_json()).await;
            }
            MessageType::Pong => {}
            other => {
                tracing::debug!(connection_id, frame = ?other, "unhandled frame type");
            }
        }
    }

    async fn handle_auth(&self, connection_id: &str, message: &WsMessage, send: SendFn) {
        let handler = self.auth.lock().unwrap().clone();
        let data = message.data.clone().unwrap_or(Value::Null);

        let user_id = match &handler {
            // No handler configured: every AUTH succeeds anonymously
            None => {
                let mut inner = self.inner.lock().unwrap();
                if let Some(connection) = inner.connections.get_mut(connection_id) {
                    connection.authenticated = true;
                }
                let _ = send(WsMessage::new(MessageType::AuthSuccess).to_json()).await;
                return;
            }
            Some(handler) => handler(&data),
        };

        match user_id {
            Some(user) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if let Some(connection) = inner.connections.get_mut(connection_id) {
                        connection.authenticated = true;
                        connection.user_id = Some(user.clone());
                    }
                    inner
                        .user_index
                        .entry(user.clone())
                        .or_default()
                        .push(connection_id.to_string());
                }
                let mut reply = WsMessage::new(MessageType::AuthSuccess);
                reply.data = Some(serde_json::json!({"user_id": user}));
                let _ = send(reply.to_json()).await;
            }
            None => {
                let mut reply = WsMessage::new(MessageType::AuthFailure);
                reply.data = Some(serde_json::json!({"error": "authentication failed"}));
                let _ = send(reply.to_json()).await;
            }
        }
    }

    /// Send a DATA frame to every connection subscribed to `channel`.
    /// Returns the delivery count.
    pub async fn broadcast(&self, channel: &str, data: Value) -> usize {
        let targets: Vec<SendFn> = {
            let inner = self.inner.lock().unwrap();
            inner
                .channel_subscribers
                .get(channel)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| inner.connections.get(id))
                        .map(|c| Arc::clone(&c.send))
                        .collect()
                })
                .unwrap_or_default()
        };

        let frame = WsMessage::data(channel, data).to_json();
        let mut delivered = 0;
        for send in targets {
            if send(frame.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send a DATA frame to every connection of a user.
    pub async fn send_to_user(&self, user_id: &str, data: Value) -> usize {
        let targets: Vec<SendFn> = {
            let inner = self.inner.lock().unwrap();
            inner
                .user_index
                .get(user_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| inner.connections.get(id))
                        .map(|c| Arc::clone(&c.send))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut frame = WsMessage::new(MessageType::Data);
        frame.data = Some(data);
        let json = frame.to_json();

        let mut delivered = 0;
        for send in targets {
            if send(json.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Spawn the background ping loop (PING to every connection each
    /// interval). Idempotent.
    pub fn start_ping_loop(self: &Arc<Self>) {
        let mut task = self.ping_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(manager.ping_interval_secs))
                    .await;
                let targets: Vec<SendFn> = {
                    let inner = manager.inner.lock().unwrap();
                    inner
                        .connections
                        .values()
                        .map(|c| Arc::clone(&c.send))
                        .collect()
                };
                let frame = WsMessage::new(MessageType::Ping).to_json();
                for send in targets {
                    let _ = send(frame.clone()).await;
                }
            }
        }));
    }

    /// Stop the ping loop.
    pub fn stop_ping_loop(&self) {
        if let Some(task) = self.ping_task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn get_connection(&self, connection_id: &str) -> Option<WsConnection> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .get(connection_id)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    pub fn user_connection_ids(&self, user_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .user_index
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for WebSocketManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
