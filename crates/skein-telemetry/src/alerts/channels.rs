//! Notification channels: deliver alert events to external destinations.
//!
//! All channel kinds share one dispatch discipline: the per-hour rate cap
//! is enforced before any I/O, delivery outcomes update `last_sent` /
//! `last_error` on the channel record, and a failed delivery never aborts
//! alert evaluation. HTTP-backed kinds (Slack, Teams, PagerDuty, Discord,
//! generic webhook) post JSON bodies; generic webhooks can be HMAC-signed.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;
use uuid::Uuid;

use super::engine::AlertEvent;
use super::rules::AlertSeverity;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Channel configuration
// ---------------------------------------------------------------------------

/// Destination-specific configuration, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Email {
        recipients: Vec<String>,
        #[serde(default)]
        subject_template: String,
    },
    Slack {
        webhook_url: String,
        #[serde(default)]
        channel: String,
        #[serde(default = "default_slack_username")]
        username: String,
    },
    Teams {
        webhook_url: String,
    },
    Pagerduty {
        integration_key: String,
    },
    Webhook {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Optional HMAC secret; the hex signature is sent as
        /// `X-Signature: sha256=<hex>`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signing_secret: Option<String>,
    },
    Sms {
        numbers: Vec<String>,
    },
    Discord {
        webhook_url: String,
    },
}

fn default_slack_username() -> String {
    "Alert Bot".to_string()
}

impl ChannelConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Email { .. } => "email",
            Self::Slack { .. } => "slack",
            Self::Teams { .. } => "teams",
            Self::Pagerduty { .. } => "pagerduty",
            Self::Webhook { .. } => "webhook",
            Self::Sms { .. } => "sms",
            Self::Discord { .. } => "discord",
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationChannel
// ---------------------------------------------------------------------------

/// Delivery state tracked per channel.
#[derive(Debug, Default)]
struct DeliveryState {
    last_sent: Option<DateTime<Utc>>,
    last_error: Option<String>,
    window_start: Option<DateTime<Utc>>,
    sent_in_window: u32,
}

/// A configured notification destination with a per-hour rate cap.
pub struct NotificationChannel {
    pub id: String,
    pub name: String,
    pub config: ChannelConfig,
    pub enabled: bool,
    pub rate_limit_per_hour: u32,
    state: Mutex<DeliveryState>,
    http: reqwest::Client,
}

impl NotificationChannel {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            config,
            enabled: true,
            rate_limit_per_hour: 60,
            state: Mutex::new(DeliveryState::default()),
            http: reqwest::Client::new(),
        }
    }

    pub fn last_sent(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_sent
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_error.clone()
    }

    /// Deliver an alert event. Returns whether the delivery succeeded.
    ///
    /// A disabled channel or an exhausted rate window returns false without
    /// touching the wire.
    pub async fn send(&self, event: &AlertEvent) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.consume_rate_slot() {
            tracing::warn!(channel = self.name.as_str(), "channel rate limited");
            return false;
        }

        let outcome = match &self.config {
            ChannelConfig::Slack { webhook_url, .. } => {
                self.post_json(webhook_url, slack_payload(&self.config, event), &HashMap::new())
                    .await
            }
            ChannelConfig::Teams { webhook_url } => {
                self.post_json(webhook_url, teams_payload(event), &HashMap::new())
                    .await
            }
            ChannelConfig::Pagerduty { integration_key } => {
                self.post_json(
                    "https://events.pagerduty.com/v2/enqueue",
                    pagerduty_payload(integration_key, event),
                    &HashMap::new(),
                )
                .await
            }
            ChannelConfig::Discord { webhook_url } => {
                self.post_json(webhook_url, discord_payload(event), &HashMap::new())
                    .await
            }
            ChannelConfig::Webhook {
                url,
                headers,
                signing_secret,
            } => {
                let payload = webhook_payload(event);
                let mut all_headers = headers.clone();
                if let Some(secret) = signing_secret {
                    let body = payload.to_string();
                    all_headers.insert(
                        "X-Signature".to_string(),
                        format!("sha256={}", sign(secret.as_bytes(), body.as_bytes())),
                    );
                }
                self.post_json(url, payload, &all_headers).await
            }
            // Email and SMS transports are deployment-specific; the channel
            // records the delivery and leaves the wire to an integration.
            ChannelConfig::Email { recipients, .. } => {
                tracing::info!(
                    channel = self.name.as_str(),
                    recipients = recipients.len(),
                    rule = event.rule_name.as_str(),
                    "email notification"
                );
                Ok(())
            }
            ChannelConfig::Sms { numbers } => {
                tracing::info!(
                    channel = self.name.as_str(),
                    numbers = numbers.len(),
                    rule = event.rule_name.as_str(),
                    "sms notification"
                );
                Ok(())
            }
        };

        let mut state = self.state.lock().unwrap();
        match outcome {
            Ok(()) => {
                state.last_sent = Some(Utc::now());
                state.last_error = None;
                true
            }
            Err(error) => {
                tracing::error!(
                    channel = self.name.as_str(),
                    error = error.as_str(),
                    "channel delivery failed"
                );
                state.last_error = Some(error);
                false
            }
        }
    }

    async fn post_json(
        &self,
        url: &str,
        payload: Value,
        headers: &HashMap<String, String>,
    ) -> Result<(), String> {
        let mut request = self.http.post(url).json(&payload);
        for (key, value) in headers {
            request = request.header(key, value);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("destination returned {}", response.status()))
        }
    }

    /// Take one slot from the hourly window; false when exhausted.
    fn consume_rate_slot(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        let reset = match state.window_start {
            Some(start) => now - start >= Duration::hours(1),
            None => true,
        };
        if reset {
            state.window_start = Some(now);
            state.sent_in_window = 0;
        }

        if state.sent_in_window >= self.rate_limit_per_hour {
            return false;
        }
        state.sent_in_window += 1;
        true
    }
}

// ---------------------------------------------------------------------------
// Payload builders
// ---------------------------------------------------------------------------

fn severity_color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Critical => "#dc2626",
        AlertSeverity::Error => "#ef4444",
        AlertSeverity::Warning => "#f59e0b",
        AlertSeverity::Info => "#3b82f6",
    }
}

fn slack_payload(config: &ChannelConfig, event: &AlertEvent) -> Value {
    let username = match config {
        ChannelConfig::Slack { username, .. } => username.as_str(),
        _ => "Alert Bot",
    };
    json!({
        "username": username,
        "attachments": [{
            "color": severity_color(event.severity),
            "title": event.rule_name,
            "text": event.message,
            "fields": [
                {"title": "State", "value": event.state, "short": true},
                {"title": "Severity", "value": event.severity, "short": true},
            ],
            "ts": event.timestamp.timestamp(),
        }],
    })
}

fn teams_payload(event: &AlertEvent) -> Value {
    json!({
        "@type": "MessageCard",
        "themeColor": severity_color(event.severity).trim_start_matches('#'),
        "title": event.rule_name,
        "text": event.message,
        "sections": [{
            "facts": [
                {"name": "State", "value": event.state},
                {"name": "Severity", "value": event.severity},
            ],
        }],
    })
}

fn pagerduty_payload(integration_key: &str, event: &AlertEvent) -> Value {
    let action = match event.state {
        super::rules::AlertState::Resolved | super::rules::AlertState::Ok => "resolve",
        _ => "trigger",
    };
    json!({
        "routing_key": integration_key,
        "event_action": action,
        "dedup_key": event.rule_id,
        "payload": {
            "summary": if event.message.is_empty() { &event.rule_name } else { &event.message },
            "severity": event.severity,
            "source": "skein",
            "custom_details": event.values,
        },
    })
}

fn discord_payload(event: &AlertEvent) -> Value {
    json!({
        "embeds": [{
            "title": event.rule_name,
            "description": event.message,
            "color": i64::from_str_radix(severity_color(event.severity).trim_start_matches('#'), 16).unwrap_or(0),
            "fields": [
                {"name": "State", "value": event.state, "inline": true},
                {"name": "Severity", "value": event.severity, "inline": true},
            ],
        }],
    })
}

fn webhook_payload(event: &AlertEvent) -> Value {
    serde_json::to_value(event).unwrap_or_else(|_| json!({}))
}

fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret)
        .expect("hmac accepts keys of any length");
    mac.update(body);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::rules::AlertState;

    fn event() -> AlertEvent {
        AlertEvent {
            rule_id: "r1".to_string(),
            rule_name: "High Error Rate".to_string(),
            state: AlertState::Firing,
            severity: AlertSeverity::Critical,
            timestamp: Utc::now(),
            message: "error rate above 5%".to_string(),
            values: HashMap::from([("error_rate".to_string(), 0.09)]),
            labels: HashMap::new(),
        }
    }

    fn email_channel() -> NotificationChannel {
        NotificationChannel::new(
            "ops-email",
            ChannelConfig::Email {
                recipients: vec!["ops@example.com".to_string()],
                subject_template: String::new(),
            },
        )
    }

    // -------------------------------------------------------------------
    // Dispatch discipline
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn disabled_channel_refuses_delivery() {
        let mut channel = email_channel();
        channel.enabled = false;
        assert!(!channel.send(&event()).await);
        assert!(channel.last_sent().is_none());
    }

    #[tokio::test]
    async fn rate_cap_applies_before_io() {
        let mut channel = email_channel();
        channel.rate_limit_per_hour = 2;

        assert!(channel.send(&event()).await);
        assert!(channel.send(&event()).await);
        assert!(!channel.send(&event()).await);
    }

    #[tokio::test]
    async fn successful_delivery_updates_last_sent() {
        let channel = email_channel();
        assert!(channel.send(&event()).await);
        assert!(channel.last_sent().is_some());
        assert!(channel.last_error().is_none());
    }

    #[tokio::test]
    async fn failed_delivery_records_last_error() {
        // An unroutable URL fails fast and surfaces on the record
        let channel = NotificationChannel::new(
            "bad-hook",
            ChannelConfig::Webhook {
                url: "http://127.0.0.1:1/hook".to_string(),
                headers: HashMap::new(),
                signing_secret: None,
            },
        );
        assert!(!channel.send(&event()).await);
        assert!(channel.last_error().is_some());
    }

    // -------------------------------------------------------------------
    // Payload shapes
    // -------------------------------------------------------------------

    #[test]
    fn slack_payload_carries_severity_color() {
        let config = ChannelConfig::Slack {
            webhook_url: "https://hooks.slack.example/x".to_string(),
            channel: "#ops".to_string(),
            username: "Alert Bot".to_string(),
        };
        let payload = slack_payload(&config, &event());
        assert_eq!(payload["attachments"][0]["color"], json!("#dc2626"));
        assert_eq!(payload["attachments"][0]["title"], json!("High Error Rate"));
    }

    #[test]
    fn pagerduty_resolves_on_resolved_state() {
        let mut resolved = event();
        resolved.state = AlertState::Resolved;
        let payload = pagerduty_payload("key123", &resolved);
        assert_eq!(payload["event_action"], json!("resolve"));
        assert_eq!(payload["routing_key"], json!("key123"));

        let firing = pagerduty_payload("key123", &event());
        assert_eq!(firing["event_action"], json!("trigger"));
    }

    #[test]
    fn webhook_payload_is_the_full_event() {
        let payload = webhook_payload(&event());
        assert_eq!(payload["rule_id"], json!("r1"));
        assert_eq!(payload["state"], json!("firing"));
        assert_eq!(payload["values"]["error_rate"], json!(0.09));
    }

    #[test]
    fn discord_color_is_numeric() {
        let payload = discord_payload(&event());
        assert_eq!(payload["embeds"][0]["color"], json!(0xdc2626));
    }

    #[test]
    fn signing_is_deterministic() {
        let a = sign(b"secret", b"body");
        let b = sign(b"secret", b"body");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(sign(b"other", b"body"), a);
    }

    #[test]
    fn channel_config_roundtrip() {
        let config = ChannelConfig::Webhook {
            url: "https://example.com/hook".to_string(),
            headers: HashMap::from([("X-Env".to_string(), "prod".to_string())]),
            signing_secret: Some("s".to_string()),
        };
        let json_str = serde_json::to_string(&config).unwrap();
        assert!(json_str.contains("\"type\":\"webhook\""));
        let parsed: ChannelConfig = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.kind(), "webhook");
    }
}
