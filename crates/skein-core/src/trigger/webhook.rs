//! Webhook trigger: dispatch workflows from HTTP requests.
//!
//! The HTTP transport itself is an external collaborator; this module owns
//! everything behind it: method allow-list, per-IP rate caps, HMAC-SHA256
//! signature verification (constant-time, `sha256=` prefix optional),
//! payload schema validation, and dotted-path input mapping. Each rejection
//! produces a `TriggerResult` with a distinct error message so the
//! transport can map it to 401/405/429/400.

use std::collections::HashMap;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Sha256;
use uuid::Uuid;

use skein_types::trigger::{TriggerConfig, TriggerKind, TriggerResult};

use super::{Trigger, TriggerError, TriggerState};

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Webhook-specific configuration, parsed from the trigger's config map.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSettings {
    /// Endpoint path under `/webhooks/`; defaults to the trigger id.
    #[serde(default)]
    pub path: String,
    /// Allowed HTTP methods.
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    /// Shared secret for HMAC signatures; generated when absent.
    #[serde(default = "generate_secret")]
    pub secret: String,
    #[serde(default)]
    pub require_signature: bool,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    /// Requests allowed per IP per window. Zero rejects everything.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Optional JSON schema the payload must satisfy.
    #[serde(default)]
    pub payload_schema: Option<Value>,
    /// Dotted source path -> workflow input key.
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
}

fn default_methods() -> Vec<String> {
    vec!["POST".to_string()]
}

fn default_signature_header() -> String {
    "X-Webhook-Signature".to_string()
}

fn default_rate_limit() -> u32 {
    100
}

fn generate_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Signature helpers
// ---------------------------------------------------------------------------

/// Compute the HMAC-SHA256 signature of `body` as lowercase hex.
pub fn compute_signature_hex(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret)
        .expect("hmac accepts keys of any length");
    mac.update(body);
    hex_encode(&mac.finalize().into_bytes())
}

/// Verify a signature against `body`, accepting an optional `sha256=`
/// prefix. Comparison is constant-time via the hmac crate.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex_decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

// ---------------------------------------------------------------------------
// WebhookTrigger
// ---------------------------------------------------------------------------

/// Trigger fired by inbound webhook requests.
pub struct WebhookTrigger {
    state: TriggerState,
    settings: WebhookSettings,
    /// Per-IP request counts for the current window.
    request_counts: DashMap<String, u32>,
}

impl WebhookTrigger {
    pub fn new(config: TriggerConfig) -> Result<Self, TriggerError> {
        let settings: WebhookSettings =
            serde_json::from_value(Value::Object(config.config.clone()))
                .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            state: TriggerState::new(config),
            settings,
            request_counts: DashMap::new(),
        })
    }

    pub fn settings(&self) -> &WebhookSettings {
        &self.settings
    }

    /// The endpoint path: the configured path, or the trigger id.
    pub fn endpoint_path(&self) -> &str {
        if self.settings.path.is_empty() {
            &self.state.config.id
        } else {
            &self.settings.path
        }
    }

    /// The full relative URL the transport should route here.
    pub fn full_url(&self) -> String {
        format!("/webhooks/{}", self.endpoint_path())
    }

    /// Process one inbound request.
    ///
    /// Checks, in order: method allow-list, per-IP rate cap, signature (when
    /// required), payload schema. Any rejection produces a `TriggerResult`
    /// with `success = false` and a distinct error message; no workflow is
    /// dispatched. Accepted requests map the payload into workflow inputs
    /// and fire the trigger.
    pub async fn handle_request(
        &self,
        method: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
        payload: Option<&Value>,
        client_ip: Option<&str>,
    ) -> TriggerResult {
        let reject = |error: String| {
            let result = TriggerResult::rejected(
                self.state.config.id.clone(),
                self.state.config.workflow_id.clone(),
                error,
            );
            self.state.record(result.clone());
            result
        };

        let method_upper = method.to_uppercase();
        if !self
            .settings
            .methods
            .iter()
            .any(|m| m.to_uppercase() == method_upper)
        {
            return reject(format!("method {method} not allowed"));
        }

        if let Some(ip) = client_ip {
            if !self.check_rate_limit(ip) {
                return reject("rate limit exceeded".to_string());
            }
        }

        if self.settings.require_signature {
            let signature = header_lookup(headers, &self.settings.signature_header);
            let valid = signature
                .map(|sig| verify_signature(self.settings.secret.as_bytes(), body, sig))
                .unwrap_or(false);
            if !valid {
                return reject("invalid signature".to_string());
            }
        }

        let payload = payload.cloned().unwrap_or_else(|| json!({}));

        if let Some(schema) = &self.settings.payload_schema {
            if let Err(error) = validate_payload(schema, &payload) {
                return reject(format!("payload validation failed: {error}"));
            }
        }

        let inputs = self.map_inputs(&payload);
        let mut metadata = HashMap::new();
        metadata.insert("method".to_string(), json!(method_upper));
        if let Some(ip) = client_ip {
            metadata.insert("client_ip".to_string(), json!(ip));
        }

        let result = self.state.fire(inputs, metadata).await;
        tracing::info!(
            trigger_id = self.state.config.id.as_str(),
            execution_id = result.execution_id.as_deref().unwrap_or("-"),
            "webhook dispatched"
        );
        result
    }

    /// Sign a body the way a well-behaved client would.
    pub fn sign_body(&self, body: &[u8]) -> String {
        format!(
            "sha256={}",
            compute_signature_hex(self.settings.secret.as_bytes(), body)
        )
    }

    /// Reset all per-IP counters. Callers decide the window cadence.
    pub fn reset_rate_window(&self) {
        self.request_counts.clear();
    }

    fn check_rate_limit(&self, client_ip: &str) -> bool {
        let mut count = self.request_counts.entry(client_ip.to_string()).or_insert(0);
        if *count >= self.settings.rate_limit {
            return false;
        }
        *count += 1;
        true
    }

    /// Map payload fields into workflow inputs via the dotted-path mapping,
    /// always including the full payload as `_payload`.
    fn map_inputs(&self, payload: &Value) -> HashMap<String, Value> {
        let mut inputs: HashMap<String, Value> = HashMap::new();

        if self.settings.input_mapping.is_empty() {
            if let Value::Object(map) = payload {
                for (k, v) in map {
                    inputs.insert(k.clone(), v.clone());
                }
            }
        } else {
            for (target, source_path) in &self.settings.input_mapping {
                if let Some(value) = nested_lookup(payload, source_path) {
                    inputs.insert(target.clone(), value.clone());
                }
            }
        }

        inputs.insert("_payload".to_string(), payload.clone());
        inputs
    }
}

impl Trigger for WebhookTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Webhook
    }

    fn state(&self) -> &TriggerState {
        &self.state
    }

    fn start<'a>(&'a self) -> BoxFuture<'a, Result<(), TriggerError>> {
        Box::pin(async move {
            tracing::info!(
                trigger_id = self.state.config.id.as_str(),
                url = self.full_url().as_str(),
                "webhook trigger started"
            );
            Ok(())
        })
    }

    fn stop<'a>(&'a self) -> BoxFuture<'a, Result<(), TriggerError>> {
        Box::pin(async move {
            tracing::info!(
                trigger_id = self.state.config.id.as_str(),
                "webhook trigger stopped"
            );
            Ok(())
        })
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.state.config.workflow_id.is_empty() {
            errors.push("workflow_id is required".to_string());
        }
        if self.endpoint_path().is_empty() {
            errors.push("path is required for webhook".to_string());
        }
        errors
    }
}

/// Case-insensitive header lookup.
fn header_lookup<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Walk a dotted path (`data.user.name`) through a JSON value.
fn nested_lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}

fn validate_payload(schema: &Value, payload: &Value) -> Result<(), String> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| format!("bad schema: {e}"))?;
    if let Err(errors) = compiled.validate(payload) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(messages.join("; "));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
