//! Schedule trigger: fire workflows on a five-field cron expression.
//!
//! `CronExpression` is the field matcher (`minute hour day month weekday`
//! with `*`, exact values, `N-M` ranges, `*/S` steps, and `N,M` lists);
//! `next_run` walks forward one minute at a time. `ScheduleTrigger` runs a
//! loop that sleeps until the next match, fires, and retries failed firings
//! when configured.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use skein_types::trigger::{TriggerConfig, TriggerKind};

use super::{Trigger, TriggerError, TriggerState};

// ---------------------------------------------------------------------------
// CronExpression
// ---------------------------------------------------------------------------

/// A five-field cron expression: `minute hour day month weekday`.
///
/// Weekdays are 0 = Monday through 6 = Sunday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    pub minute: String,
    pub hour: String,
    pub day: String,
    pub month: String,
    pub weekday: String,
}

impl CronExpression {
    /// Parse from a whitespace-separated string. Missing trailing fields
    /// default to `*`.
    pub fn parse(expr: &str) -> Result<Self, TriggerError> {
        let mut parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.is_empty() || parts.len() > 5 {
            return Err(TriggerError::InvalidConfig(format!(
                "invalid cron expression: '{expr}'"
            )));
        }
        while parts.len() < 5 {
            parts.push("*");
        }

        let cron = Self {
            minute: parts[0].to_string(),
            hour: parts[1].to_string(),
            day: parts[2].to_string(),
            month: parts[3].to_string(),
            weekday: parts[4].to_string(),
        };

        // Every field must parse against its own value range
        for (pattern, min, max) in [
            (&cron.minute, 0u32, 59u32),
            (&cron.hour, 0, 23),
            (&cron.day, 1, 31),
            (&cron.month, 1, 12),
            (&cron.weekday, 0, 6),
        ] {
            if !field_is_valid(pattern, min, max) {
                return Err(TriggerError::InvalidConfig(format!(
                    "invalid cron field '{pattern}' in '{expr}'"
                )));
            }
        }

        Ok(cron)
    }

    /// Whether the given instant matches every field.
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        field_matches(&self.minute, dt.minute())
            && field_matches(&self.hour, dt.hour())
            && field_matches(&self.day, dt.day())
            && field_matches(&self.month, dt.month())
            && field_matches(&self.weekday, dt.weekday().num_days_from_monday())
    }

    /// First matching instant strictly after `after`, searching up to one
    /// year ahead in one-minute steps. Falls back to one hour out when the
    /// expression never matches within the horizon.
    pub fn next_run(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let mut dt = after
            .with_second(0)
            .and_then(|d| d.with_nanosecond(0))
            .unwrap_or(after)
            + ChronoDuration::minutes(1);

        let max_iterations = 366 * 24 * 60;
        for _ in 0..max_iterations {
            if self.matches(&dt) {
                return dt;
            }
            dt += ChronoDuration::minutes(1);
        }

        after + ChronoDuration::hours(1)
    }
}

impl std::fmt::Display for CronExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day, self.month, self.weekday
        )
    }
}

/// Match a single field pattern against a value.
fn field_matches(pattern: &str, value: u32) -> bool {
    if pattern == "*" {
        return true;
    }

    // Step: */S
    if let Some(step) = pattern.strip_prefix("*/") {
        return match step.parse::<u32>() {
            Ok(s) if s > 0 => value % s == 0,
            _ => false,
        };
    }

    // List: N,M,...
    if pattern.contains(',') {
        return pattern
            .split(',')
            .any(|part| field_matches(part.trim(), value));
    }

    // Range: N-M
    if let Some((start, end)) = pattern.split_once('-') {
        return match (start.parse::<u32>(), end.parse::<u32>()) {
            (Ok(s), Ok(e)) => s <= value && value <= e,
            _ => false,
        };
    }

    // Exact value
    pattern.parse::<u32>().map(|v| v == value).unwrap_or(false)
}

/// Structural validity of a field pattern within `[min, max]`.
fn field_is_valid(pattern: &str, min: u32, max: u32) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(step) = pattern.strip_prefix("*/") {
        return step.parse::<u32>().map(|s| s > 0).unwrap_or(false);
    }
    if pattern.contains(',') {
        return pattern
            .split(',')
            .all(|part| field_is_valid(part.trim(), min, max));
    }
    if let Some((start, end)) = pattern.split_once('-') {
        return match (start.parse::<u32>(), end.parse::<u32>()) {
            (Ok(s), Ok(e)) => min <= s && s <= e && e <= max,
            _ => false,
        };
    }
    pattern
        .parse::<u32>()
        .map(|v| min <= v && v <= max)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

/// Common schedules by name.
pub const SCHEDULE_PRESETS: &[(&str, &str)] = &[
    ("every_minute", "* * * * *"),
    ("every_5_minutes", "*/5 * * * *"),
    ("every_15_minutes", "*/15 * * * *"),
    ("every_30_minutes", "*/30 * * * *"),
    ("hourly", "0 * * * *"),
    ("daily_midnight", "0 0 * * *"),
    ("daily_morning", "0 8 * * *"),
    ("weekdays_morning", "0 8 * * 0-4"),
    ("weekly_monday", "0 0 * * 0"),
    ("monthly_first", "0 0 1 * *"),
];

/// Look up a preset cron expression by name.
pub fn preset(name: &str) -> Option<&'static str> {
    SCHEDULE_PRESETS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, expr)| *expr)
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Schedule-specific configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub retry_on_failure: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
}

fn default_cron() -> String {
    "0 * * * *".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// ScheduleTrigger
// ---------------------------------------------------------------------------

/// Trigger fired on a cron schedule.
pub struct ScheduleTrigger {
    state: Arc<TriggerState>,
    settings: ScheduleSettings,
    cron: CronExpression,
    task: Mutex<Option<JoinHandle<()>>>,
    next_run: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl ScheduleTrigger {
    pub fn new(config: TriggerConfig) -> Result<Self, TriggerError> {
        let settings: ScheduleSettings =
            serde_json::from_value(Value::Object(config.config.clone()))
                .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?;
        // Accept preset names in place of raw expressions
        let expr = preset(&settings.cron).unwrap_or(&settings.cron);
        let cron = CronExpression::parse(expr)?;
        Ok(Self {
            state: Arc::new(TriggerState::new(config)),
            settings,
            cron,
            task: Mutex::new(None),
            next_run: Arc::new(Mutex::new(None)),
        })
    }

    pub fn cron(&self) -> &CronExpression {
        &self.cron
    }

    /// The next scheduled firing, once the loop has computed it.
    pub fn next_scheduled(&self) -> Option<DateTime<Utc>> {
        *self.next_run.lock().unwrap()
    }

    /// Replace the cron expression.
    pub fn update_schedule(&mut self, cron: &str) -> Result<(), TriggerError> {
        let expr = preset(cron).unwrap_or(cron);
        self.cron = CronExpression::parse(expr)?;
        self.settings.cron = cron.to_string();
        Ok(())
    }

    async fn run_loop(
        state: Arc<TriggerState>,
        cron: CronExpression,
        settings: ScheduleSettings,
        next_slot: Arc<Mutex<Option<DateTime<Utc>>>>,
    ) {
        loop {
            let next = cron.next_run(Utc::now());
            *next_slot.lock().unwrap() = Some(next);

            let wait = (next - Utc::now()).num_milliseconds().max(0) as u64;
            tracing::debug!(
                trigger_id = state.config.id.as_str(),
                wait_ms = wait,
                next = %next,
                "schedule sleeping until next run"
            );
            tokio::time::sleep(std::time::Duration::from_millis(wait)).await;

            if !state.is_active() {
                continue;
            }

            tracing::info!(
                trigger_id = state.config.id.as_str(),
                "schedule trigger firing"
            );
            let mut inputs = HashMap::new();
            inputs.insert("scheduled_time".to_string(), json!(next.to_rfc3339()));
            inputs.insert("actual_time".to_string(), json!(Utc::now().to_rfc3339()));
            let mut metadata = HashMap::new();
            metadata.insert("cron".to_string(), json!(cron.to_string()));
            metadata.insert("timezone".to_string(), json!(settings.timezone.clone()));

            let result = state.fire(inputs, metadata).await;

            if !result.success && settings.retry_on_failure {
                Self::retry_firing(&state, &settings, next).await;
            }
        }
    }

    async fn retry_firing(
        state: &Arc<TriggerState>,
        settings: &ScheduleSettings,
        scheduled: DateTime<Utc>,
    ) {
        for attempt in 1..=settings.max_retries {
            tokio::time::sleep(std::time::Duration::from_secs(settings.retry_delay_seconds))
                .await;
            tracing::info!(
                trigger_id = state.config.id.as_str(),
                attempt,
                "schedule retry firing"
            );

            let mut inputs = HashMap::new();
            inputs.insert("retry_attempt".to_string(), json!(attempt));
            inputs.insert("scheduled_time".to_string(), json!(scheduled.to_rfc3339()));

            let result = state.fire(inputs, HashMap::new()).await;
            if result.success {
                return;
            }
        }
        tracing::error!(
            trigger_id = state.config.id.as_str(),
            retries = settings.max_retries,
            "schedule firing failed after retries"
        );
    }
}

impl Trigger for ScheduleTrigger {
    fn kind(&self) -> TriggerKind {
        TriggerKind::Schedule
    }

    fn state(&self) -> &TriggerState {
        &self.state
    }

    fn start<'a>(&'a self) -> BoxFuture<'a, Result<(), TriggerError>> {
        Box::pin(async move {
            let mut task = self.task.lock().unwrap();
            if task.is_some() {
                return Ok(());
            }
            let handle = tokio::spawn(Self::run_loop(
                Arc::clone(&self.state),
                self.cron.clone(),
                self.settings.clone(),
                Arc::clone(&self.next_run),
            ));
            *task = Some(handle);
            tracing::info!(
                trigger_id = self.state.config.id.as_str(),
                cron = %self.cron,
                "schedule trigger started"
            );
            Ok(())
        })
    }

    fn stop<'a>(&'a self) -> BoxFuture<'a, Result<(), TriggerError>> {
        Box::pin(async move {
            if let Some(handle) = self.task.lock().unwrap().take() {
                handle.abort();
            }
            tracing::info!(
                trigger_id = self.state.config.id.as_str(),
                "schedule trigger stopped"
            );
            Ok(())
        })
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.state.config.workflow_id.is_empty() {
            errors.push("workflow_id is required".to_string());
        }
        errors
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
