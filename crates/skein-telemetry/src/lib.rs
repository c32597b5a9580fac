//! Telemetry substrate for Skein workflows.
//!
//! Ingests the traces, metrics, and alerts running workflows produce:
//! tiered time-series storage with a PromQL-subset query engine, an
//! alert-rule state machine with rate-capped notification channels, trace
//! collection with replay derivation, and statistical insights (anomaly
//! detection, forecasting, recommendations).

pub mod alerts;
pub mod insights;
pub mod metrics;
pub mod trace;
