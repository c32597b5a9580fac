//! Shared domain types for Skein.
//!
//! This crate contains the core domain types used across the Skein workflow
//! platform: workflow definitions and execution state, trigger configuration,
//! and the event envelope exchanged on the event bus.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, semver,
//! thiserror.

pub mod event;
pub mod trigger;
pub mod workflow;
