//! Durable workflow orchestration core for Skein.
//!
//! This crate drives user-defined step graphs with exactly-once step
//! semantics under failure: executions checkpoint their state between
//! steps, pause/resume re-enter from the latest valid checkpoint, and
//! failed steps retry with backoff or route to error branches. Around the
//! engine sit the trigger plane (webhook, cron schedule, event bus, file
//! watch), the pattern-matching event bus, and the assistant/optimizer
//! heuristics.
//!
//! Actual LLM execution is an injected collaborator
//! ([`workflow::handlers::agent::AgentInvoker`]); HTTP transports sit
//! outside the crate and call into the webhook trigger.

pub mod ai;
pub mod config;
pub mod event;
pub mod trigger;
pub mod workflow;
