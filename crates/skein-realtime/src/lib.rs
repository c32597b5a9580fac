//! Real-time distribution for Skein dashboards.
//!
//! Three cooperating pieces: a transport-agnostic WebSocket session
//! manager with per-user connection caps, in-process pub/sub topics with
//! retained-last delivery, and periodic metric streams with pause/resume.

pub mod pubsub;
pub mod streams;
pub mod websocket;
