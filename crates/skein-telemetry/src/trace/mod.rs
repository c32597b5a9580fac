//! Agent/LLM observability: trace collection and replay derivation.

pub mod collector;
pub mod replay;
