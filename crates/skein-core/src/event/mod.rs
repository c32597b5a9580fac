//! Event plane: the in-process pattern-matching event bus.

pub mod bus;

pub use bus::{EventBus, EventHandler, EventPredicate, matches_pattern};
