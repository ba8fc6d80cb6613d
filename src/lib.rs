//! Braid – an execution-tree process engine
//!
//! This crate interprets process definitions as trees of executions:
//! - A trampoline of single-step operations, so graph size never grows the stack
//! - Nested scopes for sub-processes and concurrent branches with identity-stable joins
//! - Signal and message subscriptions correlating inbound events to waiting executions
//! - Execution and task listeners, invoked synchronously or deferred to a transaction stage

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Engine core: definitions, execution trees, interpreter, listeners and events
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{EngineConfig, EngineError, ProcessEngine};

/// Current version of Braid
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
