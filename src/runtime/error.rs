//! Error types for the process engine
//!
//! Structural failures are fatal to the current operation sequence and are
//! surfaced immediately. Listener failures carry the user error as their source.

use thiserror::Error;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was asked to do something the execution tree does not allow
    /// (double take, unknown transition, operating on an ended execution).
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A lookup returned no row where one was required
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Kind of entity that was looked up
        entity: &'static str,
        /// Identifier or filter that was used
        id: String,
    },

    /// A single-result query matched more than one row
    #[error("Query for {entity} returned {count} results, expected at most one")]
    NonUniqueResult {
        /// Kind of entity that was queried
        entity: &'static str,
        /// Number of matching rows
        count: usize,
    },

    /// A listener descriptor resolved to something that cannot serve as the
    /// required delegate
    #[error("Delegate resolution failed for '{implementation}': {detail}")]
    DelegateResolution {
        /// Description of the listener implementation that was resolved
        implementation: String,
        /// What went wrong
        detail: String,
    },

    /// User listener code returned an error
    #[error("Listener '{listener}' failed on '{event}' event: {source}")]
    ListenerInvocation {
        /// Description of the failing listener
        listener: String,
        /// Event that was being dispatched
        event: String,
        /// Error raised by the listener
        source: anyhow::Error,
    },

    /// A process definition failed validation
    #[error("Invalid process definition: {0}")]
    InvalidDefinition(String),

    /// An expression could not be parsed or evaluated
    #[error("Invalid expression '{expression}': {detail}")]
    InvalidExpression {
        /// Expression source text
        expression: String,
        /// What went wrong
        detail: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn illegal_state(message: impl Into<String>) -> Self {
        EngineError::IllegalState(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether this error was raised by user listener code
    pub fn is_listener_failure(&self) -> bool {
        matches!(self, EngineError::ListenerInvocation { .. })
    }
}

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
