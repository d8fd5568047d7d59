//! Core types shared across the foreman crates.
//!
//! This crate holds the pieces every orchestration component agrees on: the
//! unified error enum and the abstract signal contract that components publish
//! lifecycle events through.
//!
//! # Main types
//!
//! - [`ForemanError`]: Unified error enum for all foreman subsystems.
//! - [`ForemanResult`]: Convenience alias for `Result<T, ForemanError>`.
//! - [`OrchestratorEvent`]: A named signal with a structured payload.
//! - [`EventSink`]: Abstract publish contract for signals.
//! - [`EventBus`]: Broadcast-backed [`EventSink`] with subscription support.

/// Signals emitted by the orchestration components.
pub mod event;

pub use event::{Envelope, EventBus, EventSink, NullSink, OrchestratorEvent};

// --- Error types ---

/// Top-level error type for the foreman workspace.
///
/// Variants follow the failure taxonomy of the engine: capacity and
/// referential errors surface synchronously to the caller, handler errors are
/// recorded on the task, planning errors never leave the planner.
#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// A bounded resource (queue slots, sub-agent slots) is exhausted.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// The referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of entity (`task`, `agent`, `goal`, `plan`, `persona`).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A status change the state machine does not allow.
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Identifier of the entity.
        id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// An entity with the same identifier already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A task handler failed or timed out.
    #[error("Handler error: {0}")]
    Handler(String),

    /// The planning collaborator failed or returned unusable output.
    #[error("Planning error: {0}")]
    Planning(String),

    /// A store collaborator failed.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForemanError {
    /// Shorthand for a [`ForemanError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Shorthand for a [`ForemanError::InvalidTransition`].
    pub fn invalid_transition(
        id: impl ToString,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether this error reports a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this error reports an exhausted capacity.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity(_))
    }
}

/// A convenience `Result` alias using [`ForemanError`].
pub type ForemanResult<T> = Result<T, ForemanError>;
