//! Engine-level error types.

use thiserror::Error;

use crate::store::StoreError;

/// Errors produced by the blueprint engine (authoring + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown blueprint, state, transition, execution, approval request or record.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The operation is not legal right now: guard conditions no longer hold,
    /// requirements are unmet, the execution is in the wrong status, or another
    /// execution already holds the slot.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Malformed authoring input (unknown operator, bad requirement config, ...).
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// A transition or escalation action could not be dispatched. Never aborts a
    /// committed transition; surfaced in the dispatch report instead.
    #[error("action '{action_type}' failed: {message}")]
    ActionDispatchFailed { action_type: String, message: String },

    /// Persistence error from the configured store.
    #[error("store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound { kind, id: id.to_string() }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            StoreError::Conflict(msg) => Self::PreconditionFailed(msg),
            other => Self::Store(other),
        }
    }
}
