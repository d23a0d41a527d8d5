//! Action-level error type.

use thiserror::Error;

/// Errors returned by a handler's `execute` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable` — dispatch is attempted again with exponential back-off.
/// - `Fatal`     — the action is reported as failed straight away.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Transient failure (timeout, 5xx, lock contention).
    #[error("retryable action error: {0}")]
    Retryable(String),

    /// Permanent failure; retrying will not help.
    #[error("fatal action error: {0}")]
    Fatal(String),
}

impl ActionError {
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Fatal(msg) => msg,
        }
    }
}
