//! Typed error type for the db crate.

use engine::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A guarded update matched no row: someone else changed it first.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored column could not be turned back into a domain value.
    #[error("corrupt row: {0}")]
    Decode(String),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound { kind, id: id.to_string() }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound { kind, id } => StoreError::NotFound { kind, id },
            DbError::Conflict(msg) => StoreError::Conflict(msg),
            DbError::Sqlx(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_owned())
            }
            DbError::Sqlx(sqlx::Error::RowNotFound) => StoreError::NotFound { kind: "row", id: String::new() },
            other => StoreError::Backend(other.to_string()),
        }
    }
}
