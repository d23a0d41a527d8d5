//! Repository functions — one function per database operation.
//!
//! Every function takes a `&PgPool` (or the caller's connection when it must
//! join a transaction) and returns a `Result<T, DbError>`. No business logic.

pub mod blueprints;
pub mod delegations;
pub mod escalations;
pub mod executions;
pub mod records;
