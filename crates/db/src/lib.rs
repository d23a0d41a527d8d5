//! `db` crate — Postgres persistence for the blueprint engine.
//!
//! Provides a connection pool, typed row structs, repository functions for
//! every table, and [`PgStore`], the `BlueprintStore` implementation the
//! worker runs against.

pub mod error;
pub mod models;
pub mod pool;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use pool::DbPool;
pub use store::PgStore;
