//! `db` crate: Postgres persistence for flows, runs, credentials and
//! validation issues.
//!
//! Row structs map 1-to-1 onto tables and convert into the `engine` domain
//! types; [`PgRunStore`] implements the engine's run store boundary.

pub mod error;
pub mod models;
pub mod pool;
pub mod repository;

pub use error::DbError;
pub use pool::{connect, run_migrations, DbPool, PoolSettings};
pub use repository::credentials::PgCredentialResolver;
pub use repository::runs::PgRunStore;
