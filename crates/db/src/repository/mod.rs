//! Repository functions: one function per database operation.
//!
//! Every function takes a `&DbPool` (or a transaction) and returns
//! `Result<T, DbError>`. Queries are checked at runtime, so the crate builds
//! without a live database.

pub mod credentials;
pub mod flows;
pub mod issues;
pub mod runs;
