//! # relorm-db-backends
//!
//! Connection implementations for relorm. Provides connection configuration
//! and opening for every configured database alias.
//!
//! Supported backends:
//! - `SQLite` (feature `sqlite`), through `rusqlite` on the blocking pool
//!
//! PostgreSQL and MySQL are compiled for by the query engine but have no
//! driver here.

pub mod base;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use base::{connect, connect_all, DatabaseConfig};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConnection;
