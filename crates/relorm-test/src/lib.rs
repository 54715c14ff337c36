//! # relorm-test
//!
//! Testing utilities for relorm: an in-memory SQLite [`TestDatabase`] that
//! builds tables from a model registry and counts statements, a
//! forced-rollback mode that wraps a whole test in one transaction, and
//! query-count assertions for catching N+1 regressions.

pub mod assert_queries;
pub mod test_database;

pub use assert_queries::{assert_max_queries, assert_num_queries};
pub use test_database::TestDatabase;
