//! Query counting assertions for database tests.
//!
//! Provides [`assert_num_queries`] which counts the SQL statements executed
//! during an async closure and asserts that the count matches an expected
//! value. This is how N+1 regressions in prefetching are caught.
//!
//! ## Example
//!
//! ```rust,no_run
//! use relorm_db::{Connection, Value};
//! use relorm_test::assert_queries::assert_num_queries;
//! use relorm_test::test_database::TestDatabase;
//!
//! async fn example() {
//!     let db = TestDatabase::new();
//!     db.execute_raw("CREATE TABLE t (id INTEGER PRIMARY KEY, val TEXT)")
//!         .await
//!         .unwrap();
//!
//!     assert_num_queries(&db, 1, || async {
//!         db.execute("INSERT INTO t (val) VALUES (?)", &[Value::from("x")])
//!             .await
//!             .unwrap();
//!     })
//!     .await;
//! }
//! ```

use std::future::Future;

use crate::test_database::TestDatabase;

/// Asserts that exactly `expected_count` SQL statements are executed during
/// the async closure.
///
/// Resets the counter on the [`TestDatabase`] before running the closure.
///
/// # Panics
///
/// Panics if the number of statements does not match `expected_count`.
pub async fn assert_num_queries<F, Fut, T>(db: &TestDatabase, expected_count: usize, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    db.reset_query_count();
    let out = f().await;
    let actual = db.query_count();
    assert_eq!(
        actual, expected_count,
        "Expected {expected_count} SQL queries, but {actual} were executed"
    );
    out
}

/// Asserts that at most `max_count` SQL statements are executed during the
/// async closure.
///
/// # Panics
///
/// Panics if more than `max_count` statements are executed.
pub async fn assert_max_queries<F, Fut, T>(db: &TestDatabase, max_count: usize, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    db.reset_query_count();
    let out = f().await;
    let actual = db.query_count();
    assert!(
        actual <= max_count,
        "Expected at most {max_count} SQL queries, but {actual} were executed"
    );
    out
}
