//! The database connection contract.
//!
//! [`Connection`] is the bridge between the query engine and concrete
//! backends (see `relorm-db-backends`). The engine only talks to a database
//! through this trait and the dialect metadata in [`DatabaseBackendType`].

use std::future::Future;

use futures_util::stream::{self, BoxStream, StreamExt};
use relorm_core::{OrmError, OrmResult};

use crate::row::Row;
use crate::transactions::TransactionManager;
use crate::value::Value;

/// The SQL dialect family of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    /// PostgreSQL (uses `$1, $2, ...` placeholders).
    PostgreSQL,
    /// SQLite (uses `?` placeholders).
    SQLite,
    /// MySQL (uses `?` placeholders).
    MySQL,
}

impl DatabaseBackendType {
    /// Returns a parameter placeholder for the given 1-based index.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::PostgreSQL => format!("${index}"),
            Self::SQLite | Self::MySQL => "?".to_string(),
        }
    }

    /// Quotes an identifier.
    pub fn quote(self, ident: &str) -> String {
        match self {
            Self::MySQL => format!("`{}`", ident.replace('`', "``")),
            Self::PostgreSQL | Self::SQLite => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// The schema tables live in when none is given.
    pub const fn default_schema(self) -> Option<&'static str> {
        match self {
            Self::PostgreSQL => Some("public"),
            Self::SQLite => Some("main"),
            Self::MySQL => None,
        }
    }

    /// Whether `SELECT DISTINCT ON (...)` is available.
    pub const fn supports_distinct_on(self) -> bool {
        matches!(self, Self::PostgreSQL)
    }

    /// Whether `FOR UPDATE` / `FOR SHARE` are available.
    pub const fn supports_row_locking(self) -> bool {
        !matches!(self, Self::SQLite)
    }

    /// Whether `NOWAIT` and `SKIP LOCKED` are available.
    pub const fn supports_lock_wait_options(self) -> bool {
        !matches!(self, Self::SQLite)
    }

    /// Whether `FOR UPDATE OF <table>` is available.
    pub const fn supports_lock_of(self) -> bool {
        !matches!(self, Self::SQLite)
    }

    /// Whether `INTERSECT ALL` and `EXCEPT ALL` are available.
    pub const fn supports_intersect_except_all(self) -> bool {
        !matches!(self, Self::SQLite)
    }

    /// Whether row values may be compared with `IN (VALUES ...)`.
    pub const fn supports_values_list(self) -> bool {
        !matches!(self, Self::MySQL)
    }
}

/// Minimal async connection contract.
///
/// Transactions nest: the first `begin` opens a transaction, inner ones
/// create savepoints. Implementations keep the nesting state in a
/// [`TransactionManager`].
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Returns the dialect family for SQL compilation.
    fn backend_type(&self) -> DatabaseBackendType;

    /// The schema used when a model names none.
    fn default_schema(&self) -> Option<String> {
        self.backend_type().default_schema().map(str::to_string)
    }

    /// Runs a statement that does not return rows and reports affected rows.
    async fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<u64>;

    /// Runs a query and returns every row.
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>>;

    /// Runs a query that must produce exactly one row.
    async fn fetch_one(&self, sql: &str, params: &[Value]) -> OrmResult<Row> {
        let mut rows = self.fetch_all(sql, params).await?.into_iter();
        match (rows.next(), rows.next()) {
            (Some(row), None) => Ok(row),
            (None, _) => Err(OrmError::ObjectNotFound("Query returned no rows".to_string())),
            (Some(_), Some(_)) => Err(OrmError::MultipleObjectsReturned(
                "Query returned more than one row".to_string(),
            )),
        }
    }

    /// Runs a query and yields its rows in batches of at most `batch_size`.
    ///
    /// The default implementation fetches everything and cuts the result
    /// into batches.
    async fn fetch_batches(
        &self,
        sql: &str,
        params: &[Value],
        batch_size: usize,
    ) -> OrmResult<BoxStream<'static, OrmResult<Vec<Row>>>> {
        let rows = self.fetch_all(sql, params).await?;
        Ok(stream::iter(chunk_rows(rows, batch_size).into_iter().map(Ok)).boxed())
    }

    /// Executes an INSERT and returns the generated key.
    async fn insert_returning(&self, sql: &str, params: &[Value]) -> OrmResult<Value> {
        self.execute(sql, params).await?;
        let row = match self.backend_type() {
            DatabaseBackendType::SQLite => {
                self.fetch_one("SELECT last_insert_rowid() AS id", &[]).await?
            }
            DatabaseBackendType::MySQL => {
                self.fetch_one("SELECT LAST_INSERT_ID() AS id", &[]).await?
            }
            DatabaseBackendType::PostgreSQL => self.fetch_one("SELECT LASTVAL() AS id", &[]).await?,
        };
        row.get::<Value>("id")
    }

    /// Transaction nesting state for this connection.
    fn transactions(&self) -> &TransactionManager;

    /// Opens a transaction, or a savepoint when one is already open.
    async fn begin(&self) -> OrmResult<()> {
        self.transactions().begin(self).await
    }

    /// Commits the innermost transaction or releases its savepoint.
    async fn commit(&self) -> OrmResult<()> {
        self.transactions().commit(self).await
    }

    /// Rolls back the innermost transaction or savepoint.
    async fn rollback(&self) -> OrmResult<()> {
        self.transactions().rollback(self).await
    }

    /// Whether the whole operation shares one physical connection.
    ///
    /// When `true`, the executor never interleaves a streaming cursor with
    /// other statements: results are fetched whole and prefetch queries run
    /// one at a time.
    fn is_single_connection(&self) -> bool {
        false
    }
}

/// Splits rows into batches of at most `batch_size` (minimum 1).
pub fn chunk_rows(rows: Vec<Row>, batch_size: usize) -> Vec<Vec<Row>> {
    let size = batch_size.max(1);
    let mut batches = Vec::with_capacity(rows.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(rows.len()));
    for row in rows {
        current.push(row);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Runs an async operation to completion from synchronous code.
///
/// Inside a multi-threaded tokio runtime the current worker is handed off
/// with `block_in_place`; outside any runtime a small current-thread
/// runtime is started. Calling it from a current-thread runtime would
/// deadlock and fails with `OperationalError` instead.
pub fn run_sync<F, T>(future: F) -> OrmResult<T>
where
    F: Future<Output = OrmResult<T>>,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => match handle.runtime_flavor() {
            tokio::runtime::RuntimeFlavor::CurrentThread => Err(OrmError::OperationalError(
                "run_sync cannot block a current-thread runtime".to_string(),
            )),
            _ => tokio::task::block_in_place(|| handle.block_on(future)),
        },
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(future),
    }
}
