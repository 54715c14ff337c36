//! SQLite connection using `rusqlite`.
//!
//! [`SqliteConnection`] implements [`Connection`] with one `rusqlite`
//! connection behind an async mutex; every statement runs on tokio's
//! blocking pool through `spawn_blocking`. Because there is only one
//! physical connection it reports itself as a single connection, and
//! statements wait while another future owns an open transaction.
//!
//! `fetch_batches` keeps a cursor open on a blocking worker and hands
//! batches over a bounded channel, so at most one batch beyond the one
//! being consumed is held in memory. The connection stays busy until the
//! stream is drained or dropped.
//!
//! Features:
//! - WAL journal mode for file databases, foreign keys always enforced
//! - In-memory databases via the `:memory:` path
//! - Constraint failures surface as `IntegrityError`, busy/locked databases
//!   as `OperationalError`

use std::path::PathBuf;
use std::sync::Arc;

use relorm_core::{OrmError, OrmResult};
use relorm_db::connection::{Connection, DatabaseBackendType};
use relorm_db::transactions::TransactionManager;
use relorm_db::{Row, Value};
use rusqlite::types::{Null, ValueRef};
use futures_util::stream::{self, BoxStream, StreamExt};
use rusqlite::ErrorCode;
use tokio::sync::{mpsc, Mutex};

use crate::base::DatabaseConfig;

/// Maps a `rusqlite` error into the ORM taxonomy.
fn map_error(e: &rusqlite::Error) -> OrmError {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::ConstraintViolation => OrmError::IntegrityError(e.to_string()),
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull => OrmError::OperationalError(e.to_string()),
            _ => OrmError::DatabaseError(e.to_string()),
        },
        _ => OrmError::DatabaseError(e.to_string()),
    }
}

fn join_error(e: &tokio::task::JoinError) -> OrmError {
    OrmError::OperationalError(format!("SQLite worker failed: {e}"))
}

/// A SQLite database connection.
pub struct SqliteConnection {
    /// The path to the database file (or ":memory:").
    path: PathBuf,
    /// The connection, guarded by an async mutex.
    conn: Arc<Mutex<rusqlite::Connection>>,
    tx: TransactionManager,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteConnection {
    /// Opens the database named by `config`.
    ///
    /// # Errors
    ///
    /// `OperationalError` if the database cannot be opened or configured.
    pub fn open(config: &DatabaseConfig) -> OrmResult<Self> {
        let path = PathBuf::from(&config.name);
        let memory = config.name == ":memory:";
        let conn = if memory {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(&path)
        }
        .map_err(|e| OrmError::OperationalError(format!("SQLite open failed: {e}")))?;

        let pragmas = if memory {
            "PRAGMA foreign_keys=ON;"
        } else {
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;"
        };
        conn.execute_batch(pragmas)
            .map_err(|e| OrmError::OperationalError(format!("Failed to set pragmas: {e}")))?;

        tracing::debug!(path = %path.display(), "relorm.sqlite.open");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            tx: TransactionManager::new(),
        })
    }

    /// Opens an in-memory database.
    pub fn memory() -> OrmResult<Self> {
        Self::open(&DatabaseConfig::sqlite_memory())
    }

    /// Returns the database file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Runs `f` with the raw connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> OrmResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> OrmResult<T> + Send + 'static,
    {
        let guard = self.tx.statement_guard().await;
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| join_error(&e))?
    }

    /// Binds ORM `Value` types to a `rusqlite` statement.
    fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> OrmResult<()> {
        for (i, param) in params.iter().enumerate() {
            let idx = i + 1;
            match param {
                Value::Null => stmt.raw_bind_parameter(idx, Null),
                Value::Bool(b) => stmt.raw_bind_parameter(idx, b),
                Value::Int(v) => stmt.raw_bind_parameter(idx, v),
                Value::Float(v) => stmt.raw_bind_parameter(idx, v),
                Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
                Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
                Value::Date(d) => stmt.raw_bind_parameter(idx, d.to_string()),
                Value::DateTime(dt) => stmt.raw_bind_parameter(idx, dt.to_string()),
                Value::DateTimeTz(dt) => stmt.raw_bind_parameter(idx, dt.to_rfc3339()),
                Value::Time(t) => stmt.raw_bind_parameter(idx, t.to_string()),
                Value::Uuid(u) => stmt.raw_bind_parameter(idx, u.to_string()),
                Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string()),
                Value::List(_) => {
                    return Err(OrmError::DatabaseError(format!(
                        "Cannot bind a list to parameter {idx}"
                    )))
                }
            }
            .map_err(|e| OrmError::DatabaseError(format!("Bind error: {e}")))?;
        }
        Ok(())
    }

    /// Converts a `rusqlite::Row` to our generic `Row`.
    fn convert_row(sqlite_row: &rusqlite::Row<'_>, column_names: &[String]) -> OrmResult<Row> {
        let mut values = Vec::with_capacity(column_names.len());
        for i in 0..column_names.len() {
            let value = match sqlite_row.get_ref(i).map_err(|e| map_error(&e))? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::Int(v),
                ValueRef::Real(v) => Value::Float(v),
                ValueRef::Text(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
                ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
            };
            values.push(value);
        }
        Ok(Row::new(column_names.to_vec(), values))
    }

    /// Sends the rows of `sql` in batches of `size` until the result is
    /// exhausted or the receiver goes away.
    fn send_batches(
        conn: &rusqlite::Connection,
        sql: &str,
        params: &[Value],
        size: usize,
        tx: &mpsc::Sender<OrmResult<Vec<Row>>>,
    ) -> OrmResult<()> {
        let mut stmt = conn.prepare(sql).map_err(|e| map_error(&e))?;
        let column_names: Vec<String> =
            stmt.column_names().into_iter().map(String::from).collect();
        Self::bind_params(&mut stmt, params)?;
        let mut raw_rows = stmt.raw_query();
        let mut batch = Vec::with_capacity(size);
        while let Some(row) = raw_rows.next().map_err(|e| map_error(&e))? {
            batch.push(Self::convert_row(row, &column_names)?);
            if batch.len() == size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(size));
                if tx.blocking_send(Ok(full)).is_err() {
                    tracing::debug!("relorm.sqlite.cursor_dropped");
                    return Ok(());
                }
            }
        }
        if !batch.is_empty() {
            // A dropped receiver only means nobody wants the tail.
            let _ = tx.blocking_send(Ok(batch));
        }
        Ok(())
    }

    fn run(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> OrmResult<u64> {
        let mut stmt = conn.prepare(sql).map_err(|e| map_error(&e))?;
        Self::bind_params(&mut stmt, params)?;
        let count = stmt.raw_execute().map_err(|e| map_error(&e))?;
        Ok(count as u64)
    }
}

#[async_trait::async_trait]
impl Connection for SqliteConnection {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| Self::run(conn, &sql, &params)).await
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(|e| map_error(&e))?;
            let column_names: Vec<String> =
                stmt.column_names().into_iter().map(String::from).collect();
            Self::bind_params(&mut stmt, &params)?;
            let mut raw_rows = stmt.raw_query();
            let mut rows = Vec::new();
            while let Some(row) = raw_rows.next().map_err(|e| map_error(&e))? {
                rows.push(Self::convert_row(row, &column_names)?);
            }
            Ok(rows)
        })
        .await
    }

    async fn fetch_batches(
        &self,
        sql: &str,
        params: &[Value],
        batch_size: usize,
    ) -> OrmResult<BoxStream<'static, OrmResult<Vec<Row>>>> {
        let guard = self.tx.statement_guard().await;
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let params = params.to_vec();
        let size = batch_size.max(1);
        let (tx, rx) = mpsc::channel(1);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let conn = conn.blocking_lock();
            if let Err(e) = Self::send_batches(&conn, &sql, &params, size, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|batch| (batch, rx))
        })
        .boxed())
    }

    async fn insert_returning(&self, sql: &str, params: &[Value]) -> OrmResult<Value> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            Self::run(conn, &sql, &params)?;
            Ok(Value::Int(conn.last_insert_rowid()))
        })
        .await
    }

    fn transactions(&self) -> &TransactionManager {
        &self.tx
    }

    fn is_single_connection(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn users() -> SqliteConnection {
        let conn = SqliteConnection::memory().unwrap();
        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, age INTEGER)",
            &[],
        )
        .await
        .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_sqlite_memory_open() {
        let conn = SqliteConnection::memory().unwrap();
        assert_eq!(conn.backend_type(), DatabaseBackendType::SQLite);
        assert!(conn.is_single_connection());
        assert_eq!(conn.path(), &PathBuf::from(":memory:"));
    }

    #[tokio::test]
    async fn test_sqlite_insert_and_query() {
        let conn = users().await;
        let id = conn
            .insert_returning(
                "INSERT INTO users (name, age) VALUES (?, ?)",
                &[Value::from("Alice"), Value::from(30)],
            )
            .await
            .unwrap();
        assert_eq!(id, Value::Int(1));

        let rows = conn.fetch_all("SELECT id, name, age FROM users", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<String>("name").unwrap(), "Alice");
        assert_eq!(rows[0].get::<i64>("age").unwrap(), 30);
    }

    #[tokio::test]
    async fn test_sqlite_fetch_one_not_found() {
        let conn = users().await;
        let result = conn
            .fetch_one("SELECT id FROM users WHERE id = ?", &[Value::from(999)])
            .await;
        assert!(matches!(result, Err(OrmError::ObjectNotFound(_))));
    }

    #[tokio::test]
    async fn test_sqlite_unique_violation_is_integrity_error() {
        let conn = users().await;
        let insert = "INSERT INTO users (name) VALUES (?)";
        conn.execute(insert, &[Value::from("a")]).await.unwrap();
        let err = conn.execute(insert, &[Value::from("a")]).await.unwrap_err();
        assert!(matches!(err, OrmError::IntegrityError(_)));
    }

    #[tokio::test]
    async fn test_sqlite_bad_sql_is_database_error() {
        let conn = users().await;
        let err = conn.fetch_all("SELECT nope FROM users", &[]).await.unwrap_err();
        assert!(matches!(err, OrmError::DatabaseError(_)));
    }

    #[tokio::test]
    async fn test_sqlite_atomic_rollback() {
        let conn = users().await;
        let result = relorm_db::atomic(&conn, |c| async move {
            c.execute("INSERT INTO users (name) VALUES (?)", &[Value::from("x")])
                .await?;
            Err::<(), _>(OrmError::QuerySetError("stop".into()))
        })
        .await;
        assert!(result.is_err());
        let rows = conn.fetch_all("SELECT id FROM users", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_batches() {
        use futures_util::TryStreamExt;

        let conn = users().await;
        for name in ["a", "b", "c"] {
            conn.execute("INSERT INTO users (name) VALUES (?)", &[Value::from(name)])
                .await
                .unwrap();
        }
        let batches: Vec<Vec<Row>> = conn
            .fetch_batches("SELECT id FROM users ORDER BY id", &[], 2)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_sqlite_dropped_cursor_frees_connection() {
        use futures_util::TryStreamExt;

        let conn = users().await;
        for name in ["a", "b", "c", "d"] {
            conn.execute("INSERT INTO users (name) VALUES (?)", &[Value::from(name)])
                .await
                .unwrap();
        }
        let mut batches = conn
            .fetch_batches("SELECT id FROM users ORDER BY id", &[], 1)
            .await
            .unwrap();
        let first = batches.try_next().await.unwrap().unwrap();
        assert_eq!(first[0].get::<i64>("id").unwrap(), 1);
        drop(batches);

        conn.execute("INSERT INTO users (name) VALUES (?)", &[Value::from("e")])
            .await
            .unwrap();
        let rows = conn.fetch_all("SELECT id FROM users", &[]).await.unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn test_sqlite_batches_report_errors() {
        use futures_util::TryStreamExt;

        let conn = users().await;
        let result: OrmResult<Vec<Vec<Row>>> = conn
            .fetch_batches("SELECT nope FROM users", &[], 2)
            .await
            .unwrap()
            .try_collect()
            .await;
        assert!(matches!(result, Err(OrmError::DatabaseError(_))));
    }

    #[tokio::test]
    async fn test_sqlite_statements_wait_for_open_transaction() {
        let conn = Arc::new(users().await);
        let writer = Arc::clone(&conn);
        let outside = Arc::clone(&conn);
        let (txn, count) = tokio::join!(
            relorm_db::atomic(writer.as_ref(), |c| async move {
                c.execute("INSERT INTO users (name) VALUES (?)", &[Value::from("x")])
                    .await?;
                tokio::task::yield_now().await;
                Err::<(), _>(OrmError::QuerySetError("stop".into()))
            }),
            async move {
                tokio::task::yield_now().await;
                outside.fetch_all("SELECT id FROM users", &[]).await
            }
        );
        assert!(txn.is_err());
        assert!(count.unwrap().is_empty());
    }
}
