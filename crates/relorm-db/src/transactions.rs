//! Transaction support.
//!
//! Every [`Connection`] owns a [`TransactionManager`] tracking how deeply
//! transactions are nested on it. The outermost `begin` issues `BEGIN`;
//! nested ones create savepoints, so write operations that call each other
//! (`get_or_create` calling `create`, a cascading delete running hooks that
//! save) compose without special casing. [`atomic`] is the entry point used
//! by every multi-statement write in the engine.
//!
//! A connection is shared by every future holding the `Orm`, so an open
//! transaction is owned by the future that began it through [`atomic`].
//! Other futures wait on the manager's gate: their own `atomic` blocks
//! start once the owner finishes, and backends hold
//! [`TransactionManager::statement_guard`] around each statement so a
//! foreign statement never runs inside someone else's transaction.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relorm_core::{OrmError, OrmResult};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::connection::Connection;

/// Counter for generating unique savepoint names.
static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Counter identifying transaction managers.
static MANAGER_COUNTER: AtomicU64 = AtomicU64::new(0);

tokio::task_local! {
    /// Managers whose transaction the future being polled owns.
    static OWNED_SCOPES: Vec<u64>;
}

/// A savepoint within an open transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    /// The savepoint name.
    pub name: String,
}

impl Savepoint {
    /// Creates a savepoint with a generated unique name.
    pub fn new() -> Self {
        let id = SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            name: format!("relorm_sp_{id}"),
        }
    }
}

impl Default for Savepoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks transaction nesting for one connection.
#[derive(Debug)]
pub struct TransactionManager {
    id: u64,
    /// Held by the future owning the open transaction.
    gate: Arc<Mutex<()>>,
    /// Stack of open savepoints; `None` entries are the outermost transaction.
    stack: Mutex<Vec<Option<Savepoint>>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self {
            id: MANAGER_COUNTER.fetch_add(1, Ordering::Relaxed),
            gate: Arc::new(Mutex::new(())),
            stack: Mutex::new(Vec::new()),
        }
    }
}

impl TransactionManager {
    /// Creates a manager with no open transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the future being polled runs inside an [`atomic`] block of
    /// this manager.
    pub fn owned_by_current_task(&self) -> bool {
        OWNED_SCOPES
            .try_with(|ids| ids.contains(&self.id))
            .unwrap_or(false)
    }

    /// Waits until no other future owns a transaction on this connection.
    ///
    /// Returns `None` inside the owner's own [`atomic`] block. Backends keep
    /// the guard alive for the duration of one statement (or one cursor).
    pub async fn statement_guard(&self) -> Option<OwnedMutexGuard<()>> {
        if self.owned_by_current_task() {
            return None;
        }
        Some(Arc::clone(&self.gate).lock_owned().await)
    }

    /// Returns the current nesting depth (0 = no transaction).
    pub async fn depth(&self) -> usize {
        self.stack.lock().await.len()
    }

    /// Begins a transaction, or a savepoint if one is already open.
    pub async fn begin<C: Connection + ?Sized>(&self, conn: &C) -> OrmResult<()> {
        let mut stack = self.stack.lock().await;
        if stack.is_empty() {
            conn.execute("BEGIN", &[]).await?;
            tracing::debug!("relorm.transaction.begin");
            stack.push(None);
        } else {
            let sp = Savepoint::new();
            conn.execute(&format!("SAVEPOINT {}", sp.name), &[]).await?;
            tracing::debug!(savepoint = %sp.name, "relorm.transaction.savepoint");
            stack.push(Some(sp));
        }
        Ok(())
    }

    /// Commits the outermost transaction or releases the innermost savepoint.
    pub async fn commit<C: Connection + ?Sized>(&self, conn: &C) -> OrmResult<()> {
        let mut stack = self.stack.lock().await;
        match stack.pop() {
            None => Err(OrmError::DatabaseError(
                "Cannot commit: not in a transaction".to_string(),
            )),
            Some(None) => {
                conn.execute("COMMIT", &[]).await?;
                tracing::debug!("relorm.transaction.commit");
                Ok(())
            }
            Some(Some(sp)) => {
                conn.execute(&format!("RELEASE SAVEPOINT {}", sp.name), &[])
                    .await?;
                Ok(())
            }
        }
    }

    /// Rolls back the outermost transaction or the innermost savepoint.
    pub async fn rollback<C: Connection + ?Sized>(&self, conn: &C) -> OrmResult<()> {
        let mut stack = self.stack.lock().await;
        match stack.pop() {
            None => Err(OrmError::DatabaseError(
                "Cannot rollback: not in a transaction".to_string(),
            )),
            Some(None) => {
                conn.execute("ROLLBACK", &[]).await?;
                tracing::debug!("relorm.transaction.rollback");
                Ok(())
            }
            Some(Some(sp)) => {
                conn.execute(&format!("ROLLBACK TO SAVEPOINT {}", sp.name), &[])
                    .await?;
                conn.execute(&format!("RELEASE SAVEPOINT {}", sp.name), &[])
                    .await?;
                tracing::debug!(savepoint = %sp.name, "relorm.transaction.rollback");
                Ok(())
            }
        }
    }
}

/// Executes a closure within a database transaction.
///
/// If the closure returns `Ok`, the transaction is committed. If it returns
/// `Err`, the transaction is rolled back and the original error returned.
/// Nested calls create savepoints. Blocks started by different futures on
/// the same connection run one after the other.
///
/// # Examples
///
/// ```ignore
/// use relorm_db::transactions::atomic;
///
/// let id = atomic(conn, |conn| async move {
///     conn.execute("INSERT INTO tag (label) VALUES (?)", &["rust".into()]).await?;
///     conn.insert_returning("INSERT INTO tag (label) VALUES (?)", &["db".into()]).await
/// })
/// .await?;
/// ```
pub async fn atomic<'a, F, Fut, T>(conn: &'a dyn Connection, f: F) -> OrmResult<T>
where
    F: FnOnce(&'a dyn Connection) -> Fut,
    Fut: Future<Output = OrmResult<T>>,
{
    let manager = conn.transactions();
    if manager.owned_by_current_task() {
        return run_in_transaction(conn, f).await;
    }
    let _gate = Arc::clone(&manager.gate).lock_owned().await;
    let mut owned = OWNED_SCOPES.try_with(Clone::clone).unwrap_or_default();
    owned.push(manager.id);
    OWNED_SCOPES.scope(owned, run_in_transaction(conn, f)).await
}

async fn run_in_transaction<'a, F, Fut, T>(conn: &'a dyn Connection, f: F) -> OrmResult<T>
where
    F: FnOnce(&'a dyn Connection) -> Fut,
    Fut: Future<Output = OrmResult<T>>,
{
    conn.begin().await?;
    match f(conn).await {
        Ok(result) => {
            conn.commit().await?;
            Ok(result)
        }
        Err(e) => {
            // If rollback fails, return the original error
            if let Err(rollback_err) = conn.rollback().await {
                tracing::warn!(error = %rollback_err, "relorm.transaction.rollback_failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConnection;

    #[tokio::test]
    async fn test_atomic_commits() {
        let conn = RecordingConnection::sqlite();
        let out = atomic(&conn, |c| async move {
            c.execute("INSERT INTO t VALUES (1)", &[]).await?;
            Ok(7)
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(
            conn.statements(),
            vec!["BEGIN", "INSERT INTO t VALUES (1)", "COMMIT"]
        );
        assert_eq!(conn.transactions().depth().await, 0);
    }

    #[tokio::test]
    async fn test_atomic_rolls_back_and_keeps_error() {
        let conn = RecordingConnection::sqlite();
        let err = atomic(&conn, |_| async move {
            Err::<(), _>(OrmError::IntegrityError("boom".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OrmError::IntegrityError(_)));
        assert_eq!(conn.statements(), vec!["BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_nested_atomic_uses_savepoints() {
        let conn = RecordingConnection::sqlite();
        atomic(&conn, |outer| async move {
            let inner = atomic(outer, |c| async move {
                c.execute("X", &[]).await?;
                Err::<(), _>(OrmError::DatabaseError("inner".into()))
            })
            .await;
            assert!(inner.is_err());
            outer.execute("Y", &[]).await?;
            Ok(())
        })
        .await
        .unwrap();

        let stmts = conn.statements();
        assert_eq!(stmts[0], "BEGIN");
        assert!(stmts[1].starts_with("SAVEPOINT relorm_sp_"));
        assert_eq!(stmts[2], "X");
        assert!(stmts[3].starts_with("ROLLBACK TO SAVEPOINT"));
        assert!(stmts[4].starts_with("RELEASE SAVEPOINT"));
        assert_eq!(stmts[5], "Y");
        assert_eq!(stmts[6], "COMMIT");
    }

    #[tokio::test]
    async fn test_commit_without_transaction() {
        let conn = RecordingConnection::sqlite();
        assert!(conn.commit().await.is_err());
        assert!(conn.rollback().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_atomic_blocks_do_not_interleave() {
        let conn = RecordingConnection::sqlite();
        let block = |name: &'static str| {
            atomic(&conn, move |c| async move {
                c.execute(&format!("{name} 1"), &[]).await?;
                tokio::task::yield_now().await;
                c.execute(&format!("{name} 2"), &[]).await?;
                Ok(())
            })
        };
        let (a, b) = tokio::join!(block("A"), block("B"));
        a.unwrap();
        b.unwrap();
        assert_eq!(
            conn.statements(),
            vec!["BEGIN", "A 1", "A 2", "COMMIT", "BEGIN", "B 1", "B 2", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn test_statement_guard_waits_for_owner() {
        let conn = RecordingConnection::sqlite();
        let tm = conn.transactions();
        assert!(!tm.owned_by_current_task());
        let inside = atomic(&conn, |c| async move {
            let owned = c.transactions().owned_by_current_task();
            assert!(c.transactions().statement_guard().await.is_none());
            Ok(owned)
        })
        .await
        .unwrap();
        assert!(inside);
        assert!(tm.statement_guard().await.is_some());
    }

    #[test]
    fn test_savepoint_names_unique() {
        assert_ne!(Savepoint::new().name, Savepoint::new().name);
    }
}
