//! Test database utilities for relorm.
//!
//! Provides [`TestDatabase`], an in-memory SQLite database wrapper for use in
//! tests. It implements [`Connection`] so it can back an [`Orm`] directly,
//! and adds helpers for creating tables from a model registry, counting
//! executed statements and rolling a whole test back.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relorm_db::{FieldDef, FieldType, ModelBuilder, ModelRegistry, Orm};
//! use relorm_test::test_database::TestDatabase;
//!
//! async fn example() {
//!     let mut registry = ModelRegistry::new();
//!     registry
//!         .register(
//!             ModelBuilder::new("Article")
//!                 .field(FieldDef::new("title", FieldType::CharField))
//!                 .build()
//!                 .unwrap(),
//!         )
//!         .unwrap();
//!     let registry = registry.freeze().unwrap();
//!
//!     let db = TestDatabase::new();
//!     db.setup_models(&registry).await.unwrap();
//!     let orm = Orm::new(registry, Arc::new(db.clone())).unwrap();
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::stream::BoxStream;
use relorm_core::OrmResult;
use relorm_db::fields::{Field, FieldType, Relation};
use relorm_db::{Connection, DatabaseBackendType, ModelMeta, Registry, Row, TransactionManager, Value};
use relorm_db_backends::sqlite::SqliteConnection;

/// An in-memory SQLite database for testing.
///
/// Wraps a [`SqliteConnection`] with an `Arc` for sharing and adds a
/// statement counter for use with
/// [`assert_num_queries`](crate::assert_queries::assert_num_queries).
/// Clones share the database, the counter and the transaction state.
#[derive(Clone)]
pub struct TestDatabase {
    backend: Arc<SqliteConnection>,
    query_count: Arc<AtomicUsize>,
}

impl TestDatabase {
    /// Creates a new in-memory SQLite test database.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory database cannot be created.
    pub fn new() -> Self {
        let backend =
            SqliteConnection::memory().expect("Failed to create in-memory SQLite database");
        Self {
            backend: Arc::new(backend),
            query_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a database whose whole lifetime runs inside one transaction.
    ///
    /// Every `atomic` block inside the test becomes a savepoint, and
    /// [`teardown`](Self::teardown) rolls everything back.
    pub async fn forced_rollback() -> OrmResult<Self> {
        let db = Self::new();
        db.begin().await?;
        db.reset_query_count();
        Ok(db)
    }

    /// Creates one table per registered model, association models included.
    pub async fn setup_models(&self, registry: &Registry) -> OrmResult<()> {
        for meta in registry.models() {
            self.setup_table(meta).await?;
        }
        Ok(())
    }

    /// Creates a table from the given [`ModelMeta`].
    pub async fn setup_table(&self, meta: &ModelMeta) -> OrmResult<()> {
        let sql = Self::create_table_sql(meta);
        self.execute_raw(&sql).await?;
        tracing::debug!(model = %meta.name, table = %meta.table, "relorm.test.create_table");
        Ok(())
    }

    /// Rolls back any open transaction, then drops every user table.
    pub async fn teardown(&self) -> OrmResult<()> {
        while self.transactions().depth().await > 0 {
            self.rollback().await?;
        }
        let rows = self
            .backend
            .fetch_all(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                &[],
            )
            .await?;

        for row in &rows {
            let table_name: String = row.get("name")?;
            self.backend
                .execute(&format!("DROP TABLE IF EXISTS \"{table_name}\""), &[])
                .await?;
        }
        tracing::debug!(tables = rows.len(), "relorm.test.teardown");
        Ok(())
    }

    /// Executes a raw SQL string with no parameters.
    ///
    /// Increments the query counter.
    pub async fn execute_raw(&self, sql: &str) -> OrmResult<u64> {
        self.execute(sql, &[]).await
    }

    /// Returns the current query count.
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }

    /// Resets the query counter to zero.
    pub fn reset_query_count(&self) {
        self.query_count.store(0, Ordering::Relaxed);
    }

    /// Returns a reference to the inner `SqliteConnection`.
    pub fn backend(&self) -> &SqliteConnection {
        &self.backend
    }

    /// Generates a `CREATE TABLE IF NOT EXISTS` statement from model metadata.
    ///
    /// Foreign keys become plain columns typed after the referenced key;
    /// no `REFERENCES` constraints are emitted.
    pub fn create_table_sql(meta: &ModelMeta) -> String {
        let pk_count = meta.pk_fields().len();
        let mut col_defs: Vec<String> = Vec::new();

        for field in meta.concrete_fields() {
            let typed: Vec<(String, &'static str)> = match &field.relation {
                Some(Relation::Forward { columns, .. }) => columns
                    .iter()
                    .map(|c| (c.local.clone(), sql_type(&c.value_type)))
                    .collect(),
                _ => field
                    .columns()
                    .into_iter()
                    .map(|c| (c, sql_type(&field.field_type)))
                    .collect(),
            };

            for (column, type_str) in typed {
                let mut parts = vec![format!("\"{column}\" {type_str}")];
                if field.primary_key && pk_count == 1 {
                    parts.push("PRIMARY KEY".to_string());
                    if field.is_auto() {
                        parts.push("AUTOINCREMENT".to_string());
                    }
                } else if !field.null {
                    parts.push("NOT NULL".to_string());
                }
                if field.unique && !field.primary_key {
                    parts.push("UNIQUE".to_string());
                }
                col_defs.push(parts.join(" "));
            }
        }

        if pk_count > 1 {
            let keys: Vec<String> = meta
                .pk_columns()
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect();
            col_defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }

        let body = col_defs.join(", ");
        format!("CREATE TABLE IF NOT EXISTS \"{}\" ({body})", meta.table)
    }
}

fn sql_type(field_type: &FieldType) -> &'static str {
    match field_type {
        FieldType::AutoField
        | FieldType::BigAutoField
        | FieldType::IntegerField
        | FieldType::BigIntegerField
        | FieldType::SmallIntegerField
        | FieldType::BooleanField => "INTEGER",
        FieldType::FloatField => "REAL",
        FieldType::BinaryField => "BLOB",
        // Strings, dates, UUIDs and JSON are stored as TEXT.
        _ => "TEXT",
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Connection for TestDatabase {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.backend.execute(sql, params).await
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.backend.fetch_all(sql, params).await
    }

    async fn fetch_batches(
        &self,
        sql: &str,
        params: &[Value],
        batch_size: usize,
    ) -> OrmResult<BoxStream<'static, OrmResult<Vec<Row>>>> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.backend.fetch_batches(sql, params, batch_size).await
    }

    async fn insert_returning(&self, sql: &str, params: &[Value]) -> OrmResult<Value> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        self.backend.insert_returning(sql, params).await
    }

    fn transactions(&self) -> &TransactionManager {
        self.backend.transactions()
    }

    fn is_single_connection(&self) -> bool {
        self.backend.is_single_connection()
    }
}
