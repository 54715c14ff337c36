//! In-crate test double for [`Connection`].

use std::collections::VecDeque;
use std::sync::Mutex;

use relorm_core::OrmResult;

use crate::connection::{Connection, DatabaseBackendType};
use crate::row::Row;
use crate::transactions::TransactionManager;
use crate::value::Value;

/// Records every statement and answers queries from a queue of canned
/// result sets (an empty result once the queue is drained).
pub struct RecordingConnection {
    backend: DatabaseBackendType,
    single: bool,
    log: Mutex<Vec<(String, Vec<Value>)>>,
    results: Mutex<VecDeque<Vec<Row>>>,
    tx: TransactionManager,
}

impl RecordingConnection {
    pub fn new(backend: DatabaseBackendType) -> Self {
        Self {
            backend,
            single: false,
            log: Mutex::new(Vec::new()),
            results: Mutex::new(VecDeque::new()),
            tx: TransactionManager::new(),
        }
    }

    pub fn sqlite() -> Self {
        Self::new(DatabaseBackendType::SQLite)
    }

    pub fn postgres() -> Self {
        Self::new(DatabaseBackendType::PostgreSQL)
    }

    pub fn single(mut self) -> Self {
        self.single = true;
        self
    }

    /// Queues the result of the next fetch.
    pub fn push_rows(&self, columns: &[&str], rows: Vec<Vec<Value>>) {
        let columns: Vec<String> = columns.iter().map(|c| (*c).to_string()).collect();
        let rows = rows
            .into_iter()
            .map(|values| Row::new(columns.clone(), values))
            .collect();
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(rows);
    }

    pub fn statements(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    pub fn params(&self, idx: usize) -> Vec<Value> {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(idx)
            .map(|(_, p)| p.clone())
            .unwrap_or_default()
    }

    fn record(&self, sql: &str, params: &[Value]) {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((sql.to_string(), params.to_vec()));
    }
}

#[async_trait::async_trait]
impl Connection for RecordingConnection {
    fn backend_type(&self) -> DatabaseBackendType {
        self.backend
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        self.record(sql, params);
        Ok(1)
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
        self.record(sql, params);
        Ok(self
            .results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_default())
    }

    async fn insert_returning(&self, sql: &str, params: &[Value]) -> OrmResult<Value> {
        self.record(sql, params);
        Ok(Value::Int(1))
    }

    fn transactions(&self) -> &TransactionManager {
        &self.tx
    }

    fn is_single_connection(&self) -> bool {
        self.single
    }
}
