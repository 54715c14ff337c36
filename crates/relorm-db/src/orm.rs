//! The explicit ORM context.
//!
//! An [`Orm`] bundles what every query needs: the frozen model registry,
//! the connections by database alias, the operator table, engine settings
//! and the active schema. It is threaded through every call instead of
//! living in a global, and is cheap to clone.

use std::collections::HashMap;
use std::sync::Arc;

use relorm_core::{OrmError, OrmResult, QuerySettings, DEFAULT_DB_ALIAS};

use crate::connection::{Connection, DatabaseBackendType};
use crate::model::ModelMeta;
use crate::query::compiler::Compiler;
use crate::query::operators::OperatorTable;
use crate::query::queryset::{Manager, QuerySet};
use crate::registry::Registry;

struct Shared {
    registry: Arc<Registry>,
    connections: HashMap<String, Arc<dyn Connection>>,
    operators: OperatorTable,
    settings: QuerySettings,
}

/// The context every query runs in.
#[derive(Clone)]
pub struct Orm {
    shared: Arc<Shared>,
    schema: Option<String>,
}

impl std::fmt::Debug for Orm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orm")
            .field("models", &self.shared.registry.len())
            .field("databases", &self.shared.connections.keys().collect::<Vec<_>>())
            .field("schema", &self.schema)
            .finish()
    }
}

/// Builds an [`Orm`].
pub struct OrmBuilder {
    registry: Arc<Registry>,
    connections: HashMap<String, Arc<dyn Connection>>,
    operators: OperatorTable,
    settings: QuerySettings,
}

impl OrmBuilder {
    /// Registers the connection for a database alias.
    #[must_use]
    pub fn connection(mut self, alias: impl Into<String>, conn: Arc<dyn Connection>) -> Self {
        self.connections.insert(alias.into(), conn);
        self
    }

    /// Replaces the operator table.
    #[must_use]
    pub fn operators(mut self, operators: OperatorTable) -> Self {
        self.operators = operators;
        self
    }

    /// Replaces the engine settings.
    #[must_use]
    pub fn settings(mut self, settings: QuerySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Finishes the context.
    ///
    /// # Errors
    ///
    /// `ImproperlyConfigured` if a model lives in a database with no
    /// registered connection.
    pub fn build(self) -> OrmResult<Orm> {
        for model in self.registry.models() {
            if !self.connections.contains_key(&model.database) {
                return Err(OrmError::ImproperlyConfigured(format!(
                    "Model {} uses database '{}', which has no connection",
                    model.name, model.database
                )));
            }
        }
        Ok(Orm {
            shared: Arc::new(Shared {
                registry: self.registry,
                connections: self.connections,
                operators: self.operators,
                settings: self.settings,
            }),
            schema: None,
        })
    }
}

impl Orm {
    /// Starts building a context over a frozen registry.
    pub fn builder(registry: Arc<Registry>) -> OrmBuilder {
        OrmBuilder {
            registry,
            connections: HashMap::new(),
            operators: OperatorTable::with_defaults(),
            settings: QuerySettings::default(),
        }
    }

    /// A context with only a default connection.
    pub fn new(registry: Arc<Registry>, conn: Arc<dyn Connection>) -> OrmResult<Self> {
        Self::builder(registry).connection(DEFAULT_DB_ALIAS, conn).build()
    }

    /// The same context with an active schema applied to unqualified tables.
    #[must_use]
    pub fn with_schema(&self, schema: impl Into<String>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            schema: Some(schema.into()),
        }
    }

    /// The active schema.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// The model registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    /// A model descriptor by name.
    pub fn model(&self, name: &str) -> OrmResult<Arc<ModelMeta>> {
        self.shared.registry.get(name).cloned()
    }

    /// The connection for a database alias.
    pub fn connection(&self, alias: &str) -> OrmResult<Arc<dyn Connection>> {
        self.shared.connections.get(alias).cloned().ok_or_else(|| {
            OrmError::ImproperlyConfigured(format!("No connection for database '{alias}'"))
        })
    }

    /// The operator table.
    pub fn operators(&self) -> &OperatorTable {
        &self.shared.operators
    }

    /// Engine settings.
    pub fn settings(&self) -> &QuerySettings {
        &self.shared.settings
    }

    /// A compiler for `backend` bound to this context.
    pub fn compiler(&self, backend: DatabaseBackendType) -> Compiler<'_> {
        Compiler::new(
            &self.shared.registry,
            &self.shared.operators,
            backend,
            self.schema.as_deref(),
        )
    }

    /// A fresh queryset over every row of `model`.
    pub fn query(&self, model: &str) -> OrmResult<QuerySet> {
        Ok(QuerySet::new(self.clone(), self.model(model)?))
    }

    /// The manager of `model`.
    pub fn manager(&self, model: &str) -> OrmResult<Manager> {
        Ok(Manager::new(self.query(model)?))
    }
}
