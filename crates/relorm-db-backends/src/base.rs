//! Connection configuration.
//!
//! A [`DatabaseConfig`] describes one database; [`connect`] opens it and
//! [`connect_all`] opens every alias of a [`Settings`] value so the
//! connections can be handed to an [`OrmBuilder`](relorm_db::OrmBuilder).

use std::collections::HashMap;
use std::sync::Arc;

use relorm_core::{DatabaseSettings, OrmError, OrmResult, Settings};
use relorm_db::connection::{Connection, DatabaseBackendType};

/// Configuration for connecting to a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// The backend type.
    pub backend: DatabaseBackendType,
    /// The database name or file path.
    pub name: String,
    /// Schema for unqualified tables, if not the backend default.
    pub schema: Option<String>,
    /// Additional connection options.
    pub options: HashMap<String, String>,
}

impl DatabaseConfig {
    /// Creates a configuration for an in-memory SQLite database.
    pub fn sqlite_memory() -> Self {
        Self::sqlite_file(":memory:")
    }

    /// Creates a configuration for a SQLite file database.
    pub fn sqlite_file(path: impl Into<String>) -> Self {
        Self {
            backend: DatabaseBackendType::SQLite,
            name: path.into(),
            schema: None,
            options: HashMap::new(),
        }
    }

    /// Builds a configuration from one entry of the settings file.
    ///
    /// # Errors
    ///
    /// `ImproperlyConfigured` for an unknown engine name.
    pub fn from_settings(settings: &DatabaseSettings) -> OrmResult<Self> {
        let backend = match settings.engine.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => DatabaseBackendType::SQLite,
            "postgres" | "postgresql" => DatabaseBackendType::PostgreSQL,
            "mysql" => DatabaseBackendType::MySQL,
            other => {
                return Err(OrmError::ImproperlyConfigured(format!(
                    "Unknown database engine '{other}'"
                )))
            }
        };
        Ok(Self {
            backend,
            name: settings.name.clone(),
            schema: (!settings.schema.is_empty()).then(|| settings.schema.clone()),
            options: settings.options.clone(),
        })
    }
}

/// Opens a connection for `config`.
///
/// # Errors
///
/// `ImproperlyConfigured` when no driver for the backend is compiled in,
/// `OperationalError` when the database cannot be opened.
pub fn connect(config: &DatabaseConfig) -> OrmResult<Arc<dyn Connection>> {
    match config.backend {
        #[cfg(feature = "sqlite")]
        DatabaseBackendType::SQLite => Ok(Arc::new(crate::sqlite::SqliteConnection::open(config)?)),
        other => Err(OrmError::ImproperlyConfigured(format!(
            "No {other:?} driver is available in this build"
        ))),
    }
}

/// Opens every database alias in `settings`.
pub fn connect_all(settings: &Settings) -> OrmResult<HashMap<String, Arc<dyn Connection>>> {
    let mut out = HashMap::with_capacity(settings.databases.len());
    for (alias, db) in &settings.databases {
        let config = DatabaseConfig::from_settings(db)?;
        tracing::debug!(alias = %alias, backend = ?config.backend, name = %config.name, "relorm.connect");
        out.insert(alias.clone(), connect(&config)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_sqlite_memory() {
        let cfg = DatabaseConfig::sqlite_memory();
        assert_eq!(cfg.backend, DatabaseBackendType::SQLite);
        assert_eq!(cfg.name, ":memory:");
        assert!(cfg.schema.is_none());
    }

    #[test]
    fn test_from_settings() {
        let settings = DatabaseSettings {
            engine: "postgresql".into(),
            name: "app".into(),
            schema: "tenant".into(),
            options: HashMap::new(),
        };
        let cfg = DatabaseConfig::from_settings(&settings).unwrap();
        assert_eq!(cfg.backend, DatabaseBackendType::PostgreSQL);
        assert_eq!(cfg.schema.as_deref(), Some("tenant"));

        let bad = DatabaseSettings {
            engine: "oracle".into(),
            ..DatabaseSettings::default()
        };
        assert!(matches!(
            DatabaseConfig::from_settings(&bad),
            Err(OrmError::ImproperlyConfigured(_))
        ));
    }

    #[test]
    fn test_connect_without_driver() {
        let cfg = DatabaseConfig {
            backend: DatabaseBackendType::MySQL,
            name: "app".into(),
            schema: None,
            options: HashMap::new(),
        };
        assert!(matches!(connect(&cfg), Err(OrmError::ImproperlyConfigured(_))));
    }
}
