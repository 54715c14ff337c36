//! Settings for relorm.
//!
//! [`Settings`] holds database configuration keyed by alias, logging
//! configuration, and the query engine tunables in [`QuerySettings`]. Settings
//! are plain values: they are loaded once (see
//! [`settings_loader`](crate::settings_loader)) and handed to the ORM context
//! explicitly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The alias used when no database is named explicitly.
pub const DEFAULT_DB_ALIAS: &str = "default";

/// Database connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// The database engine (e.g. `sqlite`).
    pub engine: String,
    /// The database name (or file path for `SQLite`, `:memory:` for in-memory).
    pub name: String,
    /// Schema used when a query does not name one. Empty means the backend default.
    pub schema: String,
    /// Additional engine-specific options.
    pub options: HashMap<String, String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: "sqlite".to_string(),
            name: "db.sqlite3".to_string(),
            schema: String::new(),
            options: HashMap::new(),
        }
    }
}

/// Tunables for the query engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySettings {
    /// Number of rows fetched and parsed per batch when streaming.
    pub default_batch_size: usize,
    /// Maximum number of prefetch sub-queries in flight for one batch.
    pub prefetch_concurrency: usize,
    /// Always load whole result sets before yielding.
    pub force_fetch_all: bool,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            prefetch_concurrency: 4,
            force_fetch_all: false,
        }
    }
}

/// The complete set of relorm settings.
///
/// # Examples
///
/// ```
/// use relorm_core::settings::Settings;
///
/// let settings = Settings::default();
/// assert!(settings.debug);
/// assert_eq!(settings.query.default_batch_size, 100);
/// assert!(settings.databases.contains_key("default"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Whether debug mode is enabled (pretty logs instead of JSON).
    pub debug: bool,
    /// The `tracing` filter directive.
    pub log_level: String,
    /// Database configurations, keyed by alias (e.g. "default").
    pub databases: HashMap<String, DatabaseSettings>,
    /// Query engine tunables.
    pub query: QuerySettings,
}

impl Default for Settings {
    fn default() -> Self {
        let mut databases = HashMap::new();
        databases.insert(DEFAULT_DB_ALIAS.to_string(), DatabaseSettings::default());
        Self {
            debug: true,
            log_level: "info".to_string(),
            databases,
            query: QuerySettings::default(),
        }
    }
}

impl Settings {
    /// Returns the configuration for a database alias.
    pub fn database(&self, alias: &str) -> Option<&DatabaseSettings> {
        self.databases.get(alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.debug);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.query.prefetch_concurrency, 4);
        assert!(!settings.query.force_fetch_all);
    }

    #[test]
    fn test_default_database() {
        let settings = Settings::default();
        let db = settings.database(DEFAULT_DB_ALIAS).unwrap();
        assert_eq!(db.engine, "sqlite");
        assert!(db.schema.is_empty());
        assert!(settings.database("other").is_none());
    }

    #[test]
    fn test_settings_serde_round_trip() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.query, settings.query);
    }
}
