//! # relorm
//!
//! An async, relationship-aware query engine and ORM.
//!
//! This is the meta-crate that re-exports the sub-crates. Depend on
//! `relorm` for the whole engine, or on individual crates for finer-grained
//! control.
//!
//! ```ignore
//! use relorm::prelude::*;
//!
//! let settings = relorm::core::settings_loader::from_toml_file("relorm.toml")?;
//! relorm::core::logging::setup_logging(&settings);
//! let orm = relorm::open(registry, &settings)?;
//! let recent = orm.query("Post")?.filter(Q::kw("author__name", "ann")).fetch().await?;
//! ```

use std::sync::Arc;

/// Error types and settings.
pub use relorm_core as core;

/// Models, relations, querysets and the compiler.
pub use relorm_db as db;

/// Database drivers.
pub use relorm_db_backends as db_backends;

/// Test database and query-count assertions.
#[cfg(feature = "testing")]
pub use relorm_test as test;

pub use async_trait;
pub use chrono;
pub use futures_util;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
pub use tracing_subscriber;

use relorm_core::{OrmResult, Settings};
use relorm_db::{Orm, Registry};

/// Opens every configured database and builds an [`Orm`] over `registry`
/// with the query tunables from `settings`.
///
/// # Errors
///
/// `ImproperlyConfigured` for an unknown engine or a model whose database
/// is not configured, `OperationalError` when a database cannot be opened.
pub fn open(registry: Arc<Registry>, settings: &Settings) -> OrmResult<Orm> {
    let mut builder = Orm::builder(registry).settings(settings.query.clone());
    for (alias, conn) in relorm_db_backends::connect_all(settings)? {
        builder = builder.connection(alias, conn);
    }
    builder.build()
}

/// The types most programs need.
pub mod prelude {
    pub use relorm_core::{OrmError, OrmResult, Settings, ValidationError};
    pub use relorm_db::{
        atomic, DeletePolicy, FieldDef, FieldType, Instance, InstanceHooks, ModelBuilder,
        ModelRegistry, OnDelete, Orm, Prefetch, QuerySet, Registry, Value, Q,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use super::*;
    use relorm_core::DatabaseSettings;
    use relorm_db::Connection;

    fn registry(database: &str) -> Arc<Registry> {
        let mut reg = ModelRegistry::new();
        reg.register(
            ModelBuilder::new("Tag")
                .database(database)
                .field(FieldDef::new("label", FieldType::CharField))
                .build()
                .unwrap(),
        )
        .unwrap();
        reg.freeze().unwrap()
    }

    fn memory_settings() -> Settings {
        let mut settings = Settings::default();
        settings.databases.insert(
            "default".to_string(),
            DatabaseSettings {
                engine: "sqlite".into(),
                name: ":memory:".into(),
                ..DatabaseSettings::default()
            },
        );
        settings.query.default_batch_size = 7;
        settings
    }

    #[tokio::test]
    async fn test_open_from_settings() {
        let orm = open(registry("default"), &memory_settings()).unwrap();
        assert_eq!(orm.settings().default_batch_size, 7);
        orm.connection("default")
            .unwrap()
            .execute(
                "CREATE TABLE \"tag\" (\"id\" INTEGER PRIMARY KEY, \"label\" TEXT NOT NULL)",
                &[],
            )
            .await
            .unwrap();
        orm.query("Tag")
            .unwrap()
            .create(&[("label", Value::from("rust"))])
            .await
            .unwrap();
        assert_eq!(orm.query("Tag").unwrap().count().await.unwrap(), 1);
    }

    #[test]
    fn test_open_missing_database() {
        let err = open(registry("archive"), &memory_settings()).unwrap_err();
        assert!(matches!(err, OrmError::ImproperlyConfigured(_)));
    }
}
