//! # relorm-db
//!
//! The relationship-aware query engine. Models are described explicitly
//! with [`ModelBuilder`](model::ModelBuilder) and registered in a
//! [`ModelRegistry`](registry::ModelRegistry), which resolves relations
//! lazily and generates reverse relations and through models. Queries are
//! built with the lazy [`QuerySet`](query::QuerySet) facade and run inside
//! an explicit [`Orm`](orm::Orm) context.
//!
//! ## Architecture
//!
//! A `QuerySet` only accumulates a [`QuerySpec`](query::QuerySpec). When a
//! terminal operation runs, the [`Compiler`](query::Compiler) resolves
//! relation paths through the crawler, de-duplicates joins and renders SQL
//! for the connection's dialect; the [`Executor`](query::Executor) streams
//! the rows in batches, runs batch-scoped prefetches, and the parser turns
//! rows into [`Instance`](instance::Instance)s through a result cache that
//! keeps one live instance per primary key.
//!
//! ## Module Overview
//!
//! - [`value`] - the backend-agnostic [`Value`](value::Value) and [`PkKey`](value::PkKey)
//! - [`row`] - result rows and typed extraction
//! - [`fields`] - field definitions and the [`Field`](fields::Field) capability
//! - [`model`] - model descriptors, delete policy and lifecycle hooks
//! - [`registry`] - model registration and relation resolution
//! - [`instance`] - shared model instances
//! - [`connection`] - the async [`Connection`](connection::Connection) trait
//! - [`transactions`] - `atomic` scopes and savepoints
//! - [`orm`] - the explicit query context
//! - [`query`] - query building, compilation and execution

// These clippy lints are intentionally allowed for the ORM crate:
// - struct_excessive_bools: FieldDef carries several independent flags
// - too_many_lines: the SQL compiler methods are inherently large
// - cast_precision_loss: i64-to-f64 casts are acceptable for value conversion
// - result_large_err: OrmError is used consistently across the engine
// - format_push_string: format! with push_str is clearer than write! for SQL generation
// - doc_markdown: backtick requirements for documentation items are too strict
// - needless_pass_by_value: builder signatures take owned values
// - return_self_not_must_use: builder pattern methods are self-documenting
// - use_self: explicit type names are clearer in some contexts
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::result_large_err)]
#![allow(clippy::format_push_string)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::use_self)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::unnecessary_literal_bound)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_char_pattern)]
// literal_string_with_formatting_args: template strings using {column}/{value} are intentional
#![allow(clippy::literal_string_with_formatting_args)]
// significant_drop_tightening: false positives with Mutex guards held across short scopes
#![allow(clippy::significant_drop_tightening)]

pub mod connection;
pub mod fields;
pub mod instance;
pub mod model;
pub mod orm;
pub mod query;
pub mod registry;
pub mod row;
pub mod transactions;
pub mod value;

#[cfg(test)]
mod testing;

// Re-export the most commonly used types at the crate root.
pub use connection::{chunk_rows, run_sync, Connection, DatabaseBackendType};
pub use fields::{Field, FieldDef, FieldType, OnDelete, RelatedName, Relation};
pub use instance::{Instance, Related, WeakInstance};
pub use model::{DeletePolicy, InstanceHooks, ModelBuilder, ModelMeta};
pub use orm::{Orm, OrmBuilder};
pub use query::bulk::{BulkCreateOptions, BulkUpdateOptions};
pub use query::{
    Distinct, EmbedParent, ExtraExpr, Lookup, LockStrength, LockWait, Manager, OperatorTable,
    Prefetch, QuerySet, QuerySpec, RowLock, SetOp, Q,
};
pub use registry::{ModelRegistry, Registry};
pub use row::{FromValue, Row};
pub use transactions::{atomic, Savepoint, TransactionManager};
pub use value::{PkKey, Value};
