//! # relorm-core
//!
//! Settings, logging, and error types shared by every relorm crate.
//!
//! ## Modules
//!
//! - [`error`] - Error types and result aliases
//! - [`settings`] - Database and query engine configuration
//! - [`settings_loader`] - Loading settings from TOML/JSON and the environment
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{OrmError, OrmResult, ValidationError};
pub use settings::{DatabaseSettings, QuerySettings, Settings, DEFAULT_DB_ALIAS};
