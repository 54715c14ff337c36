//! Error types for relorm.
//!
//! [`OrmError`] is the single error enum returned by every fallible operation
//! in the workspace. Misuse that can be detected from the query description
//! alone (bad relationship paths, conflicting options, name collisions) is
//! reported as [`OrmError::QuerySetError`] before any statement is sent.
//! Result-shape errors ([`OrmError::ObjectNotFound`],
//! [`OrmError::MultipleObjectsReturned`]) only surface from terminal
//! operations. Backend failures are passed through as
//! [`OrmError::DatabaseError`], [`OrmError::IntegrityError`] or
//! [`OrmError::OperationalError`].

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Represents a validation error with optional field-level errors.
///
/// Raised by field `clean` transforms when a value cannot be coerced into
/// the column representation.
///
/// # Examples
///
/// ```
/// use relorm_core::error::ValidationError;
///
/// let err = ValidationError::new("Expected an integer.", "invalid")
///     .with_param("field", "age");
/// assert_eq!(err.params["field"], "age");
///
/// let mut field_errors = std::collections::HashMap::new();
/// field_errors.insert(
///     "email".to_string(),
///     vec![ValidationError::new("Invalid email address.", "invalid")],
/// );
/// let err = ValidationError::with_field_errors(field_errors);
/// assert!(err.to_string().contains("email"));
/// ```
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The primary error message.
    pub message: String,
    /// A short code identifying the type of validation failure (e.g. "required", "invalid").
    pub code: String,
    /// Additional parameters providing context for the error message.
    pub params: HashMap<String, String>,
    /// Per-field validation errors, keyed by field name.
    pub field_errors: HashMap<String, Vec<Self>>,
}

impl ValidationError {
    /// Creates a new `ValidationError` with a message and code.
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            params: HashMap::new(),
            field_errors: HashMap::new(),
        }
    }

    /// Creates a `ValidationError` containing per-field errors.
    pub fn with_field_errors(field_errors: HashMap<String, Vec<Self>>) -> Self {
        Self {
            message: String::new(),
            code: String::new(),
            params: HashMap::new(),
            field_errors,
        }
    }

    /// Adds a parameter to this validation error.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.message.is_empty() {
            write!(f, "{}", self.message)?;
        } else if !self.field_errors.is_empty() {
            let mut first = true;
            for (field, errors) in &self.field_errors {
                for error in errors {
                    if !first {
                        write!(f, "; ")?;
                    }
                    write!(f, "{field}: {error}")?;
                    first = false;
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// The primary error type for relorm.
#[derive(Error, Debug)]
pub enum OrmError {
    // ── Result shape ─────────────────────────────────────────────────

    /// A single-result fetch matched zero rows.
    #[error("Object does not exist: {0}")]
    ObjectNotFound(String),

    /// A single-result fetch matched more than one row.
    #[error("Multiple objects returned when one expected: {0}")]
    MultipleObjectsReturned(String),

    // ── Query construction ───────────────────────────────────────────

    /// The query description is invalid: unknown path, unknown operator,
    /// conflicting options, attribute collision, or an unsupported
    /// combination such as row locking over a set operation.
    #[error("QuerySet error: {0}")]
    QuerySetError(String),

    /// A deferred field was read on a partially loaded instance.
    #[error("Field not loaded: {0}")]
    FieldNotLoaded(String),

    // ── Database ─────────────────────────────────────────────────────

    /// A generic database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A database integrity constraint was violated.
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    /// An operational database error (connection failure, etc.).
    #[error("Operational error: {0}")]
    OperationalError(String),

    // ── Validation ───────────────────────────────────────────────────

    /// A value failed a field's `clean` transform.
    #[error("Validation error: {0}")]
    ValidationError(ValidationError),

    // ── Configuration ────────────────────────────────────────────────

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Models or connections are improperly configured.
    #[error("Improperly configured: {0}")]
    ImproperlyConfigured(String),

    // ── Serialization ────────────────────────────────────────────────

    /// An error occurred during serialization or deserialization.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // ── IO ───────────────────────────────────────────────────────────

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrmError {
    /// Returns `true` for errors raised while building a query, before any I/O.
    pub const fn is_build_error(&self) -> bool {
        matches!(self, Self::QuerySetError(_))
    }

    /// Returns `true` for the not-found / multiple-found result-shape errors.
    pub const fn is_result_shape_error(&self) -> bool {
        matches!(
            self,
            Self::ObjectNotFound(_) | Self::MultipleObjectsReturned(_)
        )
    }
}

impl From<ValidationError> for OrmError {
    fn from(err: ValidationError) -> Self {
        Self::ValidationError(err)
    }
}

/// A convenience type alias for `Result<T, OrmError>`.
pub type OrmResult<T> = Result<T, OrmError>;
