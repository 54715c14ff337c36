//! Field type definitions for the ORM.
//!
//! [`FieldType`] selects the behaviour of a field; [`FieldDef`] captures all
//! metadata about a single model field and implements
//! [`Field`](super::Field). Relationship fields are declared by target model
//! name and resolved later by the [`ModelRegistry`](crate::registry::ModelRegistry),
//! which fills in [`FieldDef::relation`].

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use relorm_core::{OrmError, OrmResult, ValidationError};

use super::{Field, Traversal};
use crate::value::Value;

/// The type of a model field, determining its column type and value transforms.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum FieldType {
    /// Auto-incrementing 32-bit integer primary key.
    AutoField,
    /// Auto-incrementing 64-bit integer primary key.
    BigAutoField,
    /// Variable-length string with an optional max length.
    CharField,
    /// Unlimited-length text.
    TextField,
    /// 32-bit signed integer.
    IntegerField,
    /// 64-bit signed integer.
    BigIntegerField,
    /// 16-bit signed integer.
    SmallIntegerField,
    /// 64-bit floating-point number.
    FloatField,
    /// Boolean (true/false).
    BooleanField,
    /// Date without time.
    DateField,
    /// Date and time (stored without timezone).
    DateTimeField,
    /// Time without date.
    TimeField,
    /// UUID field.
    UuidField,
    /// Raw binary data.
    BinaryField,
    /// JSON data.
    JsonField,
    /// Many-to-one relationship.
    ForeignKey {
        /// The target model name.
        to: String,
        /// Behavior when the referenced row is deleted.
        on_delete: OnDelete,
        /// The name used for the reverse relation on the target.
        related_name: RelatedName,
    },
    /// One-to-one relationship (unique foreign key).
    OneToOneField {
        /// The target model name.
        to: String,
        /// Behavior when the referenced row is deleted.
        on_delete: OnDelete,
        /// The name used for the reverse relation on the target.
        related_name: RelatedName,
    },
    /// Many-to-many relationship through an association model.
    ManyToManyField {
        /// The target model name.
        to: String,
        /// Explicit association model; generated when `None`.
        through: Option<String>,
        /// The name used for the reverse relation on the target.
        related_name: RelatedName,
    },
    /// A reverse relation generated by the registry for a relation declared
    /// on another model.
    Reverse {
        /// The model declaring the forward relation.
        from_model: String,
        /// The forward relation's field name.
        from_field: String,
    },
}

impl FieldType {
    /// Converts one raw column value of this type into its model value.
    pub fn to_model(&self, raw: &Value) -> OrmResult<Value> {
        to_model_scalar(self, raw)
    }
}

/// Behavior when a referenced object is deleted through the cascading
/// delete path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OnDelete {
    /// Delete all related rows.
    Cascade,
    /// Refuse the deletion while related rows exist.
    Protect,
    /// Set the foreign key to NULL.
    SetNull,
    /// Leave related rows alone (the database may still refuse).
    DoNothing,
}

/// How the reverse side of a relation is named.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum RelatedName {
    /// `<source model lowercase>s_set`.
    #[default]
    Default,
    /// An explicit name.
    Named(String),
    /// No reverse relation is generated.
    Disabled,
}

impl RelatedName {
    /// Resolves the reverse name for a relation declared on `source_model`.
    pub fn resolve(&self, source_model: &str) -> Option<String> {
        match self {
            Self::Default => Some(format!("{}s_set", source_model.to_lowercase())),
            Self::Named(name) => Some(name.clone()),
            Self::Disabled => None,
        }
    }
}

/// One column of a join condition.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ColumnPair {
    /// Column on the near side.
    pub local: String,
    /// Column on the far side.
    pub remote: String,
    /// Type of the key value, used to convert raw key columns.
    pub value_type: FieldType,
}

/// A relationship resolved against the registry.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Relation {
    /// This model holds the key: `local` columns reference the target's primary key.
    Forward {
        /// Target model name.
        target: String,
        /// Key columns, local to this model.
        columns: Vec<ColumnPair>,
        /// Reverse relation name on the target, if one exists.
        reverse_name: Option<String>,
        /// One-to-one relations never fan out in either direction.
        unique: bool,
    },
    /// The target holds the key: this model's primary key (`local`) is
    /// referenced by the target's columns (`remote`).
    Reverse {
        /// Model declaring the forward relation.
        target: String,
        /// Primary-key columns here paired with the key columns on the target.
        columns: Vec<ColumnPair>,
        /// Name of the forward field on the target.
        reverse_name: String,
        /// One-to-one relations yield a single object.
        unique: bool,
    },
    /// Routed through an association model.
    ManyToMany {
        /// Target model name.
        target: String,
        /// Association model name.
        through: String,
        /// Association field pointing back at this model.
        through_from: String,
        /// Association field pointing at the target.
        through_to: String,
        /// This model's primary key paired with the association's key columns.
        from_columns: Vec<ColumnPair>,
        /// The association's key columns paired with the target's primary key.
        to_columns: Vec<ColumnPair>,
        /// Reverse relation name on the target, if one exists.
        reverse_name: Option<String>,
    },
}

impl Relation {
    /// The model on the far side of the relation.
    pub fn target(&self) -> &str {
        match self {
            Self::Forward { target, .. }
            | Self::Reverse { target, .. }
            | Self::ManyToMany { target, .. } => target,
        }
    }

    /// The name the target uses to navigate back.
    pub fn reverse_name(&self) -> Option<&str> {
        match self {
            Self::Forward { reverse_name, .. } | Self::ManyToMany { reverse_name, .. } => {
                reverse_name.as_deref()
            }
            Self::Reverse { reverse_name, .. } => Some(reverse_name),
        }
    }

    /// Whether following this relation can yield more than one object.
    pub const fn is_many(&self) -> bool {
        match self {
            Self::Forward { .. } => false,
            Self::Reverse { unique, .. } => !*unique,
            Self::ManyToMany { .. } => true,
        }
    }
}

/// Complete definition of a model field.
///
/// # Examples
///
/// ```
/// use relorm_db::fields::{FieldDef, FieldType};
///
/// let title = FieldDef::new("title", FieldType::CharField).max_length(200);
/// assert_eq!(title.column, "title");
///
/// let author = FieldDef::foreign_key("author", "User").nullable();
/// assert_eq!(author.column, "author_id");
/// assert!(author.is_relation());
/// ```
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// The attribute name of this field.
    pub name: String,
    /// The database column name (may differ from `name`).
    pub column: String,
    /// The type of this field.
    pub field_type: FieldType,
    /// Whether this field is (part of) the primary key.
    pub primary_key: bool,
    /// Whether NULL is allowed in the database.
    pub null: bool,
    /// Whether a UNIQUE constraint is applied.
    pub unique: bool,
    /// Default value for new instances.
    pub default: Option<Value>,
    /// Maximum character length (for `CharField`).
    pub max_length: Option<usize>,
    /// Excluded from projections by `exclude_secrets()`.
    pub secret: bool,
    /// Filled in by the registry for relationship fields.
    pub relation: Option<Relation>,
}

impl FieldDef {
    /// Creates a new `FieldDef` with sensible defaults.
    ///
    /// Foreign keys and one-to-one fields default to a `<name>_id` column.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        let column = match field_type {
            FieldType::ForeignKey { .. } | FieldType::OneToOneField { .. } => {
                format!("{name}_id")
            }
            _ => name.clone(),
        };
        Self {
            name,
            column,
            field_type,
            primary_key: false,
            null: false,
            unique: false,
            default: None,
            max_length: None,
            secret: false,
            relation: None,
        }
    }

    /// An auto-incrementing integer primary key named `name`.
    pub fn auto(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::BigAutoField).primary_key()
    }

    /// A many-to-one relation to `to`.
    pub fn foreign_key(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldType::ForeignKey {
                to: to.into(),
                on_delete: OnDelete::Cascade,
                related_name: RelatedName::Default,
            },
        )
    }

    /// A one-to-one relation to `to`.
    pub fn one_to_one(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldType::OneToOneField {
                to: to.into(),
                on_delete: OnDelete::Cascade,
                related_name: RelatedName::Default,
            },
        )
        .unique()
    }

    /// A many-to-many relation to `to`.
    pub fn many_to_many(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldType::ManyToManyField {
                to: to.into(),
                through: None,
                related_name: RelatedName::Default,
            },
        )
    }

    /// Sets the database column name.
    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Marks this field as (part of) the primary key.
    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Allows NULL values in the database.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    /// Sets the maximum character length.
    #[must_use]
    pub const fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Marks this field as having a UNIQUE constraint.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets the default value for this field.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Marks this field as secret.
    #[must_use]
    pub const fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    /// Sets the reverse relation name of a relationship field.
    #[must_use]
    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        self.set_related_name(RelatedName::Named(name.into()));
        self
    }

    /// Suppresses the reverse relation of a relationship field.
    #[must_use]
    pub fn no_reverse(mut self) -> Self {
        self.set_related_name(RelatedName::Disabled);
        self
    }

    /// Sets the ON DELETE behaviour of a foreign key.
    #[must_use]
    pub fn on_delete(mut self, action: OnDelete) -> Self {
        if let FieldType::ForeignKey { on_delete, .. } | FieldType::OneToOneField { on_delete, .. } =
            &mut self.field_type
        {
            *on_delete = action;
        }
        self
    }

    /// Routes a many-to-many relation through an explicit association model.
    #[must_use]
    pub fn through(mut self, model: impl Into<String>) -> Self {
        if let FieldType::ManyToManyField { through, .. } = &mut self.field_type {
            *through = Some(model.into());
        }
        self
    }

    fn set_related_name(&mut self, name: RelatedName) {
        match &mut self.field_type {
            FieldType::ForeignKey { related_name, .. }
            | FieldType::OneToOneField { related_name, .. }
            | FieldType::ManyToManyField { related_name, .. } => *related_name = name,
            _ => {}
        }
    }

    /// Returns `true` if this field represents a relational field.
    pub const fn is_relation(&self) -> bool {
        matches!(
            self.field_type,
            FieldType::ForeignKey { .. }
                | FieldType::OneToOneField { .. }
                | FieldType::ManyToManyField { .. }
                | FieldType::Reverse { .. }
        )
    }

    /// Returns `true` if this field is stored in columns of its own table.
    pub const fn is_concrete(&self) -> bool {
        !matches!(
            self.field_type,
            FieldType::ManyToManyField { .. } | FieldType::Reverse { .. }
        )
    }

    /// Returns `true` for database-generated integer keys.
    pub const fn is_auto(&self) -> bool {
        matches!(self.field_type, FieldType::AutoField | FieldType::BigAutoField)
    }

    /// The declared relation target, if this is a forward relation.
    pub fn relation_target(&self) -> Option<&str> {
        match &self.field_type {
            FieldType::ForeignKey { to, .. }
            | FieldType::OneToOneField { to, .. }
            | FieldType::ManyToManyField { to, .. } => Some(to),
            _ => None,
        }
    }

    fn invalid(&self, value: &Value, expected: &str) -> OrmError {
        ValidationError::new(
            format!("'{}' expects {expected}, got {value:?}", self.name),
            "invalid",
        )
        .with_param("field", self.name.clone())
        .into()
    }
}

impl Field for FieldDef {
    fn name(&self) -> &str {
        &self.name
    }

    fn columns(&self) -> Vec<String> {
        match (&self.field_type, &self.relation) {
            (FieldType::ManyToManyField { .. } | FieldType::Reverse { .. }, _) => Vec::new(),
            (_, Some(Relation::Forward { columns, .. })) => {
                columns.iter().map(|c| c.local.clone()).collect()
            }
            _ => vec![self.column.clone()],
        }
    }

    fn clean(&self, value: &Value) -> OrmResult<Vec<(String, Value)>> {
        let columns = self.columns();
        if columns.is_empty() {
            return Err(OrmError::QuerySetError(format!(
                "'{}' is not stored on its model and cannot be assigned",
                self.name
            )));
        }
        if let Some(Relation::Forward { columns: pairs, .. }) = &self.relation {
            let parts = value.as_parts();
            if value.is_null() {
                return Ok(columns.into_iter().map(|c| (c, Value::Null)).collect());
            }
            if parts.len() != pairs.len() {
                return Err(self.invalid(value, &format!("{} key values", pairs.len())));
            }
            return pairs
                .iter()
                .zip(parts)
                .map(|(pair, part)| {
                    clean_scalar(&pair.value_type, part)
                        .map(|v| (pair.local.clone(), v))
                        .ok_or_else(|| self.invalid(part, "a key value"))
                })
                .collect();
        }
        if let (Some(max), Value::String(s)) = (self.max_length, value) {
            if s.chars().count() > max {
                return Err(ValidationError::new(
                    format!("'{}' is longer than {max} characters", self.name),
                    "max_length",
                )
                .with_param("max", max.to_string())
                .into());
            }
        }
        let cleaned = clean_scalar(&self.field_type, value)
            .ok_or_else(|| self.invalid(value, type_label(&self.field_type)))?;
        Ok(vec![(self.column.clone(), cleaned)])
    }

    fn to_model(&self, raw: &[Value]) -> OrmResult<Value> {
        if let Some(Relation::Forward { columns: pairs, .. }) = &self.relation {
            if raw.iter().all(Value::is_null) {
                return Ok(Value::Null);
            }
            let parts: Vec<Value> = pairs
                .iter()
                .zip(raw)
                .map(|(pair, v)| to_model_scalar(&pair.value_type, v))
                .collect::<OrmResult<_>>()?;
            return Ok(if parts.len() == 1 {
                parts.into_iter().next().unwrap_or(Value::Null)
            } else {
                Value::List(parts)
            });
        }
        match raw.first() {
            Some(v) => to_model_scalar(&self.field_type, v),
            None => Ok(Value::Null),
        }
    }

    fn traverse_field(&self, path: &str) -> Option<Traversal> {
        let relation = self.relation.as_ref()?;
        let (head, remainder) = path.split_once("__").unwrap_or((path, ""));
        if head != self.name {
            return None;
        }
        Some(Traversal {
            target: relation.target().to_string(),
            reverse_segment: relation.reverse_name().map(str::to_string),
            remainder: remainder.to_string(),
        })
    }
}

const fn type_label(field_type: &FieldType) -> &'static str {
    match field_type {
        FieldType::AutoField
        | FieldType::BigAutoField
        | FieldType::IntegerField
        | FieldType::BigIntegerField
        | FieldType::SmallIntegerField => "an integer",
        FieldType::FloatField => "a number",
        FieldType::BooleanField => "a boolean",
        FieldType::CharField | FieldType::TextField => "a string",
        FieldType::DateField => "a date",
        FieldType::DateTimeField => "a datetime",
        FieldType::TimeField => "a time",
        FieldType::UuidField => "a UUID",
        FieldType::BinaryField => "bytes",
        FieldType::JsonField => "JSON",
        _ => "a key value",
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .or_else(|| s.parse::<NaiveDateTime>().ok())
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.naive_utc())
        })
}

/// Coerces an input value into the representation bound for `field_type`.
/// Returns `None` when the value cannot be coerced.
fn clean_scalar(field_type: &FieldType, value: &Value) -> Option<Value> {
    if value.is_null() {
        return Some(Value::Null);
    }
    match field_type {
        FieldType::AutoField
        | FieldType::BigAutoField
        | FieldType::IntegerField
        | FieldType::BigIntegerField
        | FieldType::SmallIntegerField => match value {
            Value::Int(i) => Some(Value::Int(*i)),
            Value::String(s) => s.trim().parse().ok().map(Value::Int),
            #[allow(clippy::cast_possible_truncation)]
            Value::Float(f) if f.fract() == 0.0 => Some(Value::Int(*f as i64)),
            _ => None,
        },
        FieldType::FloatField => match value {
            Value::Float(f) => Some(Value::Float(*f)),
            Value::Int(i) => Some(Value::Float(*i as f64)),
            Value::String(s) => s.trim().parse().ok().map(Value::Float),
            _ => None,
        },
        FieldType::BooleanField => match value {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::Int(0) => Some(Value::Bool(false)),
            Value::Int(1) => Some(Value::Bool(true)),
            _ => None,
        },
        FieldType::CharField | FieldType::TextField => match value {
            Value::String(s) => Some(Value::String(s.clone())),
            _ => None,
        },
        FieldType::DateField => match value {
            Value::Date(d) => Some(Value::Date(*d)),
            Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(Value::Date),
            _ => None,
        },
        FieldType::DateTimeField => match value {
            Value::DateTime(dt) => Some(Value::DateTime(*dt)),
            Value::DateTimeTz(dt) => Some(Value::DateTime(dt.naive_utc())),
            Value::String(s) => parse_datetime(s).map(Value::DateTime),
            _ => None,
        },
        FieldType::TimeField => match value {
            Value::Time(t) => Some(Value::Time(*t)),
            Value::String(s) => NaiveTime::parse_from_str(s, "%H:%M:%S%.f").ok().map(Value::Time),
            _ => None,
        },
        FieldType::UuidField => match value {
            Value::Uuid(u) => Some(Value::Uuid(*u)),
            Value::String(s) => uuid::Uuid::parse_str(s).ok().map(Value::Uuid),
            _ => None,
        },
        FieldType::BinaryField => match value {
            Value::Bytes(b) => Some(Value::Bytes(b.clone())),
            _ => None,
        },
        FieldType::JsonField => match value {
            Value::Json(j) => Some(Value::Json(j.clone())),
            other => serde_json::to_value(other.to_string()).ok().map(Value::Json),
        },
        // Keys of relation targets pass through unchanged.
        _ => Some(value.clone()),
    }
}

/// Converts a raw column value as returned by a backend into the model value.
fn to_model_scalar(field_type: &FieldType, raw: &Value) -> OrmResult<Value> {
    let bad = || {
        OrmError::DatabaseError(format!(
            "Cannot convert {raw:?} into {}",
            type_label(field_type)
        ))
    };
    if raw.is_null() {
        return Ok(Value::Null);
    }
    Ok(match field_type {
        FieldType::BooleanField => match raw {
            Value::Bool(b) => Value::Bool(*b),
            Value::Int(i) => Value::Bool(*i != 0),
            _ => return Err(bad()),
        },
        FieldType::FloatField => match raw {
            Value::Float(f) => Value::Float(*f),
            Value::Int(i) => Value::Float(*i as f64),
            _ => return Err(bad()),
        },
        FieldType::DateField => match raw {
            Value::Date(d) => Value::Date(*d),
            Value::String(s) => {
                Value::Date(NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| bad())?)
            }
            _ => return Err(bad()),
        },
        FieldType::DateTimeField => match raw {
            Value::DateTime(dt) => Value::DateTime(*dt),
            Value::DateTimeTz(dt) => Value::DateTime(dt.naive_utc()),
            Value::String(s) => Value::DateTime(parse_datetime(s).ok_or_else(bad)?),
            _ => return Err(bad()),
        },
        FieldType::TimeField => match raw {
            Value::Time(t) => Value::Time(*t),
            Value::String(s) => {
                Value::Time(NaiveTime::parse_from_str(s, "%H:%M:%S%.f").map_err(|_| bad())?)
            }
            _ => return Err(bad()),
        },
        FieldType::UuidField => match raw {
            Value::Uuid(u) => Value::Uuid(*u),
            Value::String(s) => Value::Uuid(uuid::Uuid::parse_str(s).map_err(|_| bad())?),
            Value::Bytes(b) => Value::Uuid(uuid::Uuid::from_slice(b).map_err(|_| bad())?),
            _ => return Err(bad()),
        },
        FieldType::JsonField => match raw {
            Value::Json(j) => Value::Json(j.clone()),
            Value::String(s) => Value::Json(
                serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone())),
            ),
            Value::Int(i) => Value::Json(serde_json::json!(i)),
            Value::Float(f) => Value::Json(serde_json::json!(f)),
            Value::Bool(b) => Value::Json(serde_json::json!(b)),
            _ => return Err(bad()),
        },
        FieldType::CharField | FieldType::TextField => match raw {
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        },
        _ => raw.clone(),
    })
}
