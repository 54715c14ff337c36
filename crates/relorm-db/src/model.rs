//! Model descriptors.
//!
//! A [`ModelMeta`] is the explicit description of one model: its table, the
//! database alias it lives in, its fields, and the external policy that
//! decides how deletes are executed. Descriptors are built with
//! [`ModelBuilder`] and handed to the [`ModelRegistry`](crate::registry::ModelRegistry),
//! which resolves relationships between them.
//!
//! # Examples
//!
//! ```
//! use relorm_db::fields::{FieldDef, FieldType};
//! use relorm_db::model::ModelBuilder;
//!
//! let post = ModelBuilder::new("Post")
//!     .table("posts")
//!     .field(FieldDef::auto("id"))
//!     .field(FieldDef::new("title", FieldType::CharField).max_length(200))
//!     .field(FieldDef::foreign_key("author", "User").related_name("posts"))
//!     .build()
//!     .unwrap();
//! assert_eq!(post.pk_names(), vec!["id"]);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use relorm_core::{OrmError, OrmResult, DEFAULT_DB_ALIAS};

use crate::fields::{Field, FieldDef};
use crate::instance::Instance;

/// How `QuerySet::delete` removes rows of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// One bulk `DELETE` statement; no per-instance hooks run.
    Fast,
    /// Rows are loaded batch by batch and deleted one instance at a time so
    /// that delete hooks run; each batch is its own transaction.
    Cascading,
}

/// Per-instance lifecycle hooks attached to a model descriptor.
///
/// All methods have default no-op implementations. Returning `Err` from a
/// `pre_*` hook aborts the operation and rolls back its transaction.
pub trait InstanceHooks: Send + Sync {
    /// Called before an INSERT (`created == true`) or UPDATE.
    fn pre_save(&self, _instance: &Instance, _created: bool) -> OrmResult<()> {
        Ok(())
    }

    /// Called after a successful save, inside the same transaction.
    fn post_save(&self, _instance: &Instance, _created: bool) {}

    /// Called before an instance's row is deleted.
    fn pre_delete(&self, _instance: &Instance) -> OrmResult<()> {
        Ok(())
    }

    /// Called after an instance's row is deleted, inside the same transaction.
    fn post_delete(&self, _instance: &Instance) {}
}

/// The explicit description of a model.
pub struct ModelMeta {
    /// The model name used in relations and the registry.
    pub name: String,
    /// The database table name.
    pub table: String,
    /// Schema the table lives in, when not the backend default.
    pub schema: Option<String>,
    /// Alias of the database holding the table.
    pub database: String,
    /// Declared fields plus reverse relations added by the registry.
    pub fields: Vec<FieldDef>,
    /// Default ordering as field paths (`-name` for descending).
    pub ordering: Vec<String>,
    /// How bulk deletes run.
    pub delete_policy: DeletePolicy,
    /// Optional lifecycle hooks.
    pub hooks: Option<Arc<dyn InstanceHooks>>,
}

impl fmt::Debug for ModelMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelMeta")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("database", &self.database)
            .field("fields", &self.fields.iter().map(|f| &f.name).collect::<Vec<_>>())
            .field("delete_policy", &self.delete_policy)
            .finish_non_exhaustive()
    }
}

impl ModelMeta {
    /// Looks up a field by attribute name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Looks up a field by name, failing with a query error.
    pub fn field_or_err(&self, name: &str) -> OrmResult<&FieldDef> {
        self.field(name).ok_or_else(|| {
            OrmError::QuerySetError(format!(
                "Cannot resolve '{name}' into a field of {}. Choices are: {}",
                self.name,
                self.fields
                    .iter()
                    .map(|f| f.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
    }

    /// The primary-key fields in declaration order.
    pub fn pk_fields(&self) -> Vec<&FieldDef> {
        self.fields.iter().filter(|f| f.primary_key).collect()
    }

    /// The primary-key field names.
    pub fn pk_names(&self) -> Vec<&str> {
        self.pk_fields().into_iter().map(|f| f.name.as_str()).collect()
    }

    /// The primary-key columns in declaration order.
    pub fn pk_columns(&self) -> Vec<String> {
        self.pk_fields().into_iter().flat_map(Field::columns).collect()
    }

    /// Fields stored in this model's own table.
    pub fn concrete_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_concrete())
    }

    /// Whether any lifecycle hooks are attached.
    pub fn has_hooks(&self) -> bool {
        self.hooks.is_some()
    }
}

/// Builds a [`ModelMeta`].
pub struct ModelBuilder {
    name: String,
    table: Option<String>,
    schema: Option<String>,
    database: String,
    fields: Vec<FieldDef>,
    ordering: Vec<String>,
    delete_policy: Option<DeletePolicy>,
    hooks: Option<Arc<dyn InstanceHooks>>,
}

impl ModelBuilder {
    /// Starts a descriptor for the model `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            schema: None,
            database: DEFAULT_DB_ALIAS.to_string(),
            fields: Vec::new(),
            ordering: Vec::new(),
            delete_policy: None,
            hooks: None,
        }
    }

    /// Sets the table name (defaults to the lowercased model name).
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Sets the schema.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Sets the database alias (defaults to `"default"`).
    #[must_use]
    pub fn database(mut self, alias: impl Into<String>) -> Self {
        self.database = alias.into();
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Sets the default ordering.
    #[must_use]
    pub fn ordering(mut self, ordering: &[&str]) -> Self {
        self.ordering = ordering.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Chooses the delete strategy explicitly.
    #[must_use]
    pub const fn delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = Some(policy);
        self
    }

    /// Attaches lifecycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn InstanceHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Validates and produces the descriptor.
    ///
    /// A model without a primary key gets an auto-incrementing `id` field.
    /// Without an explicit delete policy, models with hooks delete with
    /// [`DeletePolicy::Cascading`] and all others with [`DeletePolicy::Fast`].
    pub fn build(self) -> OrmResult<ModelMeta> {
        let mut fields = self.fields;
        let mut seen = HashSet::new();
        for field in &fields {
            if field.name == "pk" || field.name.contains("__") {
                return Err(OrmError::ImproperlyConfigured(format!(
                    "{}: '{}' is not a valid field name",
                    self.name, field.name
                )));
            }
            if !seen.insert(field.name.clone()) {
                return Err(OrmError::ImproperlyConfigured(format!(
                    "{}: duplicate field '{}'",
                    self.name, field.name
                )));
            }
            if field.primary_key && !field.is_concrete() {
                return Err(OrmError::ImproperlyConfigured(format!(
                    "{}: '{}' cannot be a primary key",
                    self.name, field.name
                )));
            }
        }
        if !fields.iter().any(|f| f.primary_key) {
            if seen.contains("id") {
                return Err(OrmError::ImproperlyConfigured(format!(
                    "{}: no primary key declared and 'id' is taken",
                    self.name
                )));
            }
            fields.insert(0, FieldDef::auto("id"));
        }
        let delete_policy = self.delete_policy.unwrap_or(if self.hooks.is_some() {
            DeletePolicy::Cascading
        } else {
            DeletePolicy::Fast
        });
        Ok(ModelMeta {
            table: self.table.unwrap_or_else(|| self.name.to_lowercase()),
            name: self.name,
            schema: self.schema,
            database: self.database,
            fields,
            ordering: self.ordering,
            delete_policy,
            hooks: self.hooks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldType;

    struct NoopHooks;
    impl InstanceHooks for NoopHooks {}

    #[test]
    fn test_build_adds_auto_pk() {
        let meta = ModelBuilder::new("Tag")
            .field(FieldDef::new("name", FieldType::CharField))
            .build()
            .unwrap();
        assert_eq!(meta.table, "tag");
        assert_eq!(meta.pk_names(), vec!["id"]);
        assert_eq!(meta.fields[0].name, "id");
        assert_eq!(meta.database, "default");
    }

    #[test]
    fn test_composite_pk_columns() {
        let meta = ModelBuilder::new("Seat")
            .field(FieldDef::new("row", FieldType::CharField).primary_key())
            .field(FieldDef::new("number", FieldType::IntegerField).primary_key())
            .build()
            .unwrap();
        assert_eq!(meta.pk_columns(), vec!["row".to_string(), "number".to_string()]);
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let err = ModelBuilder::new("Tag")
            .field(FieldDef::new("name", FieldType::CharField))
            .field(FieldDef::new("name", FieldType::TextField))
            .build()
            .unwrap_err();
        assert!(matches!(err, OrmError::ImproperlyConfigured(_)));
    }

    #[test]
    fn test_reserved_names_rejected() {
        assert!(ModelBuilder::new("A")
            .field(FieldDef::new("pk", FieldType::IntegerField))
            .build()
            .is_err());
        assert!(ModelBuilder::new("A")
            .field(FieldDef::new("a__b", FieldType::IntegerField))
            .build()
            .is_err());
    }

    #[test]
    fn test_delete_policy_defaults() {
        let plain = ModelBuilder::new("A").build().unwrap();
        assert_eq!(plain.delete_policy, DeletePolicy::Fast);

        let hooked = ModelBuilder::new("B")
            .hooks(Arc::new(NoopHooks))
            .build()
            .unwrap();
        assert_eq!(hooked.delete_policy, DeletePolicy::Cascading);

        let forced = ModelBuilder::new("C")
            .hooks(Arc::new(NoopHooks))
            .delete_policy(DeletePolicy::Fast)
            .build()
            .unwrap();
        assert_eq!(forced.delete_policy, DeletePolicy::Fast);
    }

    #[test]
    fn test_field_or_err_lists_choices() {
        let meta = ModelBuilder::new("Tag")
            .field(FieldDef::new("name", FieldType::CharField))
            .build()
            .unwrap();
        let err = meta.field_or_err("nme").unwrap_err().to_string();
        assert!(err.contains("Choices are: id, name"));
    }
}
