//! Model registration and lazy relationship resolution.
//!
//! Relationships are declared by target model *name*. Registering a model
//! whose relation target is not known yet queues a callback under the
//! target's name; the callback fires as soon as that target registers. When
//! a relation resolves, its join columns are computed, the reverse relation
//! is added to the target, and for many-to-many relations the association
//! model is generated and registered. Self-referential and mutually
//! referential graphs therefore need no particular registration order.
//!
//! ```
//! use relorm_db::fields::{FieldDef, FieldType};
//! use relorm_db::model::ModelBuilder;
//! use relorm_db::registry::ModelRegistry;
//!
//! let mut registry = ModelRegistry::new();
//! // Post refers to User before User exists.
//! registry
//!     .register(ModelBuilder::new("Post")
//!         .field(FieldDef::foreign_key("author", "User").related_name("posts"))
//!         .build().unwrap())
//!     .unwrap();
//! registry
//!     .register(ModelBuilder::new("User")
//!         .field(FieldDef::new("name", FieldType::CharField))
//!         .build().unwrap())
//!     .unwrap();
//! let registry = registry.freeze().unwrap();
//! assert!(registry.get("User").unwrap().field("posts").is_some());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use relorm_core::{OrmError, OrmResult};

use crate::fields::{ColumnPair, Field, FieldDef, FieldType, Relation, RelatedName};
use crate::model::{ModelBuilder, ModelMeta};

type RelationCallback = Box<dyn FnOnce(&mut ModelRegistry) -> OrmResult<()> + Send>;

/// Mutable registry used while models are being declared.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelMeta>,
    order: Vec<String>,
    pending: HashMap<String, Vec<RelationCallback>>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a model with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Registers a model and resolves every relation that can be resolved.
    pub fn register(&mut self, meta: ModelMeta) -> OrmResult<()> {
        let name = meta.name.clone();
        if self.models.contains_key(&name) {
            return Err(OrmError::ImproperlyConfigured(format!(
                "Model '{name}' is already registered"
            )));
        }
        let relations: Vec<String> = meta
            .fields
            .iter()
            .filter(|f| f.relation_target().is_some())
            .map(|f| f.name.clone())
            .collect();
        self.models.insert(name.clone(), meta);
        self.order.push(name.clone());

        // Own relations first: an association model must have its keys
        // resolved before relations routed through it are retried.
        for field in relations {
            self.resolve_relation(&name, &field)?;
        }
        if let Some(callbacks) = self.pending.remove(&name) {
            for callback in callbacks {
                callback(self)?;
            }
        }
        tracing::debug!(model = %name, "relorm.model_registered");
        Ok(())
    }

    /// Names of targets that are still unknown.
    pub fn unresolved(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pending.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Finishes registration.
    ///
    /// Fails with `ImproperlyConfigured` if any relation still points at a
    /// model that was never registered.
    pub fn freeze(self) -> OrmResult<Arc<Registry>> {
        if !self.pending.is_empty() {
            return Err(OrmError::ImproperlyConfigured(format!(
                "Unresolved relation targets: {}",
                self.unresolved().join(", ")
            )));
        }
        let mut models = self.models;
        let order: Vec<Arc<ModelMeta>> = self
            .order
            .iter()
            .filter_map(|name| models.remove(name))
            .map(Arc::new)
            .collect();
        Ok(Arc::new(Registry {
            by_name: order
                .iter()
                .map(|m| (m.name.clone(), Arc::clone(m)))
                .collect(),
            order,
        }))
    }

    fn defer(&mut self, waiting_on: &str, source: &str, field: &str) {
        let source = source.to_string();
        let field = field.to_string();
        self.pending
            .entry(waiting_on.to_string())
            .or_default()
            .push(Box::new(move |registry: &mut Self| {
                registry.resolve_relation(&source, &field)
            }));
    }

    fn meta(&self, name: &str) -> OrmResult<&ModelMeta> {
        self.models
            .get(name)
            .ok_or_else(|| OrmError::ImproperlyConfigured(format!("Unknown model '{name}'")))
    }

    fn meta_mut(&mut self, name: &str) -> OrmResult<&mut ModelMeta> {
        self.models
            .get_mut(name)
            .ok_or_else(|| OrmError::ImproperlyConfigured(format!("Unknown model '{name}'")))
    }

    fn resolve_relation(&mut self, source: &str, field_name: &str) -> OrmResult<()> {
        let field = self.meta(source)?.field_or_err(field_name)?.clone();
        let Some(target) = field.relation_target().map(str::to_string) else {
            return Ok(());
        };
        if !self.models.contains_key(&target) {
            self.defer(&target, source, field_name);
            return Ok(());
        }
        match field.field_type.clone() {
            FieldType::ForeignKey { related_name, .. } => {
                self.resolve_foreign_key(source, &field, &target, &related_name, false)
            }
            FieldType::OneToOneField { related_name, .. } => {
                self.resolve_foreign_key(source, &field, &target, &related_name, true)
            }
            FieldType::ManyToManyField {
                through,
                related_name,
                ..
            } => self.resolve_many_to_many(source, &field, &target, through, &related_name),
            _ => Ok(()),
        }
    }

    fn key_pairs(&self, field: &FieldDef, target: &str) -> OrmResult<Vec<ColumnPair>> {
        let target_meta = self.meta(target)?;
        let pk_fields = target_meta.pk_fields();
        let single = pk_fields.len() == 1;
        Ok(pk_fields
            .into_iter()
            .map(|pk| ColumnPair {
                local: if single {
                    field.column.clone()
                } else {
                    format!("{}_{}", field.name, pk.column)
                },
                remote: pk.column.clone(),
                value_type: pk.field_type.clone(),
            })
            .collect())
    }

    fn add_reverse_field(&mut self, target: &str, field: FieldDef) -> OrmResult<()> {
        let target_meta = self.meta_mut(target)?;
        if target_meta.field(&field.name).is_some() {
            return Err(OrmError::ImproperlyConfigured(format!(
                "Reverse relation '{}' clashes with an existing field on {target}",
                field.name
            )));
        }
        target_meta.fields.push(field);
        Ok(())
    }

    fn resolve_foreign_key(
        &mut self,
        source: &str,
        field: &FieldDef,
        target: &str,
        related_name: &RelatedName,
        unique: bool,
    ) -> OrmResult<()> {
        let columns = self.key_pairs(field, target)?;
        let reverse_name = related_name.resolve(source);

        if let Some(reverse) = &reverse_name {
            let mut back = FieldDef::new(
                reverse.clone(),
                FieldType::Reverse {
                    from_model: source.to_string(),
                    from_field: field.name.clone(),
                },
            );
            back.relation = Some(Relation::Reverse {
                target: source.to_string(),
                columns: columns
                    .iter()
                    .map(|c| ColumnPair {
                        local: c.remote.clone(),
                        remote: c.local.clone(),
                        value_type: c.value_type.clone(),
                    })
                    .collect(),
                reverse_name: field.name.clone(),
                unique,
            });
            self.add_reverse_field(target, back)?;
        }

        let source_field = self
            .meta_mut(source)?
            .fields
            .iter_mut()
            .find(|f| f.name == field.name)
            .ok_or_else(|| OrmError::ImproperlyConfigured(format!("{source}.{} vanished", field.name)))?;
        source_field.relation = Some(Relation::Forward {
            target: target.to_string(),
            columns,
            reverse_name,
            unique,
        });
        Ok(())
    }

    fn resolve_many_to_many(
        &mut self,
        source: &str,
        field: &FieldDef,
        target: &str,
        through: Option<String>,
        related_name: &RelatedName,
    ) -> OrmResult<()> {
        let through = match through {
            Some(name) => {
                if !self.models.contains_key(&name) {
                    self.defer(&name, source, &field.name);
                    return Ok(());
                }
                name
            }
            None => self.generate_through(source, field, target)?,
        };

        let (from_field, to_field) = self.through_keys(&through, source, target)?;
        let (Some(Relation::Forward { columns: from_cols, .. }), Some(Relation::Forward { columns: to_cols, .. })) =
            (from_field.relation.clone(), to_field.relation.clone())
        else {
            // The association's own keys are still waiting on a model.
            let waiting = [&from_field, &to_field]
                .into_iter()
                .find(|f| f.relation.is_none())
                .and_then(|f| f.relation_target().map(str::to_string))
                .unwrap_or_else(|| through.clone());
            self.defer(&waiting, source, &field.name);
            return Ok(());
        };

        // source.pk -> through.from ; through.to -> target.pk
        let from_columns: Vec<ColumnPair> = from_cols
            .iter()
            .map(|c| ColumnPair {
                local: c.remote.clone(),
                remote: c.local.clone(),
                value_type: c.value_type.clone(),
            })
            .collect();
        let to_columns = to_cols;
        let reverse_name = related_name.resolve(source);

        if let Some(reverse) = &reverse_name {
            let mut back = FieldDef::new(
                reverse.clone(),
                FieldType::Reverse {
                    from_model: source.to_string(),
                    from_field: field.name.clone(),
                },
            );
            back.relation = Some(Relation::ManyToMany {
                target: source.to_string(),
                through: through.clone(),
                through_from: to_field.name.clone(),
                through_to: from_field.name.clone(),
                from_columns: to_columns
                    .iter()
                    .map(|c| ColumnPair {
                        local: c.remote.clone(),
                        remote: c.local.clone(),
                        value_type: c.value_type.clone(),
                    })
                    .collect(),
                to_columns: from_columns
                    .iter()
                    .map(|c| ColumnPair {
                        local: c.remote.clone(),
                        remote: c.local.clone(),
                        value_type: c.value_type.clone(),
                    })
                    .collect(),
                reverse_name: Some(field.name.clone()),
            });
            self.add_reverse_field(target, back)?;
        }

        let source_field = self
            .meta_mut(source)?
            .fields
            .iter_mut()
            .find(|f| f.name == field.name)
            .ok_or_else(|| OrmError::ImproperlyConfigured(format!("{source}.{} vanished", field.name)))?;
        source_field.relation = Some(Relation::ManyToMany {
            target: target.to_string(),
            through,
            through_from: from_field.name,
            through_to: to_field.name,
            from_columns,
            to_columns,
            reverse_name,
        });
        Ok(())
    }

    /// Registers the association model for an implicit many-to-many relation.
    fn generate_through(&mut self, source: &str, field: &FieldDef, target: &str) -> OrmResult<String> {
        let mut chars = field.name.chars();
        let capitalized: String = chars
            .next()
            .map(|c| c.to_uppercase().chain(chars).collect())
            .unwrap_or_default();
        let name = format!("{source}{capitalized}");
        let source_meta = self.meta(source)?;
        let table = format!("{}_{}", source_meta.table, field.name);
        let database = source_meta.database.clone();
        let schema = source_meta.schema.clone();

        let (from_name, to_name) = if source == target {
            let lower = source.to_lowercase();
            (format!("from_{lower}"), format!("to_{lower}"))
        } else {
            (source.to_lowercase(), target.to_lowercase())
        };
        let mut builder = ModelBuilder::new(name.clone())
            .table(table)
            .database(database)
            .field(FieldDef::auto("id"))
            .field(FieldDef::foreign_key(from_name, source).no_reverse())
            .field(FieldDef::foreign_key(to_name, target).no_reverse());
        if let Some(schema) = schema {
            builder = builder.schema(schema);
        }
        self.register(builder.build()?)?;
        Ok(name)
    }

    /// Finds the association fields pointing at `source` and `target`.
    fn through_keys(&self, through: &str, source: &str, target: &str) -> OrmResult<(FieldDef, FieldDef)> {
        let meta = self.meta(through)?;
        let mut keys = meta.fields.iter().filter(|f| {
            matches!(
                f.field_type,
                FieldType::ForeignKey { .. } | FieldType::OneToOneField { .. }
            )
        });
        let from = keys
            .clone()
            .find(|f| f.relation_target() == Some(source))
            .cloned();
        let to = keys
            .find(|f| {
                f.relation_target() == Some(target)
                    && from.as_ref().map_or(true, |from| from.name != f.name)
            })
            .cloned();
        match (from, to) {
            (Some(from), Some(to)) => Ok((from, to)),
            _ => Err(OrmError::ImproperlyConfigured(format!(
                "Association model '{through}' needs foreign keys to '{source}' and '{target}'"
            ))),
        }
    }
}

/// The frozen, shareable set of model descriptors.
#[derive(Debug)]
pub struct Registry {
    by_name: HashMap<String, Arc<ModelMeta>>,
    order: Vec<Arc<ModelMeta>>,
}

impl Registry {
    /// Looks up a model by name.
    pub fn get(&self, name: &str) -> OrmResult<&Arc<ModelMeta>> {
        self.by_name
            .get(name)
            .ok_or_else(|| OrmError::ImproperlyConfigured(format!("Unknown model '{name}'")))
    }

    /// All models in registration order (generated association models
    /// appear after the model declaring the relation).
    pub fn models(&self) -> &[Arc<ModelMeta>] {
        &self.order
    }

    /// The number of registered models.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` when no models are registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Finds the field named `name` on `model`, resolved through the registry.
    pub fn field(&self, model: &str, name: &str) -> OrmResult<&FieldDef> {
        self.get(model)?.field_or_err(name)
    }

    /// The physical columns of a field.
    pub fn columns_of(&self, model: &str, name: &str) -> OrmResult<Vec<String>> {
        Ok(self.field(model, name)?.columns())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::OnDelete;

    fn user() -> ModelMeta {
        ModelBuilder::new("User")
            .field(FieldDef::new("name", FieldType::CharField))
            .build()
            .unwrap()
    }

    fn post() -> ModelMeta {
        ModelBuilder::new("Post")
            .field(FieldDef::new("title", FieldType::CharField))
            .field(FieldDef::foreign_key("author", "User").related_name("posts"))
            .field(FieldDef::many_to_many("tags", "Tag").related_name("posts"))
            .build()
            .unwrap()
    }

    fn tag() -> ModelMeta {
        ModelBuilder::new("Tag")
            .field(FieldDef::new("label", FieldType::CharField))
            .build()
            .unwrap()
    }

    #[test]
    fn test_forward_before_target() {
        let mut reg = ModelRegistry::new();
        reg.register(post()).unwrap();
        assert_eq!(reg.unresolved(), vec!["Tag", "User"]);
        reg.register(user()).unwrap();
        reg.register(tag()).unwrap();
        let reg = reg.freeze().unwrap();

        let author = reg.field("Post", "author").unwrap();
        match author.relation.as_ref().unwrap() {
            Relation::Forward {
                target,
                columns,
                reverse_name,
                unique,
            } => {
                assert_eq!(target, "User");
                assert_eq!(columns[0].local, "author_id");
                assert_eq!(columns[0].remote, "id");
                assert_eq!(reverse_name.as_deref(), Some("posts"));
                assert!(!unique);
            }
            other => panic!("unexpected {other:?}"),
        }
        let posts = reg.field("User", "posts").unwrap();
        assert!(posts.relation.as_ref().unwrap().is_many());
        assert_eq!(posts.relation.as_ref().unwrap().reverse_name(), Some("author"));
    }

    #[test]
    fn test_many_to_many_generates_through() {
        let mut reg = ModelRegistry::new();
        reg.register(user()).unwrap();
        reg.register(tag()).unwrap();
        reg.register(post()).unwrap();
        let reg = reg.freeze().unwrap();

        let through = reg.get("PostTags").unwrap();
        assert_eq!(through.table, "post_tags");
        assert_eq!(
            through.concrete_fields().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["id", "post", "tag"]
        );

        match reg.field("Post", "tags").unwrap().relation.as_ref().unwrap() {
            Relation::ManyToMany {
                through,
                from_columns,
                to_columns,
                ..
            } => {
                assert_eq!(through, "PostTags");
                assert_eq!(from_columns[0].local, "id");
                assert_eq!(from_columns[0].remote, "post_id");
                assert_eq!(to_columns[0].local, "tag_id");
                assert_eq!(to_columns[0].remote, "id");
            }
            other => panic!("unexpected {other:?}"),
        }
        match reg.field("Tag", "posts").unwrap().relation.as_ref().unwrap() {
            Relation::ManyToMany {
                target,
                through_from,
                through_to,
                ..
            } => {
                assert_eq!(target, "Post");
                assert_eq!(through_from, "tag");
                assert_eq!(through_to, "post");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_self_referential() {
        let mut reg = ModelRegistry::new();
        reg.register(
            ModelBuilder::new("Node")
                .field(
                    FieldDef::foreign_key("parent", "Node")
                        .nullable()
                        .related_name("children")
                        .on_delete(OnDelete::SetNull),
                )
                .field(FieldDef::many_to_many("links", "Node").related_name("linked_from"))
                .build()
                .unwrap(),
        )
        .unwrap();
        let reg = reg.freeze().unwrap();
        assert!(reg.field("Node", "children").is_ok());
        let links = reg.get("NodeLinks").unwrap();
        assert!(links.field("from_node").is_some());
        assert!(links.field("to_node").is_some());
    }

    #[test]
    fn test_explicit_through_registered_later() {
        let mut reg = ModelRegistry::new();
        reg.register(
            ModelBuilder::new("Person")
                .field(FieldDef::many_to_many("groups", "Group").through("Membership"))
                .build()
                .unwrap(),
        )
        .unwrap();
        reg.register(ModelBuilder::new("Group").build().unwrap()).unwrap();
        reg.register(
            ModelBuilder::new("Membership")
                .field(FieldDef::foreign_key("person", "Person").no_reverse())
                .field(FieldDef::foreign_key("group", "Group").no_reverse())
                .field(FieldDef::new("role", FieldType::CharField))
                .build()
                .unwrap(),
        )
        .unwrap();
        let reg = reg.freeze().unwrap();
        match reg.field("Person", "groups").unwrap().relation.as_ref().unwrap() {
            Relation::ManyToMany { through, through_from, .. } => {
                assert_eq!(through, "Membership");
                assert_eq!(through_from, "person");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(reg.field("Group", "persons_set").is_ok());
    }

    #[test]
    fn test_composite_target_key_columns() {
        let mut reg = ModelRegistry::new();
        reg.register(
            ModelBuilder::new("Seat")
                .field(FieldDef::new("row", FieldType::CharField).primary_key())
                .field(FieldDef::new("number", FieldType::IntegerField).primary_key())
                .build()
                .unwrap(),
        )
        .unwrap();
        reg.register(
            ModelBuilder::new("Ticket")
                .field(FieldDef::foreign_key("seat", "Seat"))
                .build()
                .unwrap(),
        )
        .unwrap();
        let reg = reg.freeze().unwrap();
        assert_eq!(
            reg.columns_of("Ticket", "seat").unwrap(),
            vec!["seat_row".to_string(), "seat_number".to_string()]
        );
    }

    #[test]
    fn test_disabled_reverse() {
        let mut reg = ModelRegistry::new();
        reg.register(user()).unwrap();
        reg.register(
            ModelBuilder::new("Log")
                .field(FieldDef::foreign_key("user", "User").no_reverse())
                .build()
                .unwrap(),
        )
        .unwrap();
        let reg = reg.freeze().unwrap();
        assert_eq!(reg.get("User").unwrap().fields.len(), 2);
        let rel = reg.field("Log", "user").unwrap().relation.clone().unwrap();
        assert_eq!(rel.reverse_name(), None);
    }

    #[test]
    fn test_reverse_name_clash() {
        let mut reg = ModelRegistry::new();
        reg.register(
            ModelBuilder::new("User")
                .field(FieldDef::new("posts", FieldType::IntegerField))
                .build()
                .unwrap(),
        )
        .unwrap();
        let err = reg.register(post()).unwrap_err();
        assert!(matches!(err, OrmError::ImproperlyConfigured(_)));
    }

    #[test]
    fn test_freeze_reports_unresolved() {
        let mut reg = ModelRegistry::new();
        reg.register(post()).unwrap();
        let err = reg.freeze().unwrap_err();
        assert!(err.to_string().contains("Tag, User"));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut reg = ModelRegistry::new();
        reg.register(user()).unwrap();
        assert!(reg.register(user()).is_err());
    }
}
