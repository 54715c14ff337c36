//! Model instances.
//!
//! An [`Instance`] is a cheap, cloneable handle to one materialized row.
//! Clones share state, so identity is pointer identity: the result cache
//! hands out the same handle for the same primary key, and related objects
//! attached through `select_related` or `prefetch_related` are the very
//! handles other rows see.
//!
//! Instances hydrated from a partial projection (`only`/`defer`) are
//! *proxies*: reading an unloaded field fails with
//! [`OrmError::FieldNotLoaded`] until [`Instance::load_deferred`] (or
//! [`Instance::fetch`]) runs one point query for every missing field.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use relorm_core::{OrmError, OrmResult};

use crate::fields::Relation;
use crate::model::ModelMeta;
use crate::orm::Orm;
use crate::query::crawler::PK;
use crate::query::executor;
use crate::query::lookups::Q;
use crate::query::queryset::QuerySet;
use crate::query::spec::EmbedParent;
use crate::row::FromValue;
use crate::value::{PkKey, Value};

/// A relation attached to an instance.
#[derive(Clone)]
pub enum Related {
    /// A to-one relation; `None` when the related row is absent.
    One(Option<Instance>),
    /// A to-many relation.
    Many(Vec<Instance>),
    /// A back-reference to an owner that holds this instance.
    Back(WeakInstance),
}

impl fmt::Debug for Related {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(Some(inst)) => write!(f, "One({inst:?})"),
            Self::One(None) => write!(f, "One(None)"),
            Self::Many(items) => write!(f, "Many({})", items.len()),
            Self::Back(_) => write!(f, "Back"),
        }
    }
}

#[derive(Default)]
struct InstanceState {
    values: HashMap<String, Value>,
    deferred: BTreeSet<String>,
    related: HashMap<String, Related>,
    extra: BTreeMap<String, Value>,
    persisted: bool,
}

struct InstanceInner {
    model: Arc<ModelMeta>,
    state: RwLock<InstanceState>,
}

/// A shared handle to one model object.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);

/// A non-owning handle, used for back-references.
#[derive(Clone)]
pub struct WeakInstance(Weak<InstanceInner>);

impl WeakInstance {
    /// The instance, if it is still alive.
    pub fn upgrade(&self) -> Option<Instance> {
        self.0.upgrade().map(Instance)
    }
}

impl Instance {
    /// Creates an unsaved instance with every concrete field set to its
    /// default (or NULL).
    pub fn new(model: Arc<ModelMeta>) -> Self {
        let values = model
            .concrete_fields()
            .map(|f| (f.name.clone(), f.default.clone().unwrap_or(Value::Null)))
            .collect();
        Self::from_state(
            model,
            InstanceState {
                values,
                ..InstanceState::default()
            },
        )
    }

    /// Creates a persisted instance from loaded values.
    pub(crate) fn hydrate(
        model: Arc<ModelMeta>,
        values: HashMap<String, Value>,
        deferred: BTreeSet<String>,
    ) -> Self {
        Self::from_state(
            model,
            InstanceState {
                values,
                deferred,
                persisted: true,
                ..InstanceState::default()
            },
        )
    }

    fn from_state(model: Arc<ModelMeta>, state: InstanceState) -> Self {
        Self(Arc::new(InstanceInner {
            model,
            state: RwLock::new(state),
        }))
    }

    fn read(&self) -> RwLockReadGuard<'_, InstanceState> {
        self.0.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InstanceState> {
        self.0.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The model descriptor.
    pub fn model(&self) -> &Arc<ModelMeta> {
        &self.0.model
    }

    /// Reads a concrete field (`pk` reads the primary key).
    ///
    /// # Errors
    ///
    /// [`OrmError::FieldNotLoaded`] when the field was deferred, and
    /// [`OrmError::QuerySetError`] for unknown or non-column fields.
    pub fn get(&self, name: &str) -> OrmResult<Value> {
        if name == PK {
            return Ok(self.pk());
        }
        let field = self.0.model.field_or_err(name)?;
        if !field.is_concrete() {
            return Err(OrmError::QuerySetError(format!(
                "'{name}' is a relation of {}; use related() or related_queryset()",
                self.0.model.name
            )));
        }
        let state = self.read();
        if state.deferred.contains(name) {
            return Err(OrmError::FieldNotLoaded(format!(
                "{}.{name}",
                self.0.model.name
            )));
        }
        Ok(state.values.get(name).cloned().unwrap_or(Value::Null))
    }

    /// Reads a field converted to a Rust type.
    pub fn get_as<T: FromValue>(&self, name: &str) -> OrmResult<T> {
        T::from_value(&self.get(name)?)
    }

    /// Assigns a concrete field. Assigning a deferred field marks it loaded.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> OrmResult<()> {
        let model = &self.0.model;
        let name = if name == PK {
            match model.pk_names().as_slice() {
                [single] => (*single).to_string(),
                _ => {
                    return Err(OrmError::QuerySetError(format!(
                        "{} has a composite primary key; set its fields individually",
                        model.name
                    )))
                }
            }
        } else {
            name.to_string()
        };
        let field = model.field_or_err(&name)?;
        if !field.is_concrete() {
            return Err(OrmError::QuerySetError(format!(
                "'{name}' is not stored on {} and cannot be assigned",
                model.name
            )));
        }
        let mut state = self.write();
        state.deferred.remove(&name);
        if field.is_relation() {
            state.related.remove(&name);
        }
        state.values.insert(name, value.into());
        Ok(())
    }

    /// Points a forward relation at `other`, storing its key and caching it.
    pub fn set_instance(&self, name: &str, other: &Self) -> OrmResult<()> {
        let field = self.0.model.field_or_err(name)?;
        if !matches!(field.relation, Some(Relation::Forward { .. })) {
            return Err(OrmError::QuerySetError(format!(
                "'{name}' is not a forward relation of {}",
                self.0.model.name
            )));
        }
        self.set(name, other.pk())?;
        self.attach(name, Related::One(Some(other.clone())));
        Ok(())
    }

    /// The primary-key value parts in key-field order.
    pub fn pk_values(&self) -> Vec<Value> {
        let state = self.read();
        self.0
            .model
            .pk_fields()
            .iter()
            .flat_map(|f| {
                state
                    .values
                    .get(&f.name)
                    .map_or_else(|| vec![Value::Null], |v| v.as_parts().to_vec())
            })
            .collect()
    }

    /// The primary key: a scalar, or a list for composite keys.
    pub fn pk(&self) -> Value {
        let mut parts = self.pk_values();
        if parts.len() == 1 {
            parts.pop().unwrap_or(Value::Null)
        } else {
            Value::List(parts)
        }
    }

    /// The hashable primary-key tuple.
    pub fn pk_key(&self) -> PkKey {
        PkKey::from_values(&self.pk_values())
    }

    /// Whether the instance was loaded from or saved to the database.
    pub fn is_persisted(&self) -> bool {
        self.read().persisted
    }

    pub(crate) fn set_persisted(&self, persisted: bool) {
        self.write().persisted = persisted;
    }

    /// Whether some fields were not loaded.
    pub fn is_proxy(&self) -> bool {
        !self.read().deferred.is_empty()
    }

    /// Fields not yet loaded.
    pub fn deferred_fields(&self) -> Vec<String> {
        self.read().deferred.iter().cloned().collect()
    }

    /// Fills fields that are still unloaded. Loaded values are left alone.
    pub(crate) fn fill(&self, values: HashMap<String, Value>) {
        let mut state = self.write();
        for (name, value) in values {
            if state.deferred.remove(&name) || !state.values.contains_key(&name) {
                state.values.insert(name, value);
            }
        }
    }

    /// The attached relation under `name`.
    pub fn related(&self, name: &str) -> Option<Related> {
        self.read().related.get(name).cloned()
    }

    /// The attached to-one relation (or back-reference) under `name`.
    pub fn related_one(&self, name: &str) -> Option<Self> {
        match self.read().related.get(name)? {
            Related::One(inst) => inst.clone(),
            Related::Back(weak) => weak.upgrade(),
            Related::Many(_) => None,
        }
    }

    /// The attached to-many relation under `name`.
    pub fn related_many(&self, name: &str) -> Option<Vec<Self>> {
        match self.read().related.get(name)? {
            Related::Many(items) => Some(items.clone()),
            _ => None,
        }
    }

    pub(crate) fn attach(&self, name: &str, related: Related) {
        self.write().related.insert(name.to_string(), related);
    }

    /// Appends to a to-many relation, creating it if needed. Already
    /// attached handles are skipped.
    pub(crate) fn push_related(&self, name: &str, item: Option<Self>) {
        let mut state = self.write();
        let entry = state
            .related
            .entry(name.to_string())
            .or_insert_with(|| Related::Many(Vec::new()));
        if !matches!(entry, Related::Many(_)) {
            *entry = Related::Many(Vec::new());
        }
        if let (Related::Many(items), Some(item)) = (entry, item) {
            if !items.iter().any(|i| i.ptr_eq(&item)) {
                items.push(item);
            }
        }
    }

    pub(crate) fn set_extra(&self, label: &str, value: Value) {
        self.write().extra.insert(label.to_string(), value);
    }

    /// An extra selected column.
    pub fn extra(&self, label: &str) -> Option<Value> {
        self.read().extra.get(label).cloned()
    }

    /// Whether both handles point at the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// A non-owning handle.
    pub fn downgrade(&self) -> WeakInstance {
        WeakInstance(Arc::downgrade(&self.0))
    }

    /// Loaded field values by name.
    pub fn values(&self) -> BTreeMap<String, Value> {
        let state = self.read();
        state
            .values
            .iter()
            .filter(|(k, _)| !state.deferred.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Loads every deferred field with one point query.
    pub async fn load_deferred(&self, orm: &Orm) -> OrmResult<()> {
        let missing = self.deferred_fields();
        if missing.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = missing.iter().map(String::as_str).collect();
        let fresh = orm
            .query(&self.0.model.name)?
            .only(&names)?
            .get(Q::kw(PK, self.pk()))
            .await?;
        let values = fresh
            .values()
            .into_iter()
            .filter(|(k, _)| missing.contains(k))
            .collect();
        self.fill(values);
        Ok(())
    }

    /// Reads a field, loading deferred fields first if needed.
    pub async fn fetch(&self, orm: &Orm, name: &str) -> OrmResult<Value> {
        match self.get(name) {
            Err(OrmError::FieldNotLoaded(_)) => {
                self.load_deferred(orm).await?;
                self.get(name)
            }
            other => other,
        }
    }

    /// A queryset over the objects reachable through relation `name`.
    ///
    /// Many-to-many sets query the association model, join the target and
    /// unwrap each row to the target, which keeps the association row
    /// reachable under `through`.
    pub fn related_queryset(&self, orm: &Orm, name: &str) -> OrmResult<QuerySet> {
        let model = &self.0.model;
        let field = model.field_or_err(name)?;
        let relation = field.relation.as_ref().ok_or_else(|| {
            OrmError::QuerySetError(format!("'{name}' is not a relation of {}", model.name))
        })?;
        Ok(match relation {
            Relation::Forward { target, .. } => {
                let key = self.get(name)?;
                orm.query(target)?.filter(Q::kw(PK, key))
            }
            Relation::Reverse {
                target,
                reverse_name,
                ..
            } => orm.query(target)?.filter(Q::kw(reverse_name.clone(), self.pk())),
            Relation::ManyToMany {
                through,
                through_from,
                through_to,
                ..
            } => orm
                .query(through)?
                .filter(Q::kw(through_from.clone(), self.pk()))
                .select_related(&[through_to.as_str()])
                .embed_parent(EmbedParent {
                    path: through_to.clone(),
                    reattach: Some("through".to_string()),
                }),
        })
    }

    /// Inserts or updates the row, running save hooks in one transaction.
    pub async fn save(&self, orm: &Orm) -> OrmResult<()> {
        executor::save_instance(orm, self).await
    }

    /// Deletes the row, running delete hooks in one transaction.
    pub async fn delete(&self, orm: &Orm) -> OrmResult<u64> {
        executor::delete_instance(orm, self).await
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.state.try_read() {
            Ok(state) => {
                let pk = self
                    .0
                    .model
                    .pk_names()
                    .iter()
                    .map(|n| state.values.get(*n).map_or_else(|| "?".to_string(), ToString::to_string))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "<{}: {pk}>", self.0.model.name)
            }
            Err(_) => write!(f, "<{}: (locked)>", self.0.model.name),
        }
    }
}
