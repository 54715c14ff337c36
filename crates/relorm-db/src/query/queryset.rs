//! The QuerySet builder facade.
//!
//! A [`QuerySet`] is a lazy description of a query over one model. Chain
//! methods consume the value, apply one change to its [`QuerySpec`] and
//! return it; clone first to keep the previous query around. Nothing touches
//! the database until a terminal operation (`.await`, `get`, `count`,
//! `delete`, ...) runs.
//!
//! ```ignore
//! let posts = orm
//!     .query("Post")?
//!     .filter(Q::kw("author__name", "ada"))
//!     .select_related(&["author"])
//!     .order_by(&["-id"])
//!     .limit(10)
//!     .await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use relorm_core::logging::query_span;
use relorm_core::{OrmError, OrmResult};
use tracing::Instrument;

use super::bulk::{self, BulkCreateOptions, BulkUpdateOptions};
use super::crawler::LOOKUP_SEP;
use super::executor::{shared_cache, Executor, SharedCache};
use super::lookups::Q;
use super::spec::{
    Combined, Distinct, EmbedParent, ExtraColumn, ExtraExpr, Prefetch, QuerySpec, RowLock, SetOp,
};
use crate::connection::Connection;
use crate::instance::Instance;
use crate::model::{DeletePolicy, ModelMeta};
use crate::orm::Orm;
use crate::transactions::atomic;
use crate::value::Value;

/// Results remembered by one facade value.
#[derive(Default)]
struct Memo {
    first: Option<Option<Instance>>,
    last: Option<Option<Instance>>,
    count: Option<u64>,
}

fn flip(term: &str) -> String {
    term.strip_prefix('-')
        .map_or_else(|| format!("-{term}"), str::to_string)
}

fn pk_order(model: &ModelMeta) -> Vec<String> {
    model.pk_names().iter().map(|s| (*s).to_string()).collect()
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

fn lookup_q(lookup: &[(&str, Value)]) -> Q {
    Q::And(lookup.iter().map(|(k, v)| Q::kw(*k, v.clone())).collect())
}

/// Values for a new instance: the plain-field part of `lookup`, then
/// `defaults` on top.
fn create_values<'a>(lookup: &[(&'a str, Value)], defaults: &[(&'a str, Value)]) -> Vec<(&'a str, Value)> {
    lookup
        .iter()
        .filter(|(k, _)| !k.contains(LOOKUP_SEP))
        .chain(defaults)
        .cloned()
        .collect()
}

/// A lazy, chainable query over one model.
pub struct QuerySet {
    orm: Orm,
    model: Arc<ModelMeta>,
    spec: QuerySpec,
    cache: SharedCache,
    memo: Arc<Mutex<Memo>>,
}

impl Clone for QuerySet {
    /// The clone starts with an empty result cache and no remembered results.
    fn clone(&self) -> Self {
        Self::from_parts(self.orm.clone(), Arc::clone(&self.model), self.spec.clone())
    }
}

impl fmt::Debug for QuerySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &self.model.name)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl QuerySet {
    /// Every row of `model`, in the model's default ordering.
    pub fn new(orm: Orm, model: Arc<ModelMeta>) -> Self {
        let spec = QuerySpec {
            order_by: model.ordering.clone(),
            ..QuerySpec::default()
        };
        Self::from_parts(orm, model, spec)
    }

    fn from_parts(orm: Orm, model: Arc<ModelMeta>, spec: QuerySpec) -> Self {
        Self {
            orm,
            model,
            spec,
            cache: shared_cache(),
            memo: Arc::new(Mutex::new(Memo::default())),
        }
    }

    /// The queried model.
    pub fn model(&self) -> &Arc<ModelMeta> {
        &self.model
    }

    /// The accumulated query description.
    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// Gives up the query description, e.g. for a custom prefetch query.
    pub fn into_spec(self) -> QuerySpec {
        self.spec
    }

    fn memo(&self) -> MutexGuard<'_, Memo> {
        self.memo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops cached instances and remembered results after the query
    /// changed or wrote rows.
    fn invalidate(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
        *self.memo() = Memo::default();
    }

    fn changed(mut self) -> Self {
        self.cache = shared_cache();
        self.memo = Arc::new(Mutex::new(Memo::default()));
        self
    }

    fn connection(&self) -> OrmResult<Arc<dyn Connection>> {
        let alias = self
            .spec
            .using_database
            .as_deref()
            .unwrap_or(&self.model.database);
        self.orm.connection(alias)
    }

    fn executor(&self, spec: QuerySpec) -> Executor {
        Executor::new(
            self.orm.clone(),
            Arc::clone(&self.model),
            spec,
            Arc::clone(&self.cache),
        )
    }

    fn span(&self, operation: &'static str) -> tracing::Span {
        query_span(&self.model.name, operation)
    }

    // ── Filtering ─────────────────────────────────────────────────────

    /// The same query with a fresh cache.
    pub fn all(self) -> Self {
        self.changed()
    }

    /// A query matching nothing. Terminal operations on it send no
    /// statements.
    pub fn none(mut self) -> Self {
        self.spec.empty = true;
        self.changed()
    }

    /// Keeps rows matching `q`.
    pub fn filter(mut self, q: Q) -> Self {
        if !q.is_empty() {
            self.spec.filters.push(q);
        }
        self.changed()
    }

    /// Drops rows matching `q`.
    pub fn exclude(mut self, q: Q) -> Self {
        if !q.is_empty() {
            self.spec.filters.push(!q);
        }
        self.changed()
    }

    /// Same as [`filter`](Self::filter); reads better after
    /// [`or`](Self::or).
    pub fn and(self, q: Q) -> Self {
        self.filter(q)
    }

    /// Adds an alternative: rows matching any `or` clause pass, and the
    /// alternatives as a whole are AND-ed with the other filters.
    pub fn or(mut self, q: Q) -> Self {
        if !q.is_empty() {
            self.spec.or_clauses.push(q);
        }
        self.changed()
    }

    /// Adds a self-contained disjunction of `alternatives`, AND-ed with
    /// everything else and independent of [`or`](Self::or) clauses.
    pub fn local_or(mut self, alternatives: Vec<Q>) -> Self {
        let alternatives: Vec<Q> = alternatives.into_iter().filter(|q| !q.is_empty()).collect();
        if !alternatives.is_empty() {
            self.spec.filters.push(Q::Or(alternatives));
        }
        self.changed()
    }

    // ── Shaping ───────────────────────────────────────────────────────

    /// Replaces the ordering. Prefix a path with `-` for descending order.
    pub fn order_by(mut self, paths: &[&str]) -> Self {
        self.spec.order_by = names(paths);
        self.changed()
    }

    /// Flips the ordering (primary key ascending when none was set) and
    /// swaps remembered `first`/`last` results.
    pub fn reverse(mut self) -> Self {
        if self.spec.order_by.is_empty() {
            self.spec.order_by = pk_order(&self.model);
        }
        self.spec.order_by = self.spec.order_by.iter().map(|t| flip(t)).collect();
        let swapped = {
            let memo = self.memo();
            Memo {
                first: memo.last.clone(),
                last: memo.first.clone(),
                count: memo.count,
            }
        };
        self.memo = Arc::new(Mutex::new(swapped));
        self
    }

    /// Groups rows by `paths`.
    pub fn group_by(mut self, paths: &[&str]) -> Self {
        self.spec.group_by = names(paths);
        self.changed()
    }

    /// `SELECT DISTINCT`.
    pub fn distinct(mut self) -> Self {
        self.spec.distinct = Distinct::All;
        self.changed()
    }

    /// `SELECT DISTINCT ON (paths)`; PostgreSQL only.
    pub fn distinct_on(mut self, paths: &[&str]) -> Self {
        self.spec.distinct = Distinct::On(names(paths));
        self.changed()
    }

    /// At most `n` rows.
    pub fn limit(mut self, n: u64) -> Self {
        self.spec.limit = Some(n);
        self.changed()
    }

    /// Skips `n` rows.
    pub fn offset(mut self, n: u64) -> Self {
        self.spec.offset = Some(n);
        self.changed()
    }

    /// Rows fetched (and prefetched for) per batch.
    pub fn batch_size(mut self, n: usize) -> Self {
        self.spec.batch_size = Some(n.max(1));
        self.changed()
    }

    /// Joins `paths` and populates them from the same rows.
    pub fn select_related(mut self, paths: &[&str]) -> Self {
        for path in paths {
            if !self.spec.select_related.iter().any(|p| p == path) {
                self.spec.select_related.push((*path).to_string());
            }
        }
        self.changed()
    }

    /// Populates a relation with one extra query per fetched batch.
    ///
    /// # Errors
    ///
    /// `QuerySetError` when the path is not a chain of relations, or the
    /// attribute name collides with a field or another prefetch.
    pub fn prefetch_related(mut self, prefetch: Prefetch) -> OrmResult<Self> {
        let mut owner = Arc::clone(&self.model);
        let mut segments = prefetch.related_name.split(LOOKUP_SEP).peekable();
        let mut prefix = Vec::new();
        while let Some(seg) = segments.next() {
            let field = owner.field(seg).ok_or_else(|| {
                OrmError::QuerySetError(format!(
                    "Cannot prefetch '{}': {} has no field '{seg}'",
                    prefetch.related_name, owner.name
                ))
            })?;
            let relation = field.relation.as_ref().ok_or_else(|| {
                OrmError::QuerySetError(format!(
                    "Cannot prefetch '{}': '{seg}' is not a relation of {}",
                    prefetch.related_name, owner.name
                ))
            })?;
            if segments.peek().is_some() {
                prefix.push(seg);
                owner = self.orm.model(relation.target())?;
            }
        }
        let last = prefetch
            .related_name
            .rsplit(LOOKUP_SEP)
            .next()
            .unwrap_or(&prefetch.related_name);
        let attr = prefetch.attr();
        if attr != last && owner.field(attr).is_some() {
            return Err(OrmError::QuerySetError(format!(
                "to_attr '{attr}' conflicts with a field on the {} model",
                owner.name
            )));
        }
        let prefix = prefix.join(LOOKUP_SEP);
        let taken = self.spec.prefetch.iter().any(|p| {
            let (p_prefix, _) = p.related_name.rsplit_once(LOOKUP_SEP).unwrap_or(("", ""));
            p_prefix == prefix && p.attr() == attr
        });
        if taken {
            return Err(OrmError::QuerySetError(format!(
                "'{attr}' lookup was already seen with a different queryset"
            )));
        }
        self.spec.prefetch.push(prefetch);
        Ok(self.changed())
    }

    /// Loads only `fields` (plus primary keys); other fields are deferred.
    ///
    /// # Errors
    ///
    /// `QuerySetError` when combined with [`defer`](Self::defer).
    pub fn only(mut self, fields: &[&str]) -> OrmResult<Self> {
        if !self.spec.defer.is_empty() {
            return Err(OrmError::QuerySetError(
                "Cannot combine only() with defer()".to_string(),
            ));
        }
        self.spec.only.extend(names(fields));
        Ok(self.changed())
    }

    /// Leaves `fields` unloaded until first access.
    ///
    /// # Errors
    ///
    /// `QuerySetError` when combined with [`only`](Self::only).
    pub fn defer(mut self, fields: &[&str]) -> OrmResult<Self> {
        if !self.spec.only.is_empty() {
            return Err(OrmError::QuerySetError(
                "Cannot combine defer() with only()".to_string(),
            ));
        }
        self.spec.defer.extend(names(fields));
        Ok(self.changed())
    }

    /// Leaves fields marked secret out of the projection.
    pub fn exclude_secrets(mut self) -> Self {
        self.spec.exclude_secrets = true;
        self.changed()
    }

    /// Qualifies every table with `schema`.
    pub fn using_schema(mut self, schema: impl Into<String>) -> Self {
        self.spec.using_schema = Some(schema.into());
        self.changed()
    }

    /// Runs against the database registered under `alias`.
    pub fn using(mut self, alias: impl Into<String>) -> Self {
        self.spec.using_database = Some(alias.into());
        self.changed()
    }

    /// Selects an extra column, readable with [`Instance::extra`].
    pub fn extra_select(mut self, label: impl Into<String>, expr: ExtraExpr) -> Self {
        self.spec.extra.push(ExtraColumn {
            label: label.into(),
            expr,
        });
        self.changed()
    }

    /// Returns the object at `embed.path` of each row instead of the row's
    /// own instance.
    pub fn embed_parent(mut self, embed: EmbedParent) -> Self {
        if !self.spec.select_related.contains(&embed.path) {
            self.spec.select_related.push(embed.path.clone());
        }
        self.spec.embed_parent = Some(embed);
        self.changed()
    }

    /// Locks the selected rows.
    ///
    /// # Errors
    ///
    /// `QuerySetError` on a combined query.
    pub fn select_for_update(mut self, lock: RowLock) -> OrmResult<Self> {
        if self.spec.combined.is_some() {
            return Err(OrmError::QuerySetError(
                "Row locking is not allowed on a combined query".to_string(),
            ));
        }
        self.spec.lock = Some(lock);
        Ok(self.changed())
    }

    // ── Set operations ────────────────────────────────────────────────

    fn combine(self, other: Self, op: SetOp, all: bool) -> OrmResult<Self> {
        if self.model.name != other.model.name {
            return Err(OrmError::QuerySetError(format!(
                "Cannot combine a {} query with a {} query",
                self.model.name, other.model.name
            )));
        }
        if self.spec.lock.is_some() || other.spec.lock.is_some() {
            return Err(OrmError::QuerySetError(
                "Row locking is not allowed on a combined query".to_string(),
            ));
        }
        let compiler = self.orm.compiler(self.connection()?.backend_type());
        let left_labels = compiler.operand_labels(&self.spec, &self.model)?;
        let right_labels = compiler.operand_labels(&other.spec, &other.model)?;
        if left_labels != right_labels {
            return Err(OrmError::QuerySetError(format!(
                "{} operands must select the same columns ({} vs {})",
                op.as_sql(),
                left_labels.len(),
                right_labels.len()
            )));
        }
        match (op, self.spec.empty, other.spec.empty) {
            (SetOp::Union, true, _) => return Ok(other.changed()),
            (SetOp::Union | SetOp::Except, _, true) => return Ok(self.changed()),
            (SetOp::Intersect, true, _) | (SetOp::Intersect, _, true) | (SetOp::Except, true, _) => {
                return Ok(self.none())
            }
            _ => {}
        }

        let Self { orm, model, spec: mut left, .. } = self;
        let mut right = other.spec;
        right.prefetch.clear();
        right.select_related.clear();
        let outer = QuerySpec {
            prefetch: std::mem::take(&mut left.prefetch),
            select_related: std::mem::take(&mut left.select_related),
            only: left.only.clone(),
            defer: left.defer.clone(),
            exclude_secrets: left.exclude_secrets,
            using_schema: left.using_schema.clone(),
            using_database: left.using_database.clone(),
            batch_size: left.batch_size,
            extra: left
                .extra
                .iter()
                .map(|e| ExtraColumn {
                    label: e.label.clone(),
                    expr: ExtraExpr::Inherited,
                })
                .collect(),
            combined: Some(Box::new(Combined {
                op,
                all,
                left,
                right,
            })),
            ..QuerySpec::default()
        };
        Ok(Self::from_parts(orm, model, outer))
    }

    /// Rows in either query, without duplicates.
    ///
    /// # Errors
    ///
    /// `QuerySetError` when the two queries select different columns.
    pub fn union(self, other: Self) -> OrmResult<Self> {
        self.combine(other, SetOp::Union, false)
    }

    /// Rows in either query, keeping duplicates.
    pub fn union_all(self, other: Self) -> OrmResult<Self> {
        self.combine(other, SetOp::Union, true)
    }

    /// Rows in both queries.
    pub fn intersect(self, other: Self) -> OrmResult<Self> {
        self.combine(other, SetOp::Intersect, false)
    }

    /// Rows in both queries, keeping duplicates.
    pub fn intersect_all(self, other: Self) -> OrmResult<Self> {
        self.combine(other, SetOp::Intersect, true)
    }

    /// Rows in this query but not in `other`.
    pub fn except_(self, other: Self) -> OrmResult<Self> {
        self.combine(other, SetOp::Except, false)
    }

    /// Rows in this query but not in `other`, keeping duplicates.
    pub fn except_all(self, other: Self) -> OrmResult<Self> {
        self.combine(other, SetOp::Except, true)
    }

    // ── Inspection ────────────────────────────────────────────────────

    /// The SELECT this query sends, with its parameters.
    pub fn to_sql(&self) -> OrmResult<(String, Vec<Value>)> {
        let compiled = self
            .orm
            .compiler(self.connection()?.backend_type())
            .build_select(&self.spec, &self.model)?;
        Ok((compiled.sql, compiled.params))
    }

    // ── Reading ───────────────────────────────────────────────────────

    /// Streams results in batches of [`batch_size`](Self::batch_size).
    ///
    /// With `fetch_all_at_once` every row is loaded before the first batch
    /// is yielded.
    pub fn batches(&self, fetch_all_at_once: bool) -> BoxStream<'static, OrmResult<Vec<Instance>>> {
        self.executor(self.spec.clone())
            .fetch_all_at_once(fetch_all_at_once)
            .batches()
    }

    /// Streams results one instance at a time.
    pub fn iterate(&self) -> BoxStream<'static, OrmResult<Instance>> {
        self.batches(false)
            .map_ok(|batch| futures_util::stream::iter(batch.into_iter().map(Ok::<Instance, OrmError>)))
            .try_flatten()
            .boxed()
    }

    /// Every result, fetched batch by batch.
    pub async fn fetch(&self) -> OrmResult<Vec<Instance>> {
        self.executor(self.spec.clone())
            .fetch()
            .instrument(self.span("fetch"))
            .await
    }

    /// Every result, loaded with one whole-result fetch.
    pub async fn fetch_all(&self) -> OrmResult<Vec<Instance>> {
        self.executor(self.spec.clone())
            .fetch_all_at_once(true)
            .fetch()
            .instrument(self.span("fetch_all"))
            .await
    }

    /// The single row matching `q` (pass an empty `Q::And` for no extra
    /// filter). Instances already loaded by this query are reused.
    ///
    /// # Errors
    ///
    /// `ObjectNotFound` or `MultipleObjectsReturned` unless exactly one row
    /// matches.
    pub async fn get(&self, q: Q) -> OrmResult<Instance> {
        let mut spec = self.spec.clone();
        if !q.is_empty() {
            spec.filters.push(q);
        }
        self.executor(spec).get_one().instrument(self.span("get")).await
    }

    /// Like [`get`](Self::get) but `None` when nothing matches.
    pub async fn get_or_none(&self, q: Q) -> OrmResult<Option<Instance>> {
        match self.get(q).await {
            Ok(found) => Ok(Some(found)),
            Err(OrmError::ObjectNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The first row in the query's ordering, primary key ascending when
    /// unordered. Remembered until the query changes.
    pub async fn first(&self) -> OrmResult<Option<Instance>> {
        if let Some(hit) = self.memo().first.clone() {
            return Ok(hit);
        }
        let mut spec = self.spec.clone();
        if !spec.is_ordered() {
            spec.order_by = pk_order(&self.model);
        }
        spec.limit = Some(spec.limit.map_or(1, |n| n.min(1)));
        let found = self
            .executor(spec)
            .fetch_all_at_once(true)
            .fetch()
            .instrument(self.span("first"))
            .await?
            .into_iter()
            .next();
        self.memo().first = Some(found.clone());
        Ok(found)
    }

    /// The last row in the query's ordering, primary key descending when
    /// unordered. Remembered until the query changes.
    ///
    /// # Errors
    ///
    /// `QuerySetError` on a sliced query.
    pub async fn last(&self) -> OrmResult<Option<Instance>> {
        if let Some(hit) = self.memo().last.clone() {
            return Ok(hit);
        }
        if self.spec.is_sliced() {
            return Err(OrmError::QuerySetError(
                "Cannot reverse a query once a slice has been taken".to_string(),
            ));
        }
        let mut spec = self.spec.clone();
        if !spec.is_ordered() {
            spec.order_by = pk_order(&self.model);
        }
        spec.order_by = spec.order_by.iter().map(|t| flip(t)).collect();
        spec.limit = Some(1);
        let found = self
            .executor(spec)
            .fetch_all_at_once(true)
            .fetch()
            .instrument(self.span("last"))
            .await?
            .into_iter()
            .next();
        self.memo().last = Some(found.clone());
        Ok(found)
    }

    /// Whether any row matches.
    pub async fn exists(&self) -> OrmResult<bool> {
        self.executor(self.spec.clone())
            .exists()
            .instrument(self.span("exists"))
            .await
    }

    /// Number of matching rows. Remembered until the query changes.
    pub async fn count(&self) -> OrmResult<u64> {
        if let Some(n) = self.memo().count {
            return Ok(n);
        }
        let n = self
            .executor(self.spec.clone())
            .count()
            .instrument(self.span("count"))
            .await?;
        self.memo().count = Some(n);
        Ok(n)
    }

    fn value_paths(&self, fields: &[&str]) -> Vec<String> {
        if fields.is_empty() {
            self.model.concrete_fields().map(|f| f.name.clone()).collect()
        } else {
            names(fields)
        }
    }

    /// Raw values of `fields` (every concrete field when empty) per row,
    /// keyed by path.
    pub async fn values(&self, fields: &[&str]) -> OrmResult<Vec<BTreeMap<String, Value>>> {
        let paths = self.value_paths(fields);
        self.executor(self.spec.clone())
            .values(&paths)
            .instrument(self.span("values"))
            .await
    }

    /// Raw values of `fields` (every concrete field when empty) per row, in
    /// the order asked for.
    pub async fn values_list(&self, fields: &[&str]) -> OrmResult<Vec<Vec<Value>>> {
        let paths = self.value_paths(fields);
        let rows = self
            .executor(self.spec.clone())
            .values(&paths)
            .instrument(self.span("values_list"))
            .await?;
        Ok(rows
            .into_iter()
            .map(|mut row| {
                paths
                    .iter()
                    .map(|p| row.remove(p).unwrap_or(Value::Null))
                    .collect()
            })
            .collect())
    }

    // ── Writing ───────────────────────────────────────────────────────

    /// Creates and saves an instance, running its save hooks.
    pub async fn create(&self, values: &[(&str, Value)]) -> OrmResult<Instance> {
        let instance = Instance::new(Arc::clone(&self.model));
        for (name, value) in values {
            instance.set(name, value.clone())?;
        }
        instance
            .save(&self.orm)
            .instrument(self.span("create"))
            .await?;
        Ok(instance)
    }

    /// Writes `values` to every matching row; returns the number of rows
    /// updated.
    pub async fn update(&self, values: &[(&str, Value)]) -> OrmResult<u64> {
        let assignments: Vec<(String, Value)> = values
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        let n = self
            .executor(self.spec.clone())
            .update(&assignments)
            .instrument(self.span("update"))
            .await?;
        self.invalidate();
        Ok(n)
    }

    /// Deletes every matching row using the model's delete policy.
    pub async fn delete(&self) -> OrmResult<u64> {
        self.delete_inner(None).await
    }

    /// Deletes every matching row with an explicit policy.
    pub async fn delete_with(&self, policy: DeletePolicy) -> OrmResult<u64> {
        self.delete_inner(Some(policy)).await
    }

    async fn delete_inner(&self, policy: Option<DeletePolicy>) -> OrmResult<u64> {
        let n = self
            .executor(self.spec.clone())
            .delete(policy)
            .instrument(self.span("delete"))
            .await?;
        self.invalidate();
        Ok(n)
    }

    /// Inserts `instances` with multi-row INSERTs in one transaction.
    /// Save hooks do not run.
    pub async fn bulk_create(&self, instances: &[Instance]) -> OrmResult<u64> {
        let options = BulkCreateOptions {
            batch_size: self.spec.batch_size,
        };
        bulk::bulk_create(&self.orm, &self.model, &self.spec, instances, &options)
            .instrument(self.span("bulk_create"))
            .await
    }

    /// Writes `fields` (every loaded field when empty) of each instance in
    /// one transaction. Save hooks do not run.
    pub async fn bulk_update(&self, instances: &[Instance], fields: &[&str]) -> OrmResult<u64> {
        let options = BulkUpdateOptions {
            fields: names(fields),
        };
        let n = bulk::bulk_update(&self.orm, &self.model, &self.spec, instances, &options)
            .instrument(self.span("bulk_update"))
            .await?;
        self.invalidate();
        Ok(n)
    }

    /// The row matching `lookup`, created from `lookup` and `defaults` when
    /// missing. The flag is `true` when a row was created.
    pub async fn get_or_create(
        &self,
        lookup: &[(&str, Value)],
        defaults: &[(&str, Value)],
    ) -> OrmResult<(Instance, bool)> {
        let q = lookup_q(lookup);
        match self.get(q.clone()).await {
            Ok(found) => return Ok((found, false)),
            Err(OrmError::ObjectNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let conn = self.connection()?;
        let values = create_values(lookup, defaults);
        let created = atomic(conn.as_ref(), |_| async move { self.create(&values).await }).await;
        match created {
            Ok(instance) => Ok((instance, true)),
            // Lost a race with a concurrent insert.
            Err(OrmError::IntegrityError(msg)) => match self.get(q).await {
                Ok(found) => Ok((found, false)),
                Err(_) => Err(OrmError::IntegrityError(msg)),
            },
            Err(e) => Err(e),
        }
    }

    /// Updates the row matching `lookup` with `defaults`, or creates it.
    /// The flag is `true` when a row was created.
    pub async fn update_or_create(
        &self,
        lookup: &[(&str, Value)],
        defaults: &[(&str, Value)],
    ) -> OrmResult<(Instance, bool)> {
        let conn = self.connection()?;
        let q = lookup_q(lookup);
        atomic(conn.as_ref(), |_| async move {
            let locked = self.clone().select_for_update(RowLock::default())?;
            match locked.get(q).await {
                Ok(found) => {
                    for (name, value) in defaults {
                        found.set(name, value.clone())?;
                    }
                    found.save(&self.orm).await?;
                    Ok((found, false))
                }
                Err(OrmError::ObjectNotFound(_)) => {
                    let created = self.create(&create_values(lookup, defaults)).await?;
                    Ok((created, true))
                }
                Err(e) => Err(e),
            }
        })
        .await
    }
}

impl IntoFuture for QuerySet {
    type Output = OrmResult<Vec<Instance>>;
    type IntoFuture = BoxFuture<'static, OrmResult<Vec<Instance>>>;

    fn into_future(self) -> Self::IntoFuture {
        let span = self.span("fetch");
        self.executor(self.spec.clone())
            .fetch()
            .instrument(span)
            .boxed()
    }
}

/// The entry point for queries over one model.
#[derive(Clone, Debug)]
pub struct Manager {
    base: QuerySet,
}

impl Manager {
    /// A manager whose querysets start from `base`.
    pub fn new(base: QuerySet) -> Self {
        Self { base }
    }

    /// The managed model.
    pub fn model(&self) -> &Arc<ModelMeta> {
        self.base.model()
    }

    /// Every row.
    pub fn all(&self) -> QuerySet {
        self.base.clone()
    }

    /// No rows.
    pub fn none(&self) -> QuerySet {
        self.all().none()
    }

    /// Rows matching `q`.
    pub fn filter(&self, q: Q) -> QuerySet {
        self.all().filter(q)
    }

    /// Rows not matching `q`.
    pub fn exclude(&self, q: Q) -> QuerySet {
        self.all().exclude(q)
    }

    /// The single row matching `q`.
    pub async fn get(&self, q: Q) -> OrmResult<Instance> {
        self.base.get(q).await
    }

    /// Number of rows.
    pub async fn count(&self) -> OrmResult<u64> {
        self.all().count().await
    }

    /// Creates and saves an instance.
    pub async fn create(&self, values: &[(&str, Value)]) -> OrmResult<Instance> {
        self.base.create(values).await
    }

    /// Inserts many instances.
    pub async fn bulk_create(&self, instances: &[Instance]) -> OrmResult<u64> {
        self.base.bulk_create(instances).await
    }

    /// See [`QuerySet::get_or_create`].
    pub async fn get_or_create(
        &self,
        lookup: &[(&str, Value)],
        defaults: &[(&str, Value)],
    ) -> OrmResult<(Instance, bool)> {
        self.all().get_or_create(lookup, defaults).await
    }

    /// See [`QuerySet::update_or_create`].
    pub async fn update_or_create(
        &self,
        lookup: &[(&str, Value)],
        defaults: &[(&str, Value)],
    ) -> OrmResult<(Instance, bool)> {
        self.all().update_or_create(lookup, defaults).await
    }
}

impl Prefetch {
    /// Uses `queryset` to load the related objects.
    pub fn with_queryset(mut self, queryset: QuerySet) -> Self {
        self.queryset = Some(queryset.into_spec());
        self
    }

    /// Stores the results under `attr` instead of the relation name.
    pub fn to_attr(mut self, attr: impl Into<String>) -> Self {
        self.to_attr = Some(attr.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldDef, FieldType};
    use crate::model::ModelBuilder;
    use crate::registry::ModelRegistry;
    use crate::testing::RecordingConnection;

    fn setup(conn: Arc<RecordingConnection>) -> Orm {
        let mut reg = ModelRegistry::new();
        reg.register(
            ModelBuilder::new("Author")
                .field(FieldDef::new("name", FieldType::CharField))
                .field(FieldDef::new("password", FieldType::CharField).secret())
                .build()
                .unwrap(),
        )
        .unwrap();
        reg.register(
            ModelBuilder::new("Post")
                .field(FieldDef::new("title", FieldType::CharField))
                .field(FieldDef::foreign_key("author", "Author").related_name("posts"))
                .build()
                .unwrap(),
        )
        .unwrap();
        Orm::new(reg.freeze().unwrap(), conn).unwrap()
    }

    fn post_row(id: i64, title: &str) -> Vec<Value> {
        vec![Value::Int(id), Value::from(title), Value::Int(1)]
    }

    // ── Chaining ──────────────────────────────────────────────────────

    #[test]
    fn test_clone_then_chain_leaves_original() {
        let orm = setup(Arc::new(RecordingConnection::sqlite()));
        let base = orm.query("Post").unwrap();
        let narrowed = base.clone().filter(Q::kw("title", "a")).limit(3);
        assert!(base.spec().filters.is_empty());
        assert_eq!(base.spec().limit, None);
        assert_eq!(narrowed.spec().filters.len(), 1);
        assert_eq!(narrowed.spec().limit, Some(3));
    }

    #[test]
    fn test_to_sql() {
        let orm = setup(Arc::new(RecordingConnection::sqlite()));
        let (sql, params) = orm
            .query("Post")
            .unwrap()
            .filter(Q::kw("title", "x"))
            .to_sql()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT \"post\".\"id\" AS \"id\", \"post\".\"title\" AS \"title\", \
             \"post\".\"author_id\" AS \"author_id\" FROM \"post\" WHERE \"post\".\"title\" = ?"
        );
        assert_eq!(params, vec![Value::from("x")]);
    }

    #[test]
    fn test_only_and_defer_conflict() {
        let orm = setup(Arc::new(RecordingConnection::sqlite()));
        let err = orm
            .query("Post")
            .unwrap()
            .only(&["title"])
            .unwrap()
            .defer(&["author"])
            .unwrap_err();
        assert!(matches!(err, OrmError::QuerySetError(_)));
    }

    #[test]
    fn test_prefetch_attr_collision_is_rejected_before_io() {
        let conn = Arc::new(RecordingConnection::sqlite());
        let orm = setup(Arc::clone(&conn));
        let err = orm
            .query("Post")
            .unwrap()
            .prefetch_related(Prefetch::new("author").to_attr("title"))
            .unwrap_err();
        assert!(err.to_string().contains("conflicts with a field"));

        let err = orm
            .query("Author")
            .unwrap()
            .prefetch_related(Prefetch::new("name"))
            .unwrap_err();
        assert!(err.to_string().contains("is not a relation"));

        let twice = orm
            .query("Author")
            .unwrap()
            .prefetch_related(Prefetch::new("posts"))
            .unwrap()
            .prefetch_related(Prefetch::new("posts"));
        assert!(twice.is_err());
        assert!(conn.statements().is_empty());
    }

    #[test]
    fn test_union_shape_mismatch() {
        let conn = Arc::new(RecordingConnection::sqlite());
        let orm = setup(Arc::clone(&conn));
        let left = orm.query("Post").unwrap();
        let right = orm.query("Post").unwrap().only(&["title"]).unwrap();
        let err = left.union(right).unwrap_err();
        assert!(matches!(err, OrmError::QuerySetError(_)));
        assert!(conn.statements().is_empty());
    }

    #[test]
    fn test_lock_on_union_is_rejected() {
        let orm = setup(Arc::new(RecordingConnection::postgres()));
        let a = orm.query("Post").unwrap().filter(Q::kw("title", "a"));
        let b = orm.query("Post").unwrap().filter(Q::kw("title", "b"));
        let combined = a.union(b).unwrap();
        assert!(combined.clone().select_for_update(RowLock::default()).is_err());
        let (sql, _) = combined.order_by(&["-id"]).limit(5).to_sql().unwrap();
        assert!(sql.contains(" UNION SELECT * FROM ("));
        assert!(sql.ends_with("ORDER BY \"post\".\"id\" DESC LIMIT 5"));
    }

    #[test]
    fn test_union_with_none_is_the_other_side() {
        let orm = setup(Arc::new(RecordingConnection::sqlite()));
        let a = orm.query("Post").unwrap().filter(Q::kw("title", "a"));
        let empty = orm.query("Post").unwrap().none();
        let combined = empty.union(a).unwrap();
        assert!(combined.spec().combined.is_none());
        assert_eq!(combined.spec().filters.len(), 1);
    }

    #[test]
    fn test_reverse_without_ordering_uses_pk() {
        let orm = setup(Arc::new(RecordingConnection::sqlite()));
        let qs = orm.query("Post").unwrap().reverse();
        assert_eq!(qs.spec().order_by, vec!["-id".to_string()]);
        let qs = qs.order_by(&["title", "-id"]).reverse();
        assert_eq!(qs.spec().order_by, vec!["-title".to_string(), "id".to_string()]);
    }

    // ── Terminals ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_none_does_no_io() {
        let conn = Arc::new(RecordingConnection::sqlite());
        let orm = setup(Arc::clone(&conn));
        let qs = orm.query("Post").unwrap().none();
        assert!(qs.clone().await.unwrap().is_empty());
        assert_eq!(qs.count().await.unwrap(), 0);
        assert!(!qs.exists().await.unwrap());
        assert_eq!(qs.first().await.unwrap().map(|i| i.pk()), None);
        assert_eq!(qs.update(&[("title", "x".into())]).await.unwrap(), 0);
        assert!(conn.statements().is_empty());
    }

    #[tokio::test]
    async fn test_first_orders_by_pk_and_is_remembered() {
        let conn = Arc::new(RecordingConnection::sqlite());
        let orm = setup(Arc::clone(&conn));
        conn.push_rows(&["id", "title", "author_id"], vec![post_row(4, "a")]);
        let qs = orm.query("Post").unwrap();
        let first = qs.first().await.unwrap().unwrap();
        assert_eq!(first.pk(), Value::Int(4));
        assert!(conn.statements()[0].ends_with("ORDER BY \"post\".\"id\" ASC LIMIT 1"));

        let again = qs.first().await.unwrap().unwrap();
        assert!(again.ptr_eq(&first));
        assert_eq!(conn.statements().len(), 1);

        // Reversing swaps the remembered ends.
        let last = qs.reverse().last().await.unwrap().unwrap();
        assert!(last.ptr_eq(&first));
        assert_eq!(conn.statements().len(), 1);
    }

    #[tokio::test]
    async fn test_last_orders_descending() {
        let conn = Arc::new(RecordingConnection::sqlite());
        let orm = setup(Arc::clone(&conn));
        let qs = orm.query("Post").unwrap().order_by(&["title"]);
        assert!(qs.last().await.unwrap().is_none());
        assert!(conn.statements()[0].ends_with("ORDER BY \"post\".\"title\" DESC LIMIT 1"));
        assert!(orm.query("Post").unwrap().limit(2).last().await.is_err());
    }

    #[tokio::test]
    async fn test_count_is_remembered_until_write() {
        let conn = Arc::new(RecordingConnection::sqlite());
        let orm = setup(Arc::clone(&conn));
        conn.push_rows(&["__count"], vec![vec![Value::Int(3)]]);
        let qs = orm.query("Post").unwrap();
        assert_eq!(qs.count().await.unwrap(), 3);
        assert_eq!(qs.count().await.unwrap(), 3);
        assert_eq!(conn.statements().len(), 1);

        qs.update(&[("title", "t".into())]).await.unwrap();
        conn.push_rows(&["__count"], vec![vec![Value::Int(5)]]);
        assert_eq!(qs.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_values_list_keeps_requested_order() {
        let conn = Arc::new(RecordingConnection::sqlite());
        let orm = setup(Arc::clone(&conn));
        conn.push_rows(
            &["title", "id"],
            vec![vec![Value::from("a"), Value::Int(1)]],
        );
        let rows = orm
            .query("Post")
            .unwrap()
            .values_list(&["title", "id"])
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![Value::from("a"), Value::Int(1)]]);
    }

    #[tokio::test]
    async fn test_get_or_create_creates_when_missing() {
        let conn = Arc::new(RecordingConnection::sqlite());
        let orm = setup(Arc::clone(&conn));
        let (post, created) = orm
            .manager("Post")
            .unwrap()
            .get_or_create(&[("title", "new".into())], &[("author", 1.into())])
            .await
            .unwrap();
        assert!(created);
        assert!(post.is_persisted());
        assert_eq!(post.get("author").unwrap(), Value::Int(1));
        let stmts = conn.statements();
        assert!(stmts[0].starts_with("SELECT"));
        assert_eq!(stmts[1], "BEGIN");
        assert!(stmts[2].starts_with("SAVEPOINT"));
        assert_eq!(stmts[3], "INSERT INTO \"post\" (\"title\", \"author_id\") VALUES (?, ?)");
    }

    #[tokio::test]
    async fn test_get_or_create_finds_existing() {
        let conn = Arc::new(RecordingConnection::sqlite());
        let orm = setup(Arc::clone(&conn));
        conn.push_rows(&["id", "title", "author_id"], vec![post_row(2, "old")]);
        let (post, created) = orm
            .query("Post")
            .unwrap()
            .get_or_create(&[("title", "old".into())], &[])
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(post.pk(), Value::Int(2));
        assert_eq!(conn.statements().len(), 1);
    }
}
