//! Query execution.
//!
//! The [`Executor`] owns a snapshot of one query and drives its I/O:
//! batched streaming (or whole-result fetching on single-connection
//! setups), batch-scoped prefetching, point lookups, counts, updates and
//! the two delete strategies. Instance-level writes (`save`/`delete`) live
//! here too so that every statement goes through the same logging.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use relorm_core::{OrmError, OrmResult};

use super::compiler::RowLayout;
use super::crawler::{crawl_relationship, join_path, LOOKUP_SEP, PK};
use super::lookups::Q;
use super::parser::{self, ParsedRow, ResultCache};
use super::spec::{Prefetch, QuerySpec};
use crate::connection::{chunk_rows, Connection};
use crate::fields::{Field, FieldDef, FieldType, OnDelete, Relation};
use crate::instance::{Instance, Related};
use crate::model::{DeletePolicy, ModelMeta};
use crate::orm::Orm;
use crate::registry::Registry;
use crate::row::Row;
use crate::transactions::atomic;
use crate::value::{PkKey, Value};

/// A result cache shared between a queryset and the lookups derived from it.
pub type SharedCache = Arc<Mutex<ResultCache>>;

/// Creates an empty shared cache.
pub fn shared_cache() -> SharedCache {
    Arc::new(Mutex::new(ResultCache::new()))
}

pub(crate) fn log_statement(sql: &str, params: usize) {
    tracing::debug!(sql = %sql, params, "relorm.query");
}

async fn fetch_rows(conn: &dyn Connection, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
    log_statement(sql, params.len());
    conn.fetch_all(sql, params).await
}

pub(crate) async fn execute(conn: &dyn Connection, sql: &str, params: &[Value]) -> OrmResult<u64> {
    log_statement(sql, params.len());
    conn.execute(sql, params).await
}

/// Prefetches grouped by their first path segment.
struct PrefetchGroup<'a> {
    head: String,
    leaf: Option<&'a Prefetch>,
    nested: Vec<Prefetch>,
}

/// Runs one query.
pub struct Executor {
    orm: Orm,
    model: Arc<ModelMeta>,
    spec: QuerySpec,
    cache: SharedCache,
    fetch_all: bool,
}

impl Executor {
    /// Creates an executor for `spec` over `model`.
    pub fn new(orm: Orm, model: Arc<ModelMeta>, spec: QuerySpec, cache: SharedCache) -> Self {
        Self {
            orm,
            model,
            spec,
            cache,
            fetch_all: false,
        }
    }

    /// Loads the whole result before yielding instead of streaming it.
    #[must_use]
    pub const fn fetch_all_at_once(mut self, yes: bool) -> Self {
        self.fetch_all = yes;
        self
    }

    fn lock_cache(&self) -> MutexGuard<'_, ResultCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self) -> OrmResult<Arc<dyn Connection>> {
        let alias = self
            .spec
            .using_database
            .as_deref()
            .unwrap_or(&self.model.database);
        self.orm.connection(alias)
    }

    fn batch_size(&self) -> usize {
        self.spec
            .batch_size
            .unwrap_or(self.orm.settings().default_batch_size)
            .max(1)
    }

    fn child(&self, model: Arc<ModelMeta>, spec: QuerySpec) -> Self {
        Self::new(self.orm.clone(), model, spec, Arc::clone(&self.cache)).fetch_all_at_once(true)
    }

    // ── Cross-database filters ────────────────────────────────────────

    /// The query with cross-database filter paths replaced by key lists
    /// fetched from the other database.
    async fn resolved_spec(&self) -> OrmResult<QuerySpec> {
        let mut spec = self.spec.clone();
        let mut filters = Vec::with_capacity(spec.filters.len());
        for q in std::mem::take(&mut spec.filters) {
            filters.push(self.rewrite(q).await?);
        }
        spec.filters = filters;
        let mut ors = Vec::with_capacity(spec.or_clauses.len());
        for q in std::mem::take(&mut spec.or_clauses) {
            ors.push(self.rewrite(q).await?);
        }
        spec.or_clauses = ors;
        Ok(spec)
    }

    fn rewrite(&self, q: Q) -> BoxFuture<'_, OrmResult<Q>> {
        Box::pin(async move {
            Ok(match q {
                Q::Filter { path, value } => self.rewrite_leaf(path, value).await?,
                Q::And(children) => {
                    let mut out = Vec::with_capacity(children.len());
                    for c in children {
                        out.push(self.rewrite(c).await?);
                    }
                    Q::And(out)
                }
                Q::Or(children) => {
                    let mut out = Vec::with_capacity(children.len());
                    for c in children {
                        out.push(self.rewrite(c).await?);
                    }
                    Q::Or(out)
                }
                Q::Not(inner) => Q::Not(Box::new(self.rewrite(*inner).await?)),
            })
        })
    }

    async fn rewrite_leaf(&self, path: String, value: Value) -> OrmResult<Q> {
        let crawl = crawl_relationship(self.orm.registry(), &self.model, &path, false)?;
        if !crawl.crosses_database() {
            return Ok(Q::Filter { path, value });
        }
        let field = crawl.model.field_or_err(&crawl.field_name)?;
        let relation = field.relation.as_ref().ok_or_else(|| {
            OrmError::QuerySetError(format!("'{path}' is not a relation path"))
        })?;
        let (local_path, remote_path) = match relation {
            Relation::Forward { .. } => (crawl.qualified_field(), PK.to_string()),
            Relation::Reverse { reverse_name, .. } => {
                (join_path(&crawl.forward_path, PK), reverse_name.clone())
            }
            Relation::ManyToMany { .. } => {
                return Err(OrmError::QuerySetError(format!(
                    "'{path}' crosses a database boundary through a many-to-many relation"
                )))
            }
        };
        let target = self.orm.model(relation.target())?;
        let remote_spec = QuerySpec {
            filters: vec![Q::kw(crawl.cross_db_remainder.clone(), value)],
            ..QuerySpec::default()
        };
        let remote = Self::new(self.orm.clone(), target, remote_spec, shared_cache());
        let keys: Vec<Value> = remote
            .values(&[remote_path.clone()])
            .await?
            .into_iter()
            .filter_map(|mut row| row.remove(&remote_path))
            .filter(|v| !v.is_null())
            .collect();
        tracing::debug!(path = %path, keys = keys.len(), "relorm.cross_database_filter");
        Ok(Q::kw(format!("{local_path}{LOOKUP_SEP}in"), Value::List(keys)))
    }

    // ── Reading ───────────────────────────────────────────────────────

    /// Streams result batches. Each batch is parsed, prefetched and cached
    /// on its own; dropping the stream stops further fetching.
    pub fn batches(self) -> BoxStream<'static, OrmResult<Vec<Instance>>> {
        if self.spec.empty {
            return stream::empty().boxed();
        }
        let this = Arc::new(self);
        stream::once(this.open()).try_flatten().boxed()
    }

    async fn open(self: Arc<Self>) -> OrmResult<BoxStream<'static, OrmResult<Vec<Instance>>>> {
        let spec = self.resolved_spec().await?;
        let conn = self.connection()?;
        let compiled = self
            .orm
            .compiler(conn.backend_type())
            .build_select(&spec, &self.model)?;
        let batch = self.batch_size();
        log_statement(&compiled.sql, compiled.params.len());
        let whole = self.fetch_all || conn.is_single_connection() || self.orm.settings().force_fetch_all;
        let raw: BoxStream<'static, OrmResult<Vec<Row>>> = if whole {
            let rows = conn.fetch_all(&compiled.sql, &compiled.params).await?;
            stream::iter(chunk_rows(rows, batch).into_iter().map(Ok)).boxed()
        } else {
            conn.fetch_batches(&compiled.sql, &compiled.params, batch).await?
        };
        let layout = Arc::new(compiled.layout);
        let seen: HashSet<(String, PkKey)> = HashSet::new();
        Ok(stream::try_unfold(
            (raw, seen, self, layout),
            |(mut raw, mut seen, this, layout)| async move {
                while let Some(rows) = raw.next().await {
                    let out = this.process(&rows?, &layout, &mut seen).await?;
                    if !out.is_empty() {
                        return Ok(Some((out, (raw, seen, this, layout))));
                    }
                }
                Ok(None)
            },
        )
        .boxed())
    }

    /// Parses one batch, runs its prefetches and drops roots already yielded.
    async fn process(
        &self,
        rows: &[Row],
        layout: &RowLayout,
        seen: &mut HashSet<(String, PkKey)>,
    ) -> OrmResult<Vec<Instance>> {
        let roots = {
            let mut cache = self.lock_cache();
            let parsed = parser::parse_rows(rows, layout, &mut cache)?;
            parser::unique(parsed.into_iter().map(|p| p.instance))
        };
        self.prefetch(&roots, &self.spec.prefetch).await?;
        let out = match &self.spec.embed_parent {
            Some(embed) => parser::embed(&roots, embed),
            None => roots,
        };
        Ok(out
            .into_iter()
            .filter(|i| seen.insert((i.model().name.clone(), i.pk_key())))
            .collect())
    }

    /// Every result.
    pub async fn fetch(self) -> OrmResult<Vec<Instance>> {
        let batches: Vec<Vec<Instance>> = self.batches().try_collect().await?;
        Ok(batches.into_iter().flatten().collect())
    }

    /// Whole fetch returning one parsed entry per row, with prefetch keys.
    async fn load(&self) -> OrmResult<Vec<ParsedRow>> {
        if self.spec.empty {
            return Ok(Vec::new());
        }
        let spec = self.resolved_spec().await?;
        let conn = self.connection()?;
        let compiled = self
            .orm
            .compiler(conn.backend_type())
            .build_select(&spec, &self.model)?;
        let rows = fetch_rows(conn.as_ref(), &compiled.sql, &compiled.params).await?;
        let parsed = {
            let mut cache = self.lock_cache();
            parser::parse_rows(&rows, &compiled.layout, &mut cache)?
        };
        let distinct = parser::unique(parsed.iter().map(|p| p.instance.clone()));
        self.prefetch(&distinct, &self.spec.prefetch).await?;
        Ok(parsed)
    }

    /// The single matching instance.
    ///
    /// Fetches at most two rows unless a joined to-many relation can repeat
    /// the root row.
    pub async fn get_one(&self) -> OrmResult<Instance> {
        let not_found = || {
            OrmError::ObjectNotFound(format!("{} matching query does not exist.", self.model.name))
        };
        if self.spec.empty {
            return Err(not_found());
        }
        let mut spec = self.resolved_spec().await?;
        let conn = self.connection()?;
        let compiler = self.orm.compiler(conn.backend_type());
        let mut compiled = compiler.build_select(&spec, &self.model)?;
        if !compiled.layout.has_many() && spec.limit.is_none() {
            spec.limit = Some(2);
            compiled = compiler.build_select(&spec, &self.model)?;
        }
        let rows = fetch_rows(conn.as_ref(), &compiled.sql, &compiled.params).await?;
        let mut seen = HashSet::new();
        let mut found = self.process(&rows, &compiled.layout, &mut seen).await?;
        match found.len() {
            0 => Err(not_found()),
            1 => found.pop().ok_or_else(not_found),
            n => Err(OrmError::MultipleObjectsReturned(format!(
                "get() returned more than one {} -- it returned {n}!",
                self.model.name
            ))),
        }
    }

    /// Number of matching rows.
    pub async fn count(&self) -> OrmResult<u64> {
        if self.spec.empty {
            return Ok(0);
        }
        let spec = self.resolved_spec().await?;
        let conn = self.connection()?;
        let (sql, params) = self
            .orm
            .compiler(conn.backend_type())
            .build_count(&spec, &self.model)?;
        log_statement(&sql, params.len());
        conn.fetch_one(&sql, &params).await?.get_by_index::<u64>(0)
    }

    /// Whether anything matches.
    pub async fn exists(&self) -> OrmResult<bool> {
        if self.spec.empty {
            return Ok(false);
        }
        let spec = self.resolved_spec().await?;
        let conn = self.connection()?;
        let (sql, params) = self
            .orm
            .compiler(conn.backend_type())
            .build_exists(&spec, &self.model)?;
        Ok(!fetch_rows(conn.as_ref(), &sql, &params).await?.is_empty())
    }

    /// Raw values of `paths` per row.
    pub async fn values(&self, paths: &[String]) -> OrmResult<Vec<BTreeMap<String, Value>>> {
        if self.spec.empty {
            return Ok(Vec::new());
        }
        let spec = self.resolved_spec().await?;
        let conn = self.connection()?;
        let compiled = self
            .orm
            .compiler(conn.backend_type())
            .build_values(&spec, &self.model, paths)?;
        let rows = fetch_rows(conn.as_ref(), &compiled.sql, &compiled.params).await?;
        parser::parse_values(&rows, &compiled.layout)
    }

    // ── Prefetching ───────────────────────────────────────────────────

    /// Populates `prefetches` on `parents`, one query per relation level.
    fn prefetch<'a>(
        &'a self,
        parents: &'a [Instance],
        prefetches: &'a [Prefetch],
    ) -> BoxFuture<'a, OrmResult<()>> {
        Box::pin(async move {
            if parents.is_empty() || prefetches.is_empty() {
                return Ok(());
            }
            let mut groups: Vec<PrefetchGroup<'a>> = Vec::new();
            for p in prefetches {
                let (head, rest) = p
                    .related_name
                    .split_once(LOOKUP_SEP)
                    .unwrap_or((p.related_name.as_str(), ""));
                let idx = match groups.iter().position(|g| g.head == head) {
                    Some(idx) => idx,
                    None => {
                        groups.push(PrefetchGroup {
                            head: head.to_string(),
                            leaf: None,
                            nested: Vec::new(),
                        });
                        groups.len() - 1
                    }
                };
                if rest.is_empty() {
                    groups[idx].leaf = Some(p);
                } else {
                    groups[idx].nested.push(Prefetch {
                        related_name: rest.to_string(),
                        to_attr: p.to_attr.clone(),
                        queryset: p.queryset.clone(),
                    });
                }
            }
            let cap = if self.connection()?.is_single_connection() {
                1
            } else {
                self.orm.settings().prefetch_concurrency.max(1)
            };
            let pending: Vec<_> = groups
                .iter()
                .map(|g| self.prefetch_group(parents, g))
                .collect();
            stream::iter(pending)
                .buffer_unordered(cap)
                .try_collect::<Vec<()>>()
                .await?;
            Ok(())
        })
    }

    async fn prefetch_group(&self, parents: &[Instance], group: &PrefetchGroup<'_>) -> OrmResult<()> {
        let model = Arc::clone(parents[0].model());
        let field = model.field_or_err(&group.head)?;
        let relation = field.relation.as_ref().ok_or_else(|| {
            OrmError::QuerySetError(format!(
                "Cannot prefetch '{}': it is not a relation of {}",
                group.head, model.name
            ))
        })?;
        let target = self.orm.model(relation.target())?;
        let attr = group.leaf.map_or(group.head.as_str(), Prefetch::attr).to_string();
        let mut spec = group
            .leaf
            .and_then(|p| p.queryset.clone())
            .unwrap_or_default();
        if spec.order_by.is_empty() {
            spec.order_by.clone_from(&target.ordering);
        }
        // Nested forward prefetches read their keys from these children.
        for nested in &group.nested {
            let head = nested.related_name.split(LOOKUP_SEP).next().unwrap_or_default();
            if target.field(head).is_some_and(FieldDef::is_concrete) {
                if !spec.only.is_empty() && !spec.only.iter().any(|f| f == head) {
                    spec.only.push(head.to_string());
                }
                spec.defer.retain(|f| f != head);
            }
        }

        let children = if let Relation::Forward { .. } = relation {
            let mut keys = Vec::new();
            let mut wanted = HashSet::new();
            let mut parent_keys = Vec::with_capacity(parents.len());
            for parent in parents {
                let value = parent.get(&group.head)?;
                if value.is_null() {
                    parent_keys.push(None);
                    continue;
                }
                let key = PkKey::from_values(value.as_parts());
                if wanted.insert(key.clone()) {
                    keys.push(value);
                }
                parent_keys.push(Some(key));
            }
            spec.filters.push(Q::kw(format!("{PK}{LOOKUP_SEP}in"), Value::List(keys)));
            let found: Vec<Instance> = if wanted.is_empty() {
                Vec::new()
            } else {
                self.child(Arc::clone(&target), spec.clone())
                    .load()
                    .await?
                    .into_iter()
                    .map(|p| p.instance)
                    .collect()
            };
            let by_key: HashMap<PkKey, Instance> =
                found.iter().map(|i| (i.pk_key(), i.clone())).collect();
            for (parent, key) in parents.iter().zip(parent_keys) {
                let related = key.and_then(|k| by_key.get(&k).cloned());
                parent.attach(&attr, Related::One(related));
            }
            parser::unique(found)
        } else {
            let back = relation.reverse_name().ok_or_else(|| {
                OrmError::QuerySetError(format!(
                    "Cannot prefetch '{}': {} has no relation back to {}",
                    group.head, target.name, model.name
                ))
            })?;
            let mut pks = Vec::new();
            let mut wanted = HashSet::new();
            for parent in parents {
                if wanted.insert(parent.pk_key()) {
                    pks.push(parent.pk());
                }
            }
            spec.filters.push(Q::kw(format!("{back}{LOOKUP_SEP}in"), Value::List(pks)));
            spec.key_path = Some(back.to_string());
            let rows = self.child(Arc::clone(&target), spec.clone()).load().await?;
            let mut by_parent: HashMap<PkKey, Vec<Instance>> = HashMap::new();
            let mut all = Vec::with_capacity(rows.len());
            for row in rows {
                let Some(key) = row.key else { continue };
                if !wanted.contains(&key) {
                    continue;
                }
                let items = by_parent.entry(key).or_default();
                if !items.iter().any(|i| i.ptr_eq(&row.instance)) {
                    items.push(row.instance.clone());
                }
                all.push(row.instance);
            }
            let unique = matches!(relation, Relation::Reverse { unique: true, .. });
            for parent in parents {
                let items = by_parent.remove(&parent.pk_key()).unwrap_or_default();
                if unique {
                    parent.attach(&attr, Related::One(items.into_iter().next()));
                } else {
                    parent.attach(&attr, Related::Many(items));
                }
            }
            parser::unique(all)
        };
        tracing::debug!(
            model = %model.name,
            relation = %group.head,
            parents = parents.len(),
            found = children.len(),
            "relorm.prefetch"
        );
        if !group.nested.is_empty() && !children.is_empty() {
            self.child(target, spec)
                .prefetch(&children, &group.nested)
                .await?;
        }
        Ok(())
    }

    // ── Writing ───────────────────────────────────────────────────────

    /// Updates every matching row; returns the affected row count.
    pub async fn update(&self, assignments: &[(String, Value)]) -> OrmResult<u64> {
        if self.spec.empty {
            return Ok(0);
        }
        let mut columns = Vec::new();
        for (name, value) in assignments {
            let field = self.model.field_or_err(name)?;
            columns.extend(field.clean(value)?);
        }
        let spec = self.resolved_spec().await?;
        let conn = self.connection()?;
        let (sql, params) = self
            .orm
            .compiler(conn.backend_type())
            .build_update(&spec, &self.model, &columns)?;
        execute(conn.as_ref(), &sql, &params).await
    }

    /// Deletes every matching row with the model's delete policy, or with
    /// `policy` when given.
    pub async fn delete(&self, policy: Option<DeletePolicy>) -> OrmResult<u64> {
        if self.spec.is_sliced() || self.spec.combined.is_some() {
            return Err(OrmError::QuerySetError(
                "Cannot delete a sliced or combined query".to_string(),
            ));
        }
        if self.spec.empty {
            return Ok(0);
        }
        let conn = self.connection()?;
        match policy.unwrap_or(self.model.delete_policy) {
            DeletePolicy::Fast => {
                let spec = self.resolved_spec().await?;
                let (sql, params) = self
                    .orm
                    .compiler(conn.backend_type())
                    .build_delete(&spec, &self.model)?;
                execute(conn.as_ref(), &sql, &params).await
            }
            DeletePolicy::Cascading => self.delete_cascading(conn.as_ref()).await,
        }
    }

    /// Loads a batch, deletes it instance by instance in one transaction,
    /// and repeats until nothing matches. Committed batches stay committed
    /// when a later batch fails.
    async fn delete_cascading(&self, conn: &dyn Connection) -> OrmResult<u64> {
        let batch = self.batch_size();
        let mut spec = self.spec.clone();
        spec.order_by = self.model.pk_names().iter().map(|s| (*s).to_string()).collect();
        spec.limit = Some(batch as u64);
        spec.select_related.clear();
        spec.prefetch.clear();
        spec.only.clear();
        spec.defer.clear();
        spec.embed_parent = None;

        let mut total = 0;
        let mut round = 0_u32;
        loop {
            let loader = Self::new(self.orm.clone(), Arc::clone(&self.model), spec.clone(), shared_cache())
                .fetch_all_at_once(true);
            let instances = loader.fetch().await?;
            if instances.is_empty() {
                break;
            }
            let loaded = instances.len();
            let orm = &self.orm;
            let deleted = atomic(conn, |txn| async move {
                let mut deleted = 0;
                for instance in &instances {
                    deleted += delete_one(orm, txn, instance).await?;
                }
                Ok(deleted)
            })
            .await?;
            round += 1;
            tracing::debug!(model = %self.model.name, batch = round, deleted, "relorm.cascade_delete");
            total += deleted;
            if loaded < batch || deleted == 0 {
                break;
            }
        }
        Ok(total)
    }
}

/// Foreign keys in `model`'s database pointing at it, with their
/// `on_delete` action.
fn dependents(registry: &Registry, model: &ModelMeta) -> Vec<(Arc<ModelMeta>, String, OnDelete)> {
    let mut out = Vec::new();
    for other in registry.models() {
        if other.database != model.database {
            continue;
        }
        for field in other.concrete_fields() {
            if let FieldType::ForeignKey { to, on_delete, .. } | FieldType::OneToOneField { to, on_delete, .. } =
                &field.field_type
            {
                if *to == model.name {
                    out.push((Arc::clone(other), field.name.clone(), *on_delete));
                }
            }
        }
    }
    out
}

/// Rows of `model` can go with one DELETE: no hooks to run and nothing
/// that depends on them.
fn can_fast_delete(registry: &Registry, model: &ModelMeta) -> bool {
    model.hooks.is_none()
        && dependents(registry, model)
            .iter()
            .all(|(_, _, action)| *action == OnDelete::DoNothing)
}

async fn delete_one(orm: &Orm, conn: &dyn Connection, instance: &Instance) -> OrmResult<u64> {
    let mut seen = HashSet::new();
    delete_tree(orm, conn, instance, &mut seen).await
}

/// Deletes `instance` after applying the `on_delete` action of every
/// foreign key pointing at it. `seen` breaks reference cycles.
fn delete_tree<'a>(
    orm: &'a Orm,
    conn: &'a dyn Connection,
    instance: &'a Instance,
    seen: &'a mut HashSet<(String, PkKey)>,
) -> BoxFuture<'a, OrmResult<u64>> {
    Box::pin(async move {
        let model = instance.model();
        if !seen.insert((model.name.clone(), instance.pk_key())) {
            return Ok(0);
        }
        if let Some(hooks) = &model.hooks {
            hooks.pre_delete(instance)?;
        }
        let compiler = orm.compiler(conn.backend_type());
        for (dependent, field, action) in dependents(orm.registry(), model) {
            let spec = QuerySpec {
                filters: vec![Q::kw(field.clone(), instance.pk())],
                ..QuerySpec::default()
            };
            match action {
                OnDelete::DoNothing => {}
                OnDelete::Protect => {
                    let (sql, params) = compiler.build_exists(&spec, &dependent)?;
                    if !fetch_rows(conn, &sql, &params).await?.is_empty() {
                        return Err(OrmError::IntegrityError(format!(
                            "Cannot delete {} {:?}: it is referenced through the protected foreign key {}.{field}",
                            model.name,
                            instance.pk(),
                            dependent.name
                        )));
                    }
                }
                OnDelete::SetNull => {
                    let assignments: Vec<(String, Value)> = dependent
                        .field_or_err(&field)?
                        .columns()
                        .into_iter()
                        .map(|c| (c, Value::Null))
                        .collect();
                    let (sql, params) = compiler.build_update(&spec, &dependent, &assignments)?;
                    execute(conn, &sql, &params).await?;
                }
                OnDelete::Cascade if can_fast_delete(orm.registry(), &dependent) => {
                    let (sql, params) = compiler.build_delete(&spec, &dependent)?;
                    execute(conn, &sql, &params).await?;
                }
                OnDelete::Cascade => {
                    let spec = QuerySpec {
                        order_by: dependent.pk_names().iter().map(|s| (*s).to_string()).collect(),
                        ..spec
                    };
                    let compiled = compiler.build_select(&spec, &dependent)?;
                    let rows = fetch_rows(conn, &compiled.sql, &compiled.params).await?;
                    let children = {
                        let mut cache = ResultCache::new();
                        let parsed = parser::parse_rows(&rows, &compiled.layout, &mut cache)?;
                        parser::unique(parsed.into_iter().map(|p| p.instance))
                    };
                    tracing::debug!(
                        model = %dependent.name,
                        field = %field,
                        rows = children.len(),
                        "relorm.cascade_collect"
                    );
                    for child in &children {
                        delete_tree(orm, conn, child, seen).await?;
                    }
                }
            }
        }
        let spec = QuerySpec {
            filters: vec![Q::kw(PK, instance.pk())],
            ..QuerySpec::default()
        };
        let (sql, params) = compiler.build_delete(&spec, model)?;
        let deleted = execute(conn, &sql, &params).await?;
        instance.set_persisted(false);
        if let Some(hooks) = &model.hooks {
            hooks.post_delete(instance);
        }
        Ok(deleted)
    })
}

/// Columns and values inserted for `instance`. Auto fields still NULL are
/// left for the database to fill.
pub(crate) fn insert_columns(model: &ModelMeta, instance: &Instance) -> OrmResult<(Vec<String>, Vec<Value>)> {
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for field in model.concrete_fields() {
        let value = instance.get(&field.name)?;
        if field.is_auto() && value.is_null() {
            continue;
        }
        for (column, v) in field.clean(&value)? {
            columns.push(column);
            values.push(v);
        }
    }
    Ok((columns, values))
}

async fn insert_one(orm: &Orm, conn: &dyn Connection, model: &Arc<ModelMeta>, instance: &Instance) -> OrmResult<()> {
    let (columns, values) = insert_columns(model, instance)?;
    let (sql, params) = orm
        .compiler(conn.backend_type())
        .build_insert(&QuerySpec::default(), model, &columns, &[values])?;
    log_statement(&sql, params.len());
    let id = conn.insert_returning(&sql, &params).await?;
    if let [pk] = model.pk_fields().as_slice() {
        if pk.is_auto() && instance.get(&pk.name)?.is_null() {
            instance.set(&pk.name, pk.field_type.to_model(&id)?)?;
        }
    }
    Ok(())
}

async fn update_one(orm: &Orm, conn: &dyn Connection, model: &Arc<ModelMeta>, instance: &Instance) -> OrmResult<u64> {
    let loaded = instance.values();
    let mut assignments = Vec::new();
    for field in model.concrete_fields().filter(|f| !f.primary_key) {
        if let Some(value) = loaded.get(&field.name) {
            assignments.extend(field.clean(value)?);
        }
    }
    if assignments.is_empty() {
        return Ok(1);
    }
    let spec = QuerySpec {
        filters: vec![Q::kw(PK, instance.pk())],
        ..QuerySpec::default()
    };
    let (sql, params) = orm
        .compiler(conn.backend_type())
        .build_update(&spec, model, &assignments)?;
    execute(conn, &sql, &params).await
}

/// Saves an instance: UPDATE when persisted (falling back to INSERT when no
/// row matched), INSERT otherwise. Hooks and statements share one
/// transaction.
pub(crate) async fn save_instance(orm: &Orm, instance: &Instance) -> OrmResult<()> {
    let model = Arc::clone(instance.model());
    let conn = orm.connection(&model.database)?;
    let created = !instance.is_persisted();
    atomic(conn.as_ref(), |txn| async move {
        if let Some(hooks) = &model.hooks {
            hooks.pre_save(instance, created)?;
        }
        if created || update_one(orm, txn, &model, instance).await? == 0 {
            insert_one(orm, txn, &model, instance).await?;
        }
        instance.set_persisted(true);
        if let Some(hooks) = &model.hooks {
            hooks.post_save(instance, created);
        }
        Ok(())
    })
    .await
}

/// Deletes one instance with its hooks in a transaction.
pub(crate) async fn delete_instance(orm: &Orm, instance: &Instance) -> OrmResult<u64> {
    let conn = orm.connection(&instance.model().database)?;
    atomic(conn.as_ref(), |txn| async move { delete_one(orm, txn, instance).await }).await
}
