//! SQL compilation.
//!
//! The [`Compiler`] turns a [`QuerySpec`] into one parameterized statement
//! for a given dialect. It keeps a join graph of table transitions keyed by
//! `(source alias, target alias, relation field)`, so a relation reached by
//! several paths (a `select_related`, a filter, an ordering) is joined
//! exactly once. Joins are always `LEFT OUTER JOIN`s emitted predecessor
//! first.
//!
//! Filters that reach through a to-many relation the projection does not
//! itself join are compiled as semi-joins
//! (`root_pk IN (SELECT root_pk FROM ... WHERE ...)`) so that matching
//! several related rows cannot repeat a parent row.
//!
//! Besides the statement, compilation yields a [`RowLayout`] telling the
//! result parser which columns belong to which model.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use relorm_core::{OrmError, OrmResult};

use super::crawler::{crawl_relationship, join_path, pk_name, Hop, LOOKUP_SEP, PK};
use super::lookups::Q;
use super::operators::{OperatorTable, Params};
use super::spec::{Combined, Distinct, ExtraExpr, LockStrength, LockWait, QuerySpec, SetOp};
use crate::connection::DatabaseBackendType;
use crate::fields::{ColumnPair, FieldDef, FieldType, Relation};
use crate::model::ModelMeta;
use crate::registry::Registry;
use crate::value::Value;

/// Columns of one field inside a result row.
#[derive(Debug, Clone)]
pub struct SlotField {
    /// Field name.
    pub name: String,
    /// Row indexes of the field's columns.
    pub indexes: Vec<usize>,
}

/// Where one model's columns sit in a result row.
#[derive(Debug, Clone)]
pub struct ModelSlot {
    /// The model hydrated from these columns.
    pub model: Arc<ModelMeta>,
    /// Loaded fields.
    pub fields: Vec<SlotField>,
    /// Row indexes of the primary-key columns.
    pub pk: Vec<usize>,
    /// Concrete fields left out of the projection.
    pub deferred: Vec<String>,
}

/// A model populated through `select_related`.
#[derive(Debug, Clone)]
pub struct JoinedSlot {
    /// Relation path from the root.
    pub path: String,
    /// Path of the slot this one hangs off (`""` for the root).
    pub parent: String,
    /// Relation field on the parent.
    pub field: String,
    /// Whether the relation can yield several objects.
    pub many: bool,
    /// The columns.
    pub slot: ModelSlot,
}

/// A column requested through `values()`.
#[derive(Debug, Clone)]
pub struct ValueColumn {
    /// Result key.
    pub label: String,
    /// Row indexes of the column(s).
    pub indexes: Vec<usize>,
    /// Types used to convert raw values.
    pub types: Vec<FieldType>,
}

/// How to read a result row.
#[derive(Debug, Clone)]
pub struct RowLayout {
    /// The root model.
    pub root: ModelSlot,
    /// Joined models in dependency order.
    pub joined: Vec<JoinedSlot>,
    /// Row indexes of the prefetch key columns.
    pub keys: Vec<usize>,
    /// Types of the prefetch key columns.
    pub key_types: Vec<FieldType>,
    /// Extra columns: label and row index.
    pub extras: Vec<(String, usize)>,
    /// `values()` columns.
    pub values: Vec<ValueColumn>,
    /// Every selected column label in order.
    pub labels: Vec<String>,
}

impl RowLayout {
    /// Whether any joined relation can repeat the root row.
    pub fn has_many(&self) -> bool {
        self.joined.iter().any(|j| j.many)
    }
}

/// One table participating in a query.
#[derive(Debug, Clone)]
pub struct TableEntry {
    /// SQL alias.
    pub alias: String,
    /// Model stored in the table.
    pub model: Arc<ModelMeta>,
}

/// A compiled SELECT.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    /// Statement text.
    pub sql: String,
    /// Bind parameters in placeholder order.
    pub params: Vec<Value>,
    /// How to read the rows.
    pub layout: RowLayout,
    /// Relation prefix (`""` for the root) to participating table.
    pub tables: BTreeMap<String, TableEntry>,
}

/// What the SELECT list contains.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Projection {
    /// Root and `select_related` models, extras and prefetch keys.
    Full,
    /// Root model and extras only (set-operation operands).
    RootOnly,
    /// Root primary key only.
    RootPk { distinct: bool },
    /// Named paths.
    Values(Vec<String>),
}

struct Transition {
    from_alias: String,
    alias: String,
    model: Arc<ModelMeta>,
    on: Vec<(String, String)>,
    predecessor: Option<usize>,
    many: bool,
}

/// The deduplicated join graph of one statement.
struct JoinGraph {
    root_alias: String,
    tables: BTreeMap<String, TableEntry>,
    transitions: Vec<Transition>,
    keys: HashMap<(String, String, String), usize>,
    by_alias: HashMap<String, usize>,
}

impl JoinGraph {
    fn new(root: &Arc<ModelMeta>) -> Self {
        let mut tables = BTreeMap::new();
        tables.insert(
            String::new(),
            TableEntry {
                alias: root.table.clone(),
                model: Arc::clone(root),
            },
        );
        Self {
            root_alias: root.table.clone(),
            tables,
            transitions: Vec::new(),
            keys: HashMap::new(),
            by_alias: HashMap::new(),
        }
    }

    fn add(
        &mut self,
        from_alias: &str,
        alias: &str,
        field: &str,
        model: Arc<ModelMeta>,
        pairs: &[ColumnPair],
        many: bool,
    ) -> usize {
        let key = (from_alias.to_string(), alias.to_string(), field.to_string());
        if let Some(&idx) = self.keys.get(&key) {
            return idx;
        }
        let idx = self.transitions.len();
        self.transitions.push(Transition {
            from_alias: from_alias.to_string(),
            alias: alias.to_string(),
            model,
            on: pairs
                .iter()
                .map(|p| (p.local.clone(), p.remote.clone()))
                .collect(),
            predecessor: self.by_alias.get(from_alias).copied(),
            many,
        });
        self.keys.insert(key, idx);
        self.by_alias.insert(alias.to_string(), idx);
        idx
    }

    /// Adds the transitions for `hops`. With `stop_before_target`, the last
    /// hop stops at the table holding its key columns (the source table for
    /// a forward key, the association table for many-to-many).
    fn walk(
        &mut self,
        registry: &Registry,
        hops: &[Hop],
        stop_before_target: bool,
    ) -> OrmResult<(String, Vec<usize>)> {
        let mut alias = self.root_alias.clone();
        let mut prefix = String::new();
        let mut used = Vec::new();
        for (i, hop) in hops.iter().enumerate() {
            prefix = join_path(&prefix, &hop.field);
            let last = i + 1 == hops.len();
            let next = format!("j_{prefix}");
            match &hop.relation {
                Relation::Forward { columns, .. } | Relation::Reverse { columns, .. } => {
                    if last && stop_before_target {
                        break;
                    }
                    let many = hop.relation.is_many();
                    used.push(self.add(&alias, &next, &hop.field, Arc::clone(&hop.to), columns, many));
                }
                Relation::ManyToMany {
                    through,
                    from_columns,
                    to_columns,
                    ..
                } => {
                    let through_meta = Arc::clone(registry.get(through)?);
                    let t_alias = format!("t_{prefix}");
                    used.push(self.add(&alias, &t_alias, &hop.field, through_meta, from_columns, true));
                    if last && stop_before_target {
                        alias = t_alias;
                        break;
                    }
                    used.push(self.add(&t_alias, &next, &hop.field, Arc::clone(&hop.to), to_columns, true));
                }
            }
            self.tables.insert(
                prefix.clone(),
                TableEntry {
                    alias: next.clone(),
                    model: Arc::clone(&hop.to),
                },
            );
            alias = next;
        }
        Ok((alias, used))
    }

    /// The transitions in `set` plus all their predecessors.
    fn closure(&self, set: &BTreeSet<usize>) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        for &idx in set {
            let mut cur = Some(idx);
            while let Some(i) = cur {
                if !out.insert(i) {
                    break;
                }
                cur = self.transitions[i].predecessor;
            }
        }
        out
    }
}

/// A path resolved to qualified columns.
struct Resolved {
    columns: Vec<(String, FieldType)>,
    transitions: Vec<usize>,
    operator: String,
}

/// The physical columns of a concrete field with their value types.
fn typed_columns(field: &FieldDef) -> Vec<(String, FieldType)> {
    match &field.relation {
        Some(Relation::Forward { columns, .. }) => columns
            .iter()
            .map(|c| (c.local.clone(), c.value_type.clone()))
            .collect(),
        _ if field.is_concrete() => vec![(field.column.clone(), field.field_type.clone())],
        _ => Vec::new(),
    }
}

/// Entries of an only/defer list that apply to the model at `prefix`.
fn scoped<'n>(names: &'n [String], prefix: &str) -> Vec<&'n str> {
    names
        .iter()
        .filter_map(|n| match n.rsplit_once(LOOKUP_SEP) {
            Some((p, f)) if p == prefix => Some(f),
            None if prefix.is_empty() => Some(n.as_str()),
            _ => None,
        })
        .collect()
}

/// Compiles queries for one dialect.
pub struct Compiler<'a> {
    registry: &'a Registry,
    operators: &'a OperatorTable,
    backend: DatabaseBackendType,
    schema: Option<&'a str>,
}

/// Per-statement compilation state.
struct Build<'c, 'a> {
    compiler: &'c Compiler<'a>,
    spec: &'c QuerySpec,
    root: Arc<ModelMeta>,
    graph: JoinGraph,
}

impl<'a> Compiler<'a> {
    /// Creates a compiler.
    ///
    /// `schema` is the context schema applied to tables that name none; a
    /// query's own `using_schema` overrides it.
    pub const fn new(
        registry: &'a Registry,
        operators: &'a OperatorTable,
        backend: DatabaseBackendType,
        schema: Option<&'a str>,
    ) -> Self {
        Self {
            registry,
            operators,
            backend,
            schema,
        }
    }

    /// The dialect compiled for.
    pub const fn backend(&self) -> DatabaseBackendType {
        self.backend
    }

    fn q(&self, ident: &str) -> String {
        self.backend.quote(ident)
    }

    fn qualify(&self, alias: &str, column: &str) -> String {
        format!("{}.{}", self.q(alias), self.q(column))
    }

    fn table_name(&self, spec: &QuerySpec, model: &ModelMeta) -> String {
        let schema = spec
            .using_schema
            .as_deref()
            .or(self.schema)
            .or(model.schema.as_deref());
        match schema {
            Some(schema) => format!("{}.{}", self.q(schema), self.q(&model.table)),
            None => self.q(&model.table),
        }
    }

    fn table_ref(&self, spec: &QuerySpec, model: &ModelMeta, alias: &str) -> String {
        let name = self.table_name(spec, model);
        if name == self.q(alias) {
            name
        } else {
            format!("{name} AS {}", self.q(alias))
        }
    }

    /// Compiles the SELECT for a query.
    ///
    /// # Errors
    ///
    /// `QuerySetError` for invalid paths, unknown operators, locking on a
    /// combined query, and dialect features the backend lacks.
    pub fn build_select(&self, spec: &QuerySpec, model: &Arc<ModelMeta>) -> OrmResult<CompiledQuery> {
        let mut params = Params::new(self.backend);
        let (sql, layout, tables) = self.render(spec, model, &Projection::Full, &mut params)?;
        Ok(CompiledQuery {
            sql,
            params: params.into_values(),
            layout,
            tables,
        })
    }

    /// Compiles a SELECT of the given paths (`values()`).
    pub fn build_values(
        &self,
        spec: &QuerySpec,
        model: &Arc<ModelMeta>,
        paths: &[String],
    ) -> OrmResult<CompiledQuery> {
        let mut params = Params::new(self.backend);
        let (sql, layout, tables) =
            self.render(spec, model, &Projection::Values(paths.to_vec()), &mut params)?;
        Ok(CompiledQuery {
            sql,
            params: params.into_values(),
            layout,
            tables,
        })
    }

    /// The labels a set-operation operand projects.
    pub fn operand_labels(&self, spec: &QuerySpec, model: &Arc<ModelMeta>) -> OrmResult<Vec<String>> {
        let mut params = Params::new(self.backend);
        let (_, layout, _) = self.render(spec, model, &Projection::RootOnly, &mut params)?;
        Ok(layout.labels)
    }

    /// Compiles `SELECT COUNT(*)` over the query.
    ///
    /// When joins, OR-clauses, grouping or `DISTINCT` could repeat a root
    /// row, distinct primary keys are counted instead, matching the roots a
    /// fetch yields. `DISTINCT ON` counts the rows it keeps.
    pub fn build_count(&self, spec: &QuerySpec, model: &Arc<ModelMeta>) -> OrmResult<(String, Vec<Value>)> {
        let inner_spec = Self::aggregate_spec(spec);
        let risky = !spec.select_related.is_empty()
            || !spec.or_clauses.is_empty()
            || !spec.group_by.is_empty();
        let projection = match spec.distinct {
            Distinct::None => Projection::RootPk { distinct: risky },
            Distinct::All => Projection::RootPk { distinct: true },
            Distinct::On(_) => Projection::Full,
        };
        let mut params = Params::new(self.backend);
        let (inner, _, _) = self.render(&inner_spec, model, &projection, &mut params)?;
        Ok((
            format!(
                "SELECT COUNT(*) AS {} FROM ({inner}) AS {}",
                self.q("__count"),
                self.q("_count")
            ),
            params.into_values(),
        ))
    }

    /// Compiles an existence check.
    pub fn build_exists(&self, spec: &QuerySpec, model: &Arc<ModelMeta>) -> OrmResult<(String, Vec<Value>)> {
        let inner_spec = Self::aggregate_spec(spec);
        let mut params = Params::new(self.backend);
        let (inner, _, _) = self.render(
            &inner_spec,
            model,
            &Projection::RootPk { distinct: false },
            &mut params,
        )?;
        Ok((
            format!(
                "SELECT 1 AS {} FROM ({inner}) AS {} LIMIT 1",
                self.q("__exists"),
                self.q("_exists")
            ),
            params.into_values(),
        ))
    }

    fn aggregate_spec(spec: &QuerySpec) -> QuerySpec {
        let mut inner = spec.clone();
        if !inner.is_sliced() {
            inner.order_by.clear();
        }
        inner.prefetch.clear();
        inner.embed_parent = None;
        inner.extra.clear();
        inner.key_path = None;
        inner.lock = None;
        inner
    }

    /// Compiles a multi-row INSERT.
    pub fn build_insert(
        &self,
        spec: &QuerySpec,
        model: &ModelMeta,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> OrmResult<(String, Vec<Value>)> {
        let table = self.table_name(spec, model);
        if columns.is_empty() {
            if rows.len() > 1 {
                return Err(OrmError::QuerySetError(
                    "Cannot insert several rows without columns".to_string(),
                ));
            }
            let sql = match self.backend {
                DatabaseBackendType::MySQL => format!("INSERT INTO {table} () VALUES ()"),
                _ => format!("INSERT INTO {table} DEFAULT VALUES"),
            };
            return Ok((sql, Vec::new()));
        }
        let mut params = Params::new(self.backend);
        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != columns.len() {
                return Err(OrmError::QuerySetError(format!(
                    "Expected {} values per row, got {}",
                    columns.len(),
                    row.len()
                )));
            }
            let phs: Vec<String> = row.iter().map(|v| params.push(v.clone())).collect();
            tuples.push(format!("({})", phs.join(", ")));
        }
        let cols: Vec<String> = columns.iter().map(|c| self.q(c)).collect();
        Ok((
            format!(
                "INSERT INTO {table} ({}) VALUES {}",
                cols.join(", "),
                tuples.join(", ")
            ),
            params.into_values(),
        ))
    }

    /// Compiles an UPDATE of the rows matched by the query.
    pub fn build_update(
        &self,
        spec: &QuerySpec,
        model: &Arc<ModelMeta>,
        assignments: &[(String, Value)],
    ) -> OrmResult<(String, Vec<Value>)> {
        Self::check_writable(spec, "update")?;
        if assignments.is_empty() {
            return Err(OrmError::QuerySetError("Nothing to update".to_string()));
        }
        let mut params = Params::new(self.backend);
        let sets: Vec<String> = assignments
            .iter()
            .map(|(col, v)| format!("{} = {}", self.q(col), params.push(v.clone())))
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            self.table_name(spec, model),
            sets.join(", ")
        );
        if let Some(where_sql) = self.write_filter(spec, model, &mut params)? {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        Ok((sql, params.into_values()))
    }

    /// Compiles a DELETE of the rows matched by the query.
    pub fn build_delete(&self, spec: &QuerySpec, model: &Arc<ModelMeta>) -> OrmResult<(String, Vec<Value>)> {
        Self::check_writable(spec, "delete")?;
        let mut params = Params::new(self.backend);
        let mut sql = format!("DELETE FROM {}", self.table_name(spec, model));
        if let Some(where_sql) = self.write_filter(spec, model, &mut params)? {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        Ok((sql, params.into_values()))
    }

    fn check_writable(spec: &QuerySpec, what: &str) -> OrmResult<()> {
        if spec.is_sliced() {
            return Err(OrmError::QuerySetError(format!(
                "Cannot {what} a query once a slice has been taken"
            )));
        }
        if spec.combined.is_some() {
            return Err(OrmError::QuerySetError(format!(
                "Cannot {what} a combined query"
            )));
        }
        Ok(())
    }

    /// WHERE clause of an UPDATE/DELETE. Filters touching only the target
    /// table are applied directly; anything needing a join is rewritten as
    /// a primary-key subquery.
    fn write_filter(
        &self,
        spec: &QuerySpec,
        model: &Arc<ModelMeta>,
        params: &mut Params,
    ) -> OrmResult<Option<String>> {
        if spec.empty {
            return Ok(Some("1 = 0".to_string()));
        }
        if !spec.has_filters() {
            return Ok(None);
        }
        let mut build = Build::new(self, spec, model);
        let clauses = build.where_clauses();
        let mut used = BTreeSet::new();
        for clause in &clauses {
            used.extend(build.clause_transitions(clause)?);
        }
        if used.is_empty() {
            let parts = clauses
                .iter()
                .map(|c| build.compile_q(c, params))
                .collect::<OrmResult<Vec<_>>>()?;
            return Ok(Some(parts.join(" AND ")));
        }
        let pk = build.root_pk_tuple();
        let mut inner = format!(
            "SELECT {pk} FROM {}{}",
            self.table_ref(spec, model, &build.graph.root_alias),
            build.render_joins(&used)
        );
        let parts = clauses
            .iter()
            .map(|c| build.compile_q(c, params))
            .collect::<OrmResult<Vec<_>>>()?;
        inner.push_str(" WHERE ");
        inner.push_str(&parts.join(" AND "));
        if self.backend == DatabaseBackendType::MySQL {
            // MySQL cannot read the table being modified in a subquery
            // unless it is materialized first.
            inner = format!("SELECT * FROM ({inner}) AS {}", self.q("_sub"));
        }
        Ok(Some(format!("{pk} IN ({inner})")))
    }

    fn render(
        &self,
        spec: &QuerySpec,
        model: &Arc<ModelMeta>,
        projection: &Projection,
        params: &mut Params,
    ) -> OrmResult<(String, RowLayout, BTreeMap<String, TableEntry>)> {
        if spec.lock.is_some() && spec.combined.is_some() {
            return Err(OrmError::QuerySetError(
                "Row locking is not allowed on a combined query".to_string(),
            ));
        }
        let mut build = Build::new(self, spec, model);
        let mut main = BTreeSet::new();

        // Projection.
        let mut select: Vec<(String, String)> = Vec::new();
        let root_alias = build.graph.root_alias.clone();
        let mut layout = RowLayout {
            root: ModelSlot {
                model: Arc::clone(model),
                fields: Vec::new(),
                pk: Vec::new(),
                deferred: Vec::new(),
            },
            joined: Vec::new(),
            keys: Vec::new(),
            key_types: Vec::new(),
            extras: Vec::new(),
            values: Vec::new(),
            labels: Vec::new(),
        };
        let related = build.select_related_paths()?;
        build.check_only_defer(&related)?;
        match projection {
            Projection::Full | Projection::RootOnly => {
                layout.root = build.model_slot(model, &root_alias, "", &mut select);
                if *projection == Projection::Full {
                    for hops in &related {
                        let (alias, used) = build.graph.walk(self.registry, hops, false)?;
                        main.extend(used);
                        let hop = &hops[hops.len() - 1];
                        let path = hops.iter().map(|h| h.field.as_str()).collect::<Vec<_>>().join(LOOKUP_SEP);
                        let parent = hops[..hops.len() - 1]
                            .iter()
                            .map(|h| h.field.as_str())
                            .collect::<Vec<_>>()
                            .join(LOOKUP_SEP);
                        let slot = build.model_slot(&hop.to, &alias, &path, &mut select);
                        layout.joined.push(JoinedSlot {
                            path,
                            parent,
                            field: hop.field.clone(),
                            many: hop.relation.is_many(),
                            slot,
                        });
                    }
                }
                for extra in &spec.extra {
                    let sql = match &extra.expr {
                        ExtraExpr::Path(path) => {
                            let resolved = build.resolve(path, false)?;
                            main.extend(resolved.transitions);
                            match resolved.columns.as_slice() {
                                [(col, _)] => col.clone(),
                                _ => {
                                    return Err(OrmError::QuerySetError(format!(
                                        "Extra column '{}' must resolve to a single column",
                                        extra.label
                                    )))
                                }
                            }
                        }
                        ExtraExpr::Raw(raw) => format!("({raw})"),
                        ExtraExpr::Inherited => self.qualify(&root_alias, &extra.label),
                    };
                    layout.extras.push((extra.label.clone(), select.len()));
                    select.push((sql, extra.label.clone()));
                }
                if *projection == Projection::Full {
                    if let Some(key_path) = &spec.key_path {
                        let resolved = build.resolve(key_path, false)?;
                        main.extend(resolved.transitions);
                        for (i, (col, ty)) in resolved.columns.into_iter().enumerate() {
                            layout.keys.push(select.len());
                            layout.key_types.push(ty);
                            select.push((col, format!("__key_{i}")));
                        }
                    }
                }
            }
            Projection::RootPk { .. } => {
                for pk in model.pk_fields() {
                    for (col, _) in typed_columns(pk) {
                        layout.root.pk.push(select.len());
                        select.push((self.qualify(&root_alias, &col), col));
                    }
                }
            }
            Projection::Values(paths) => {
                for path in paths {
                    let resolved = build.resolve(path, false)?;
                    main.extend(resolved.transitions);
                    let mut column = ValueColumn {
                        label: path.clone(),
                        indexes: Vec::new(),
                        types: Vec::new(),
                    };
                    let multi = resolved.columns.len() > 1;
                    for (i, (col, ty)) in resolved.columns.into_iter().enumerate() {
                        column.indexes.push(select.len());
                        column.types.push(ty);
                        let label = if multi { format!("{path}__{i}") } else { path.clone() };
                        select.push((col, label));
                    }
                    layout.values.push(column);
                }
            }
        }
        // Select-related joins stay in count/exists queries so the row set
        // is the same one being counted.
        if matches!(projection, Projection::RootPk { .. }) {
            for hops in &related {
                let (_, used) = build.graph.walk(self.registry, hops, false)?;
                main.extend(used);
            }
        }

        // Ordering, grouping and DISTINCT ON need their joins in the main query.
        let mut order_terms = Vec::new();
        for term in &spec.order_by {
            let (path, desc) = match term.strip_prefix('-') {
                Some(p) => (p, true),
                None => (term.as_str(), false),
            };
            let resolved = build.resolve(path, false)?;
            main.extend(resolved.transitions);
            for (col, _) in resolved.columns {
                order_terms.push(if desc { format!("{col} DESC") } else { format!("{col} ASC") });
            }
        }
        let mut group_terms = Vec::new();
        for path in &spec.group_by {
            let resolved = build.resolve(path, false)?;
            main.extend(resolved.transitions);
            group_terms.extend(resolved.columns.into_iter().map(|(c, _)| c));
        }
        let distinct_sql = match (&spec.distinct, projection) {
            (Distinct::On(paths), _) => {
                if !self.backend.supports_distinct_on() {
                    return Err(OrmError::QuerySetError(
                        "DISTINCT ON fields is not supported by this database backend".to_string(),
                    ));
                }
                let mut cols = Vec::new();
                for path in paths {
                    let resolved = build.resolve(path, false)?;
                    main.extend(resolved.transitions);
                    cols.extend(resolved.columns.into_iter().map(|(c, _)| c));
                }
                format!("DISTINCT ON ({}) ", cols.join(", "))
            }
            (Distinct::All, _) | (_, Projection::RootPk { distinct: true }) => "DISTINCT ".to_string(),
            _ => String::new(),
        };

        // Decide, per clause, whether the filter can join in place.
        let clauses = build.where_clauses();
        let combined_source = spec.combined.is_some();
        let projected = build.graph.closure(&main);
        let mut semi = Vec::with_capacity(clauses.len());
        for clause in &clauses {
            let used = build.clause_transitions(clause)?;
            let fans_out = build
                .graph
                .closure(&used)
                .iter()
                .any(|t| build.graph.transitions[*t].many && !projected.contains(t));
            if fans_out && !combined_source {
                semi.push(Some(used));
            } else {
                main.extend(used);
                semi.push(None);
            }
        }

        // A to-many join repeats root rows, so LIMIT/OFFSET would count
        // joined rows. Slice the root keys in a subquery instead.
        let slice_roots = spec.is_sliced()
            && !combined_source
            && matches!(projection, Projection::Full | Projection::RootOnly)
            && build
                .graph
                .closure(&main)
                .iter()
                .any(|t| build.graph.transitions[*t].many);

        // Render in text order so placeholders line up with parameters.
        let mut sql = format!(
            "SELECT {distinct_sql}{}",
            select
                .iter()
                .map(|(expr, label)| format!("{expr} AS {}", self.q(label)))
                .collect::<Vec<_>>()
                .join(", ")
        );
        sql.push_str(" FROM ");
        match &spec.combined {
            Some(combined) => sql.push_str(&self.render_combined(combined, model, params)?),
            None => sql.push_str(&self.table_ref(spec, model, &root_alias)),
        }
        sql.push_str(&build.render_joins(&main));

        let mut where_parts = Vec::new();
        if spec.empty {
            where_parts.push("1 = 0".to_string());
        }
        for (clause, semi_used) in clauses.iter().zip(semi) {
            let compiled = build.compile_q(clause, params)?;
            where_parts.push(match semi_used {
                None => compiled,
                Some(used) => {
                    let pk = build.root_pk_tuple();
                    format!(
                        "{pk} IN (SELECT {pk} FROM {}{} WHERE {compiled})",
                        self.table_ref(spec, model, &root_alias),
                        build.render_joins(&used)
                    )
                }
            });
        }
        if slice_roots {
            where_parts.push(self.root_slice(spec, model, &build.root_pk_tuple(), params)?);
        }
        if !where_parts.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_parts.join(" AND "));
        }
        if !group_terms.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_terms.join(", "));
        }
        if !order_terms.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_terms.join(", "));
        }
        if !slice_roots {
            sql.push_str(&self.render_limit(spec));
        }
        sql.push_str(&build.render_lock(&main)?);

        layout.labels = select.into_iter().map(|(_, label)| label).collect();
        Ok((sql, layout, build.graph.tables))
    }

    /// `root_pk IN (...)` over the primary keys of the sliced root rows,
    /// in the query's own filtering and ordering.
    fn root_slice(
        &self,
        spec: &QuerySpec,
        model: &Arc<ModelMeta>,
        pk: &str,
        params: &mut Params,
    ) -> OrmResult<String> {
        let mut inner_spec = spec.clone();
        inner_spec.select_related.clear();
        inner_spec.prefetch.clear();
        inner_spec.only.clear();
        inner_spec.defer.clear();
        inner_spec.extra.clear();
        inner_spec.key_path = None;
        inner_spec.embed_parent = None;
        inner_spec.lock = None;
        let (inner, _, _) = self.render(
            &inner_spec,
            model,
            &Projection::RootPk { distinct: false },
            params,
        )?;
        // The derived table lets MySQL take a LIMIT inside IN.
        let cols: Vec<String> = model
            .pk_columns()
            .iter()
            .map(|c| self.qualify("_s", c))
            .collect();
        Ok(format!(
            "{pk} IN (SELECT {} FROM ({inner}) AS {})",
            cols.join(", "),
            self.q("_s")
        ))
    }

    fn render_combined(
        &self,
        combined: &Combined,
        model: &Arc<ModelMeta>,
        params: &mut Params,
    ) -> OrmResult<String> {
        if combined.all
            && combined.op != SetOp::Union
            && !self.backend.supports_intersect_except_all()
        {
            return Err(OrmError::QuerySetError(format!(
                "{} ALL is not supported by this database backend",
                combined.op.as_sql()
            )));
        }
        let (left, _, _) = self.render(&combined.left, model, &Projection::RootOnly, params)?;
        let (right, _, _) = self.render(&combined.right, model, &Projection::RootOnly, params)?;
        let all = if combined.all { " ALL" } else { "" };
        Ok(format!(
            "(SELECT * FROM ({left}) AS {} {}{all} SELECT * FROM ({right}) AS {}) AS {}",
            self.q("_l"),
            combined.op.as_sql(),
            self.q("_r"),
            self.q(&model.table)
        ))
    }

    fn render_limit(&self, spec: &QuerySpec) -> String {
        match (spec.limit, spec.offset) {
            (None, None) => String::new(),
            (Some(limit), None) => format!(" LIMIT {limit}"),
            (Some(limit), Some(offset)) => format!(" LIMIT {limit} OFFSET {offset}"),
            (None, Some(offset)) => match self.backend {
                DatabaseBackendType::PostgreSQL => format!(" OFFSET {offset}"),
                DatabaseBackendType::SQLite => format!(" LIMIT -1 OFFSET {offset}"),
                DatabaseBackendType::MySQL => format!(" LIMIT {} OFFSET {offset}", u64::MAX),
            },
        }
    }
}

impl<'c, 'a> Build<'c, 'a> {
    fn new(compiler: &'c Compiler<'a>, spec: &'c QuerySpec, root: &Arc<ModelMeta>) -> Self {
        Self {
            compiler,
            spec,
            root: Arc::clone(root),
            graph: JoinGraph::new(root),
        }
    }

    fn resolve(&mut self, path: &str, traverse_last: bool) -> OrmResult<Resolved> {
        let registry = self.compiler.registry;
        let crawl = crawl_relationship(registry, &self.root, path, traverse_last)?;
        if crawl.crosses_database() {
            return Err(OrmError::QuerySetError(format!(
                "'{path}' crosses a database boundary and cannot be joined"
            )));
        }
        let is_target_pk = crawl.field_name == PK || crawl.field_name == pk_name(&crawl.model);
        let shortcut = is_target_pk
            && crawl.hops.last().is_some_and(|h| {
                matches!(
                    h.relation,
                    Relation::Forward { .. } | Relation::ManyToMany { .. }
                )
            });
        let (alias, transitions) = self.graph.walk(registry, &crawl.hops, shortcut)?;
        let columns: Vec<(String, FieldType)> = if shortcut {
            // The key columns before the target already hold its pk.
            let pairs = match &crawl.hops[crawl.hops.len() - 1].relation {
                Relation::ManyToMany { to_columns, .. } => to_columns,
                Relation::Forward { columns, .. } | Relation::Reverse { columns, .. } => columns,
            };
            pairs
                .iter()
                .map(|p| (p.local.clone(), p.value_type.clone()))
                .collect()
        } else if crawl.field_name == PK {
            crawl
                .model
                .pk_fields()
                .into_iter()
                .flat_map(typed_columns)
                .collect()
        } else {
            let field = crawl.model.field_or_err(&crawl.field_name)?;
            let cols = typed_columns(field);
            if cols.is_empty() {
                return Err(OrmError::QuerySetError(format!(
                    "'{path}' does not name a stored column"
                )));
            }
            cols
        };
        Ok(Resolved {
            columns: columns
                .into_iter()
                .map(|(c, t)| (self.compiler.qualify(&alias, &c), t))
                .collect(),
            transitions,
            operator: crawl.operator,
        })
    }

    /// Validated `select_related` paths, expanded to every prefix, as hop lists.
    fn select_related_paths(&self) -> OrmResult<Vec<Vec<Hop>>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for path in &self.spec.select_related {
            let crawl = crawl_relationship(self.compiler.registry, &self.root, path, true)?;
            let segments = path.split(LOOKUP_SEP).count();
            if crawl.crosses_database() || crawl.hops.len() != segments {
                return Err(OrmError::QuerySetError(format!(
                    "Invalid field name given in select_related: '{path}'"
                )));
            }
            for depth in 1..=crawl.hops.len() {
                let prefix: Vec<&str> = crawl.hops[..depth].iter().map(|h| h.field.as_str()).collect();
                if seen.insert(prefix.join(LOOKUP_SEP)) {
                    out.push(crawl.hops[..depth].to_vec());
                }
            }
        }
        Ok(out)
    }

    fn check_only_defer(&self, related: &[Vec<Hop>]) -> OrmResult<()> {
        let prefixes: BTreeSet<String> = related
            .iter()
            .map(|hops| hops.iter().map(|h| h.field.as_str()).collect::<Vec<_>>().join(LOOKUP_SEP))
            .collect();
        for name in self.spec.only.iter().chain(&self.spec.defer) {
            let (prefix, field) = name.rsplit_once(LOOKUP_SEP).unwrap_or(("", name));
            let model = if prefix.is_empty() {
                Arc::clone(&self.root)
            } else if prefixes.contains(prefix) {
                let crawl = crawl_relationship(self.compiler.registry, &self.root, prefix, true)?;
                crawl.model
            } else {
                return Err(OrmError::QuerySetError(format!(
                    "'{name}' refers to '{prefix}', which is not selected with select_related"
                )));
            };
            let ok = field == PK || model.field(field).is_some_and(FieldDef::is_concrete);
            if !ok {
                return Err(OrmError::QuerySetError(format!(
                    "{} has no concrete field named '{field}'",
                    model.name
                )));
            }
        }
        Ok(())
    }

    fn model_slot(
        &self,
        model: &Arc<ModelMeta>,
        alias: &str,
        prefix: &str,
        select: &mut Vec<(String, String)>,
    ) -> ModelSlot {
        let only = scoped(&self.spec.only, prefix);
        let defer = scoped(&self.spec.defer, prefix);
        let mut slot = ModelSlot {
            model: Arc::clone(model),
            fields: Vec::new(),
            pk: Vec::new(),
            deferred: Vec::new(),
        };
        for field in model.concrete_fields() {
            let wanted = (only.is_empty() || only.contains(&field.name.as_str()))
                && !defer.contains(&field.name.as_str())
                && !(self.spec.exclude_secrets && field.secret);
            // A forward prefetch reads its keys from the root row.
            let prefetched = prefix.is_empty()
                && self
                    .spec
                    .prefetch
                    .iter()
                    .any(|p| p.related_name.split(LOOKUP_SEP).next() == Some(field.name.as_str()));
            if !field.primary_key && !wanted && !prefetched {
                slot.deferred.push(field.name.clone());
                continue;
            }
            let mut indexes = Vec::new();
            for (col, _) in typed_columns(field) {
                let label = if prefix.is_empty() {
                    col.clone()
                } else {
                    format!("{prefix}{LOOKUP_SEP}{col}")
                };
                indexes.push(select.len());
                select.push((self.compiler.qualify(alias, &col), label));
            }
            if field.primary_key {
                slot.pk.extend(indexes.iter().copied());
            }
            slot.fields.push(SlotField {
                name: field.name.clone(),
                indexes,
            });
        }
        slot
    }

    /// AND-ed filter clauses plus the OR group as one clause.
    fn where_clauses(&self) -> Vec<Q> {
        let mut clauses = self.spec.filters.clone();
        if !self.spec.or_clauses.is_empty() {
            clauses.push(Q::Or(self.spec.or_clauses.clone()));
        }
        clauses
    }

    fn clause_transitions(&mut self, clause: &Q) -> OrmResult<BTreeSet<usize>> {
        let mut used = BTreeSet::new();
        for (path, _) in clause.leaves() {
            used.extend(self.resolve(path, false)?.transitions);
        }
        Ok(used)
    }

    fn compile_q(&mut self, q: &Q, params: &mut Params) -> OrmResult<String> {
        Ok(match q {
            Q::Filter { path, value } => {
                let resolved = self.resolve(path, false)?;
                let columns: Vec<String> = resolved.columns.into_iter().map(|(c, _)| c).collect();
                self.compiler
                    .operators
                    .compile_composite(&resolved.operator, &columns, value, params)?
            }
            Q::And(children) => {
                if children.is_empty() {
                    return Ok("1 = 1".to_string());
                }
                let parts = children
                    .iter()
                    .map(|c| self.compile_q(c, params))
                    .collect::<OrmResult<Vec<_>>>()?;
                format!("({})", parts.join(" AND "))
            }
            Q::Or(children) => {
                if children.is_empty() {
                    return Ok("1 = 0".to_string());
                }
                let parts = children
                    .iter()
                    .map(|c| self.compile_q(c, params))
                    .collect::<OrmResult<Vec<_>>>()?;
                format!("({})", parts.join(" OR "))
            }
            Q::Not(inner) => format!("NOT ({})", self.compile_q(inner, params)?),
        })
    }

    fn root_pk_tuple(&self) -> String {
        let cols: Vec<String> = self
            .root
            .pk_columns()
            .iter()
            .map(|c| self.compiler.qualify(&self.graph.root_alias, c))
            .collect();
        match cols.as_slice() {
            [single] => single.clone(),
            _ => format!("({})", cols.join(", ")),
        }
    }

    /// Renders the joins for `set` and their predecessors, predecessor first.
    fn render_joins(&self, set: &BTreeSet<usize>) -> String {
        let needed = self.graph.closure(set);
        let mut emitted = BTreeSet::new();
        let mut sql = String::new();
        for &idx in &needed {
            self.emit_join(idx, &mut emitted, &mut sql);
        }
        sql
    }

    fn emit_join(&self, idx: usize, emitted: &mut BTreeSet<usize>, sql: &mut String) {
        if emitted.contains(&idx) {
            return;
        }
        let t = &self.graph.transitions[idx];
        if let Some(pred) = t.predecessor {
            self.emit_join(pred, emitted, sql);
        }
        emitted.insert(idx);
        let on: Vec<String> = t
            .on
            .iter()
            .map(|(from, to)| {
                format!(
                    "{} = {}",
                    self.compiler.qualify(&t.from_alias, from),
                    self.compiler.qualify(&t.alias, to)
                )
            })
            .collect();
        sql.push_str(&format!(
            " LEFT OUTER JOIN {} ON ({})",
            self.compiler.table_ref(self.spec, &t.model, &t.alias),
            on.join(" AND ")
        ));
    }

    fn render_lock(&self, main: &BTreeSet<usize>) -> OrmResult<String> {
        let Some(lock) = &self.spec.lock else {
            return Ok(String::new());
        };
        let backend = self.compiler.backend;
        if lock.wait != LockWait::Wait && !backend.supports_lock_wait_options() {
            return Err(OrmError::QuerySetError(
                "NOWAIT and SKIP LOCKED are not supported by this database backend".to_string(),
            ));
        }
        if !lock.of.is_empty() && !backend.supports_lock_of() {
            return Err(OrmError::QuerySetError(
                "select_for_update(of=...) is not supported by this database backend".to_string(),
            ));
        }
        if !backend.supports_row_locking() {
            tracing::debug!("relorm.lock_ignored: backend has no row locking");
            return Ok(String::new());
        }
        let mut sql = match lock.strength {
            LockStrength::Update => " FOR UPDATE".to_string(),
            LockStrength::Share => " FOR SHARE".to_string(),
        };
        if !lock.of.is_empty() {
            let joined = self.graph.closure(main);
            let mut aliases = Vec::new();
            for path in &lock.of {
                if path == "self" {
                    aliases.push(self.compiler.q(&self.graph.root_alias));
                    continue;
                }
                let entry = self.graph.tables.get(path.as_str()).filter(|entry| {
                    joined
                        .iter()
                        .any(|t| self.graph.transitions[*t].alias == entry.alias)
                });
                match entry {
                    Some(entry) => aliases.push(self.compiler.q(&entry.alias)),
                    None => {
                        return Err(OrmError::QuerySetError(format!(
                            "Invalid field name given in select_for_update(of=...): '{path}'"
                        )))
                    }
                }
            }
            sql.push_str(&format!(" OF {}", aliases.join(", ")));
        }
        match lock.wait {
            LockWait::Wait => {}
            LockWait::NoWait => sql.push_str(" NOWAIT"),
            LockWait::SkipLocked => sql.push_str(" SKIP LOCKED"),
        }
        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelBuilder;
    use crate::query::spec::{Combined, ExtraColumn, Prefetch, RowLock};
    use crate::registry::ModelRegistry;

    fn registry() -> Arc<Registry> {
        let mut reg = ModelRegistry::new();
        for meta in [
            ModelBuilder::new("User")
                .table("users")
                .field(FieldDef::new("name", FieldType::CharField))
                .field(FieldDef::new("password", FieldType::CharField).secret())
                .build(),
            ModelBuilder::new("Post")
                .field(FieldDef::new("title", FieldType::CharField))
                .field(FieldDef::foreign_key("author", "User").related_name("posts"))
                .field(FieldDef::many_to_many("tags", "Tag").related_name("posts"))
                .build(),
            ModelBuilder::new("Tag")
                .field(FieldDef::new("label", FieldType::CharField))
                .build(),
            ModelBuilder::new("Seat")
                .field(FieldDef::new("row", FieldType::CharField).primary_key())
                .field(FieldDef::new("number", FieldType::IntegerField).primary_key())
                .build(),
        ] {
            reg.register(meta.unwrap()).unwrap();
        }
        reg.freeze().unwrap()
    }

    fn compile_with(
        backend: DatabaseBackendType,
        model: &str,
        spec: &QuerySpec,
    ) -> OrmResult<CompiledQuery> {
        let reg = registry();
        let ops = OperatorTable::with_defaults();
        let compiler = Compiler::new(&reg, &ops, backend, None);
        compiler.build_select(spec, reg.get(model).unwrap())
    }

    fn compile(model: &str, spec: &QuerySpec) -> CompiledQuery {
        compile_with(DatabaseBackendType::SQLite, model, spec).unwrap()
    }

    // ── Projection ─────────────────────────────────────────────────────

    #[test]
    fn test_plain_select() {
        let q = compile("Post", &QuerySpec::default());
        assert_eq!(
            q.sql,
            "SELECT \"post\".\"id\" AS \"id\", \"post\".\"title\" AS \"title\", \
             \"post\".\"author_id\" AS \"author_id\" FROM \"post\""
        );
        assert!(q.params.is_empty());
        assert_eq!(q.layout.root.pk, vec![0]);
        assert_eq!(q.tables.len(), 1);
        assert_eq!(q.tables[""].alias, "post");
    }

    #[test]
    fn test_only_and_defer() {
        let spec = QuerySpec {
            only: vec!["title".into()],
            ..QuerySpec::default()
        };
        let q = compile("Post", &spec);
        assert_eq!(q.layout.labels, vec!["id", "title"]);
        assert_eq!(q.layout.root.deferred, vec!["author"]);

        let spec = QuerySpec {
            defer: vec!["title".into()],
            ..QuerySpec::default()
        };
        let q = compile("Post", &spec);
        assert_eq!(q.layout.labels, vec!["id", "author_id"]);
    }

    #[test]
    fn test_only_keeps_forward_prefetch_key() {
        let spec = QuerySpec {
            only: vec!["title".into()],
            prefetch: vec![Prefetch::new("author__posts")],
            ..QuerySpec::default()
        };
        let q = compile("Post", &spec);
        assert_eq!(q.layout.labels, vec!["id", "title", "author_id"]);
        assert!(q.layout.root.deferred.is_empty());

        let spec = QuerySpec {
            defer: vec!["author".into()],
            prefetch: vec![Prefetch::new("tags")],
            ..QuerySpec::default()
        };
        assert_eq!(compile("Post", &spec).layout.root.deferred, vec!["author"]);
    }

    #[test]
    fn test_exclude_secrets() {
        let spec = QuerySpec {
            exclude_secrets: true,
            ..QuerySpec::default()
        };
        let q = compile("User", &spec);
        assert_eq!(q.layout.labels, vec!["id", "name"]);
        assert_eq!(q.layout.root.deferred, vec!["password"]);
    }

    #[test]
    fn test_select_related_join_and_labels() {
        let spec = QuerySpec {
            select_related: vec!["author".into()],
            only: vec!["title".into(), "author__name".into()],
            ..QuerySpec::default()
        };
        let q = compile("Post", &spec);
        assert!(q.sql.contains(
            "FROM \"post\" LEFT OUTER JOIN \"users\" AS \"j_author\" \
             ON (\"post\".\"author_id\" = \"j_author\".\"id\")"
        ));
        assert_eq!(q.layout.labels, vec!["id", "title", "author__id", "author__name"]);
        assert_eq!(q.layout.joined.len(), 1);
        assert_eq!(q.layout.joined[0].field, "author");
        assert!(!q.layout.joined[0].many);
        assert_eq!(q.tables["author"].alias, "j_author");
    }

    #[test]
    fn test_only_on_unselected_relation_is_error() {
        let spec = QuerySpec {
            only: vec!["author__name".into()],
            ..QuerySpec::default()
        };
        let err = compile_with(DatabaseBackendType::SQLite, "Post", &spec).unwrap_err();
        assert!(matches!(err, OrmError::QuerySetError(_)));
    }

    #[test]
    fn test_select_related_rejects_plain_field() {
        let spec = QuerySpec {
            select_related: vec!["title".into()],
            ..QuerySpec::default()
        };
        assert!(compile_with(DatabaseBackendType::SQLite, "Post", &spec).is_err());
    }

    // ── Joins ──────────────────────────────────────────────────────────

    #[test]
    fn test_same_relation_joined_once() {
        let spec = QuerySpec {
            select_related: vec!["author".into()],
            filters: vec![Q::kw("author__name", "ann"), Q::kw("author__pk__gt", 0)],
            order_by: vec!["author__name".into()],
            ..QuerySpec::default()
        };
        let q = compile("Post", &spec);
        assert_eq!(q.sql.matches("LEFT OUTER JOIN").count(), 1);
        assert!(q.sql.contains("WHERE \"j_author\".\"name\" = ? AND \"post\".\"author_id\" > ?"));
        assert!(q.sql.ends_with("ORDER BY \"j_author\".\"name\" ASC"));
        assert_eq!(q.params, vec![Value::from("ann"), Value::Int(0)]);
    }

    #[test]
    fn test_filter_on_fk_pk_needs_no_join() {
        let spec = QuerySpec {
            filters: vec![Q::kw("author__id", 3)],
            ..QuerySpec::default()
        };
        let q = compile("Post", &spec);
        assert!(!q.sql.contains("JOIN"));
        assert!(q.sql.ends_with("WHERE \"post\".\"author_id\" = ?"));
    }

    #[test]
    fn test_to_one_filter_joins_in_place() {
        let spec = QuerySpec {
            filters: vec![Q::kw("author__name__startswith", "A")],
            ..QuerySpec::default()
        };
        let q = compile("Post", &spec);
        assert!(q.sql.contains("LEFT OUTER JOIN \"users\" AS \"j_author\""));
        assert!(q.sql.contains("WHERE \"j_author\".\"name\" LIKE ? ESCAPE '\\'"));
        assert_eq!(q.params, vec![Value::from("A%")]);
    }

    #[test]
    fn test_to_many_filter_becomes_semi_join() {
        let spec = QuerySpec {
            filters: vec![Q::kw("posts__title", "x")],
            ..QuerySpec::default()
        };
        let q = compile("User", &spec);
        assert_eq!(
            q.sql,
            "SELECT \"users\".\"id\" AS \"id\", \"users\".\"name\" AS \"name\", \
             \"users\".\"password\" AS \"password\" FROM \"users\" \
             WHERE \"users\".\"id\" IN (SELECT \"users\".\"id\" FROM \"users\" \
             LEFT OUTER JOIN \"post\" AS \"j_posts\" ON (\"users\".\"id\" = \"j_posts\".\"author_id\") \
             WHERE \"j_posts\".\"title\" = ?)"
        );
    }

    #[test]
    fn test_many_to_many_filter_uses_association_table() {
        let spec = QuerySpec {
            filters: vec![Q::kw("posts__in", Value::List(vec![1.into(), 2.into()]))],
            key_path: Some("posts".into()),
            ..QuerySpec::default()
        };
        let q = compile("Tag", &spec);
        assert_eq!(q.sql.matches("LEFT OUTER JOIN").count(), 1);
        assert!(q.sql.contains(
            "LEFT OUTER JOIN \"post_tags\" AS \"t_posts\" ON (\"tag\".\"id\" = \"t_posts\".\"tag_id\")"
        ));
        assert!(q.sql.contains("\"t_posts\".\"post_id\" AS \"__key_0\""));
        assert!(q.sql.ends_with("WHERE \"t_posts\".\"post_id\" IN (?, ?)"));
        assert_eq!(q.layout.keys, vec![2]);
    }

    #[test]
    fn test_or_clauses_and_local_or() {
        let spec = QuerySpec {
            filters: vec![Q::kw("title", "a"), Q::kw("id", 1) | Q::kw("id", 2)],
            or_clauses: vec![Q::kw("title", "b"), Q::kw("title", "c")],
            ..QuerySpec::default()
        };
        let q = compile("Post", &spec);
        assert!(q.sql.ends_with(
            "WHERE \"post\".\"title\" = ? AND (\"post\".\"id\" = ? OR \"post\".\"id\" = ?) \
             AND (\"post\".\"title\" = ? OR \"post\".\"title\" = ?)"
        ));
        assert_eq!(q.params.len(), 5);
    }

    #[test]
    fn test_unknown_operator_is_build_error() {
        let spec = QuerySpec {
            filters: vec![Q::kw("title__regex", "x")],
            ..QuerySpec::default()
        };
        let err = compile_with(DatabaseBackendType::SQLite, "Post", &spec).unwrap_err();
        assert!(matches!(err, OrmError::QuerySetError(_)));
    }

    #[test]
    fn test_postgres_placeholders_follow_text_order() {
        let spec = QuerySpec {
            filters: vec![Q::kw("name", "a"), Q::kw("posts__title", "b")],
            ..QuerySpec::default()
        };
        let q = compile_with(DatabaseBackendType::PostgreSQL, "User", &spec).unwrap();
        assert!(q.sql.contains("\"users\".\"name\" = $1"));
        assert!(q.sql.contains("\"j_posts\".\"title\" = $2"));
        assert_eq!(q.params, vec![Value::from("a"), Value::from("b")]);
    }

    // ── Ordering, limits, distinct, locking ───────────────────────────

    #[test]
    fn test_limit_offset_per_backend() {
        let spec = QuerySpec {
            offset: Some(5),
            ..QuerySpec::default()
        };
        assert!(compile("Post", &spec).sql.ends_with("LIMIT -1 OFFSET 5"));
        let pg = compile_with(DatabaseBackendType::PostgreSQL, "Post", &spec).unwrap();
        assert!(pg.sql.ends_with(" OFFSET 5"));
        let spec = QuerySpec {
            limit: Some(2),
            offset: Some(4),
            order_by: vec!["-id".into()],
            ..QuerySpec::default()
        };
        assert!(compile("Post", &spec)
            .sql
            .ends_with("ORDER BY \"post\".\"id\" DESC LIMIT 2 OFFSET 4"));
    }

    #[test]
    fn test_distinct_on_requires_postgres() {
        let spec = QuerySpec {
            distinct: Distinct::On(vec!["author".into()]),
            ..QuerySpec::default()
        };
        assert!(compile_with(DatabaseBackendType::SQLite, "Post", &spec).is_err());
        let pg = compile_with(DatabaseBackendType::PostgreSQL, "Post", &spec).unwrap();
        assert!(pg.sql.starts_with("SELECT DISTINCT ON (\"post\".\"author_id\") "));
    }

    #[test]
    fn test_row_locking() {
        let spec = QuerySpec {
            select_related: vec!["author".into()],
            lock: Some(RowLock {
                wait: LockWait::SkipLocked,
                of: vec!["self".into(), "author".into()],
                ..RowLock::default()
            }),
            ..QuerySpec::default()
        };
        let pg = compile_with(DatabaseBackendType::PostgreSQL, "Post", &spec).unwrap();
        assert!(pg.sql.ends_with(" FOR UPDATE OF \"post\", \"j_author\" SKIP LOCKED"));
        let my = compile_with(DatabaseBackendType::MySQL, "Post", &spec).unwrap();
        assert!(my.sql.ends_with(" FOR UPDATE OF `post`, `j_author` SKIP LOCKED"));

        let plain = QuerySpec {
            lock: Some(RowLock::default()),
            ..QuerySpec::default()
        };
        assert!(!compile("Post", &plain).sql.contains("FOR UPDATE"));

        let bad = QuerySpec {
            lock: Some(RowLock {
                of: vec!["author".into()],
                ..RowLock::default()
            }),
            ..QuerySpec::default()
        };
        assert!(compile_with(DatabaseBackendType::PostgreSQL, "Post", &bad).is_err());
    }

    #[test]
    fn test_lock_options_need_backend_support() {
        let skip = QuerySpec {
            lock: Some(RowLock {
                wait: LockWait::NoWait,
                ..RowLock::default()
            }),
            ..QuerySpec::default()
        };
        let err = compile_with(DatabaseBackendType::SQLite, "Post", &skip).unwrap_err();
        assert!(err.to_string().contains("NOWAIT"));
        assert!(compile_with(DatabaseBackendType::PostgreSQL, "Post", &skip)
            .unwrap()
            .sql
            .ends_with(" FOR UPDATE NOWAIT"));

        let of = QuerySpec {
            lock: Some(RowLock {
                of: vec!["self".into()],
                ..RowLock::default()
            }),
            ..QuerySpec::default()
        };
        let err = compile_with(DatabaseBackendType::SQLite, "Post", &of).unwrap_err();
        assert!(matches!(err, OrmError::QuerySetError(_)));
    }

    // ── Slicing ────────────────────────────────────────────────────────

    #[test]
    fn test_slice_with_to_many_join_limits_roots() {
        let spec = QuerySpec {
            select_related: vec!["posts".into()],
            filters: vec![Q::kw("name__startswith", "a")],
            order_by: vec!["id".into()],
            limit: Some(2),
            offset: Some(1),
            ..QuerySpec::default()
        };
        let q = compile("User", &spec);
        assert!(q.sql.contains(" LEFT OUTER JOIN \"post\" AS \"j_posts\""));
        assert!(q.sql.contains(
            "AND \"users\".\"id\" IN (SELECT \"_s\".\"id\" FROM \
             (SELECT \"users\".\"id\" AS \"id\" FROM \"users\" WHERE"
        ));
        assert!(q.sql.contains("ORDER BY \"users\".\"id\" ASC LIMIT 2 OFFSET 1) AS \"_s\")"));
        assert!(q.sql.ends_with("ORDER BY \"users\".\"id\" ASC"));
        assert_eq!(q.params.len(), 2);

        // To-one joins cannot repeat roots, so the slice stays outside.
        let spec = QuerySpec {
            select_related: vec!["author".into()],
            limit: Some(2),
            ..QuerySpec::default()
        };
        let q = compile("Post", &spec);
        assert!(q.sql.ends_with(" LIMIT 2"));
        assert!(!q.sql.contains("\"_s\""));
    }

    #[test]
    fn test_count_distinct_with_to_many_join() {
        let reg = registry();
        let ops = OperatorTable::with_defaults();
        let compiler = Compiler::new(&reg, &ops, DatabaseBackendType::SQLite, None);
        let spec = QuerySpec {
            select_related: vec!["posts".into()],
            distinct: Distinct::All,
            ..QuerySpec::default()
        };
        let (sql, _) = compiler.build_count(&spec, reg.get("User").unwrap()).unwrap();
        assert!(sql.contains("(SELECT DISTINCT \"users\".\"id\" AS \"id\" FROM \"users\" LEFT OUTER JOIN"));
        assert!(!sql.contains("\"j_posts\".\"title\""));
    }

    // ── Set operations ────────────────────────────────────────────────

    fn union_spec(all: bool, op: SetOp) -> QuerySpec {
        QuerySpec {
            combined: Some(Box::new(Combined {
                op,
                all,
                left: QuerySpec {
                    filters: vec![Q::kw("title", "a")],
                    ..QuerySpec::default()
                },
                right: QuerySpec {
                    filters: vec![Q::kw("title", "b")],
                    ..QuerySpec::default()
                },
            })),
            filters: vec![Q::kw("id__gt", 0)],
            ..QuerySpec::default()
        }
    }

    #[test]
    fn test_union_as_subquery() {
        let q = compile_with(DatabaseBackendType::PostgreSQL, "Post", &union_spec(true, SetOp::Union)).unwrap();
        assert!(q.sql.contains(" FROM (SELECT * FROM (SELECT "));
        assert!(q.sql.contains("AS \"_l\" UNION ALL SELECT * FROM ("));
        assert!(q.sql.contains("\"post\".\"title\" = $1"));
        assert!(q.sql.contains("\"post\".\"title\" = $2"));
        assert!(q.sql.ends_with("AS \"post\" WHERE \"post\".\"id\" > $3"));
        assert_eq!(q.params.len(), 3);
    }

    #[test]
    fn test_intersect_all_unsupported_on_sqlite() {
        assert!(compile_with(DatabaseBackendType::SQLite, "Post", &union_spec(true, SetOp::Intersect)).is_err());
        assert!(compile_with(DatabaseBackendType::SQLite, "Post", &union_spec(false, SetOp::Intersect)).is_ok());
    }

    #[test]
    fn test_lock_on_combined_is_error() {
        let mut spec = union_spec(false, SetOp::Union);
        spec.lock = Some(RowLock::default());
        let err = compile_with(DatabaseBackendType::PostgreSQL, "Post", &spec).unwrap_err();
        assert!(err.to_string().contains("combined"));
    }

    // ── Extras, values, aggregates ────────────────────────────────────

    #[test]
    fn test_extra_columns() {
        let spec = QuerySpec {
            extra: vec![
                ExtraColumn {
                    label: "author_name".into(),
                    expr: ExtraExpr::Path("author__name".into()),
                },
                ExtraColumn {
                    label: "one".into(),
                    expr: ExtraExpr::Raw("1".into()),
                },
            ],
            ..QuerySpec::default()
        };
        let q = compile("Post", &spec);
        assert!(q.sql.contains("\"j_author\".\"name\" AS \"author_name\", (1) AS \"one\""));
        assert_eq!(q.layout.extras, vec![("author_name".to_string(), 3), ("one".to_string(), 4)]);
    }

    #[test]
    fn test_values_projection() {
        let reg = registry();
        let ops = OperatorTable::with_defaults();
        let compiler = Compiler::new(&reg, &ops, DatabaseBackendType::SQLite, None);
        let q = compiler
            .build_values(&QuerySpec::default(), reg.get("Post").unwrap(), &["title".into(), "author__name".into()])
            .unwrap();
        assert!(q.sql.starts_with("SELECT \"post\".\"title\" AS \"title\", \"j_author\".\"name\" AS \"author__name\""));
        assert_eq!(q.layout.values.len(), 2);
    }

    #[test]
    fn test_count_and_exists() {
        let reg = registry();
        let ops = OperatorTable::with_defaults();
        let compiler = Compiler::new(&reg, &ops, DatabaseBackendType::SQLite, None);
        let post = reg.get("Post").unwrap();

        let (sql, _) = compiler
            .build_count(&QuerySpec { order_by: vec!["title".into()], ..QuerySpec::default() }, post)
            .unwrap();
        assert_eq!(
            sql,
            "SELECT COUNT(*) AS \"__count\" FROM (SELECT \"post\".\"id\" AS \"id\" FROM \"post\") AS \"_count\""
        );

        let (sql, _) = compiler
            .build_count(&QuerySpec { or_clauses: vec![Q::kw("id", 1)], ..QuerySpec::default() }, post)
            .unwrap();
        assert!(sql.contains("(SELECT DISTINCT \"post\".\"id\" AS \"id\" FROM"));

        let (sql, params) = compiler
            .build_exists(&QuerySpec { filters: vec![Q::kw("title", "t")], ..QuerySpec::default() }, post)
            .unwrap();
        assert!(sql.starts_with("SELECT 1 AS \"__exists\" FROM (SELECT \"post\".\"id\""));
        assert!(sql.ends_with("AS \"_exists\" LIMIT 1"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_composite_pk_semi_join_uses_row_values() {
        let reg = registry();
        let ops = OperatorTable::with_defaults();
        let compiler = Compiler::new(&reg, &ops, DatabaseBackendType::SQLite, None);
        let seat = reg.get("Seat").unwrap();
        let spec = QuerySpec {
            filters: vec![Q::kw(
                "pk__in",
                Value::List(vec![Value::List(vec!["A".into(), 1.into()])]),
            )],
            ..QuerySpec::default()
        };
        let q = compiler.build_select(&spec, seat).unwrap();
        assert!(q.sql.ends_with("WHERE (\"seat\".\"row\", \"seat\".\"number\") IN (VALUES (?, ?))"));
    }

    // ── Writes ─────────────────────────────────────────────────────────

    #[test]
    fn test_insert_update_delete() {
        let reg = registry();
        let ops = OperatorTable::with_defaults();
        let compiler = Compiler::new(&reg, &ops, DatabaseBackendType::PostgreSQL, None);
        let post = reg.get("Post").unwrap();

        let (sql, params) = compiler
            .build_insert(
                &QuerySpec::default(),
                post,
                &["title".into(), "author_id".into()],
                &[vec!["a".into(), 1.into()], vec!["b".into(), 2.into()]],
            )
            .unwrap();
        assert_eq!(sql, "INSERT INTO \"post\" (\"title\", \"author_id\") VALUES ($1, $2), ($3, $4)");
        assert_eq!(params.len(), 4);

        let spec = QuerySpec {
            filters: vec![Q::kw("title", "a")],
            ..QuerySpec::default()
        };
        let (sql, params) = compiler
            .build_update(&spec, post, &[("title".into(), "z".into())])
            .unwrap();
        assert_eq!(sql, "UPDATE \"post\" SET \"title\" = $1 WHERE \"post\".\"title\" = $2");
        assert_eq!(params, vec![Value::from("z"), Value::from("a")]);

        let spec = QuerySpec {
            filters: vec![Q::kw("author__name", "ann")],
            ..QuerySpec::default()
        };
        let (sql, _) = compiler.build_delete(&spec, post).unwrap();
        assert_eq!(
            sql,
            "DELETE FROM \"post\" WHERE \"post\".\"id\" IN (SELECT \"post\".\"id\" FROM \"post\" \
             LEFT OUTER JOIN \"users\" AS \"j_author\" ON (\"post\".\"author_id\" = \"j_author\".\"id\") \
             WHERE \"j_author\".\"name\" = $1)"
        );

        let sliced = QuerySpec {
            limit: Some(1),
            ..QuerySpec::default()
        };
        assert!(compiler.build_delete(&sliced, post).is_err());
    }

    #[test]
    fn test_schema_qualification() {
        let reg = registry();
        let ops = OperatorTable::with_defaults();
        let compiler = Compiler::new(&reg, &ops, DatabaseBackendType::PostgreSQL, Some("tenant_a"));
        let spec = QuerySpec {
            select_related: vec!["author".into()],
            ..QuerySpec::default()
        };
        let q = compiler.build_select(&spec, reg.get("Post").unwrap()).unwrap();
        assert!(q.sql.contains("FROM \"tenant_a\".\"post\" AS \"post\""));
        assert!(q.sql.contains("JOIN \"tenant_a\".\"users\" AS \"j_author\""));

        let spec = QuerySpec {
            using_schema: Some("tenant_b".into()),
            ..QuerySpec::default()
        };
        let q = compiler.build_select(&spec, reg.get("Post").unwrap()).unwrap();
        assert!(q.sql.contains("FROM \"tenant_b\".\"post\" AS \"post\""));
    }
}
