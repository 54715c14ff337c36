//! The accumulated state of a query.
//!
//! A [`QuerySpec`] records everything the builder facade has been asked to
//! do: filters, requested joins, prefetches, ordering, projection, limits,
//! locking and schema/database overrides. It is a plain value; the facade
//! clones it for every chain step, so earlier queries never observe later
//! changes.

use super::lookups::Q;

/// How rows are de-duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Distinct {
    /// No `DISTINCT`.
    #[default]
    None,
    /// `SELECT DISTINCT`.
    All,
    /// `SELECT DISTINCT ON (paths)` (PostgreSQL only).
    On(Vec<String>),
}

/// A prefetch request.
#[derive(Debug, Clone)]
pub struct Prefetch {
    /// Relation path to follow (may be nested: `kids__toys`).
    pub related_name: String,
    /// Attribute the results are stored under (defaults to the last segment).
    pub to_attr: Option<String>,
    /// Custom query for the related objects.
    pub queryset: Option<QuerySpec>,
}

impl Prefetch {
    /// A plain prefetch of `related_name`.
    pub fn new(related_name: impl Into<String>) -> Self {
        Self {
            related_name: related_name.into(),
            to_attr: None,
            queryset: None,
        }
    }

    /// The attribute the results land in.
    pub fn attr(&self) -> &str {
        self.to_attr.as_deref().unwrap_or_else(|| {
            self.related_name
                .rsplit(super::crawler::LOOKUP_SEP)
                .next()
                .unwrap_or(&self.related_name)
        })
    }
}

/// Row-lock strength.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockStrength {
    /// `FOR UPDATE`.
    #[default]
    Update,
    /// `FOR SHARE`.
    Share,
}

/// What to do when a row is already locked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockWait {
    /// Block until the lock is available.
    #[default]
    Wait,
    /// `NOWAIT`.
    NoWait,
    /// `SKIP LOCKED`.
    SkipLocked,
}

/// Row-locking options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowLock {
    /// Lock strength.
    pub strength: LockStrength,
    /// Wait policy.
    pub wait: LockWait,
    /// Relation paths whose tables are locked (`"self"` for the root);
    /// empty locks every participating table.
    pub of: Vec<String>,
}

/// Unwraps each result down to a nested relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedParent {
    /// Relation path from the root to the object handed to the caller.
    pub path: String,
    /// Attribute on the returned object where the original root is attached.
    pub reattach: Option<String>,
}

/// The source expression of an extra selected column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraExpr {
    /// A field path, possibly through relations.
    Path(String),
    /// Raw SQL (no bind parameters).
    Raw(String),
    /// A column already labelled by an inner set-operation query.
    Inherited,
}

/// An extra column selected alongside the model columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraColumn {
    /// Result label.
    pub label: String,
    /// Source expression.
    pub expr: ExtraExpr,
}

/// Set operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    /// `UNION`.
    Union,
    /// `INTERSECT`.
    Intersect,
    /// `EXCEPT`.
    Except,
}

impl SetOp {
    /// The SQL keyword.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Union => "UNION",
            Self::Intersect => "INTERSECT",
            Self::Except => "EXCEPT",
        }
    }
}

/// Two queries combined by a set operation; the combination becomes the
/// source the outer query selects from.
#[derive(Debug, Clone)]
pub struct Combined {
    /// The operation.
    pub op: SetOp,
    /// Keep duplicates (`ALL`).
    pub all: bool,
    /// Left operand.
    pub left: QuerySpec,
    /// Right operand.
    pub right: QuerySpec,
}

/// Everything a query has been asked to do.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    /// AND-ed filter clauses.
    pub filters: Vec<Q>,
    /// Clauses OR-ed together, then AND-ed with `filters`.
    pub or_clauses: Vec<Q>,
    /// Relation paths joined and populated in the same query.
    pub select_related: Vec<String>,
    /// Relations populated by batch-scoped follow-up queries.
    pub prefetch: Vec<Prefetch>,
    /// Ordering paths, `-` prefix for descending.
    pub order_by: Vec<String>,
    /// Grouping paths.
    pub group_by: Vec<String>,
    /// De-duplication mode.
    pub distinct: Distinct,
    /// Maximum rows.
    pub limit: Option<u64>,
    /// Rows skipped.
    pub offset: Option<u64>,
    /// Rows per fetched batch.
    pub batch_size: Option<usize>,
    /// Fields to load (everything else deferred).
    pub only: Vec<String>,
    /// Fields not to load.
    pub defer: Vec<String>,
    /// Leave secret fields out of the projection.
    pub exclude_secrets: bool,
    /// Row locking.
    pub lock: Option<RowLock>,
    /// Schema override for every table.
    pub using_schema: Option<String>,
    /// Database alias override.
    pub using_database: Option<String>,
    /// Unwrap instruction applied to each result.
    pub embed_parent: Option<EmbedParent>,
    /// Extra selected columns.
    pub extra: Vec<ExtraColumn>,
    /// Relation path whose key columns are selected as `__key_n` (used to
    /// group prefetched rows by parent).
    pub key_path: Option<String>,
    /// Set-operation source.
    pub combined: Option<Box<Combined>>,
    /// Matches nothing; executes no I/O.
    pub empty: bool,
}

impl QuerySpec {
    /// Whether the query carries any filter.
    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty() || !self.or_clauses.is_empty()
    }

    /// Whether an ordering was requested.
    pub fn is_ordered(&self) -> bool {
        !self.order_by.is_empty()
    }

    /// Whether limit or offset was applied.
    pub const fn is_sliced(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }
}
