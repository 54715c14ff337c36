//! Relationship path resolution.
//!
//! [`crawl_relationship`] resolves a dotted path such as
//! `author__profile__city__icontains` against the registry: it walks one
//! relationship hop per segment, accumulating the forward path and the
//! reverse path back to the starting model, and stops when it reaches a
//! plain field, an operator suffix, or a hop into another database. It is a
//! pure function of the registry.

use std::sync::Arc;

use relorm_core::{OrmError, OrmResult};

use crate::fields::{Field, Relation};
use crate::model::ModelMeta;
use crate::registry::Registry;

/// Path separator of the filter grammar.
pub const LOOKUP_SEP: &str = "__";

/// Name that always refers to a model's primary key.
pub const PK: &str = "pk";

/// The path leading back from the terminal model to the starting model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversePath {
    /// Dotted reverse path (empty when no hop was taken).
    Path(String),
    /// Some hop has no way back.
    Unavailable,
}

impl ReversePath {
    /// The reverse path, if one exists.
    pub fn as_path(&self) -> Option<&str> {
        match self {
            Self::Path(p) => Some(p),
            Self::Unavailable => None,
        }
    }
}

/// One relationship hop taken by the crawler.
#[derive(Debug, Clone)]
pub struct Hop {
    /// Model the hop starts from.
    pub from: Arc<ModelMeta>,
    /// Relationship field followed.
    pub field: String,
    /// The resolved relation.
    pub relation: Relation,
    /// Model the hop arrives at.
    pub to: Arc<ModelMeta>,
}

/// The outcome of resolving a path.
#[derive(Debug, Clone)]
pub struct CrawlResult {
    /// Model owning the terminal field.
    pub model: Arc<ModelMeta>,
    /// The terminal field name (`pk` for a composite primary key).
    pub field_name: String,
    /// The operator suffix (`exact` when none was given).
    pub operator: String,
    /// Relationship segments traversed, joined with `__`.
    pub forward_path: String,
    /// How to get back to the starting model.
    pub reverse_path: ReversePath,
    /// Unresolved suffix when the path crosses into another database.
    pub cross_db_remainder: String,
    /// Whether any hop can fan out to several rows.
    pub is_many: bool,
    /// Every hop in order.
    pub hops: Vec<Hop>,
}

impl CrawlResult {
    /// Returns `true` when the path stopped at a database boundary.
    pub fn crosses_database(&self) -> bool {
        !self.cross_db_remainder.is_empty()
    }

    /// The terminal field name qualified with the forward path.
    pub fn qualified_field(&self) -> String {
        join_path(&self.forward_path, &self.field_name)
    }
}

/// Joins two path fragments with the separator, skipping empty ones.
pub fn join_path(prefix: &str, rest: &str) -> String {
    match (prefix.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{prefix}{LOOKUP_SEP}{rest}"),
    }
}

/// Resolves the name of a model's primary key: the single pk field name, or
/// `pk` for composite keys.
pub fn pk_name(model: &ModelMeta) -> String {
    match model.pk_names().as_slice() {
        [single] => (*single).to_string(),
        _ => PK.to_string(),
    }
}

/// Resolves `path` starting from `model`.
///
/// With `traverse_last`, a path ending on a relation follows that relation
/// too and reports the target's primary key. Relations stored elsewhere
/// (reverse and many-to-many) are always followed when they end the path,
/// since they have no columns of their own to compare.
///
/// # Errors
///
/// `QuerySetError` for unknown fields or a plain field followed by more than
/// an operator.
pub fn crawl_relationship(
    registry: &Registry,
    model: &Arc<ModelMeta>,
    path: &str,
    traverse_last: bool,
) -> OrmResult<CrawlResult> {
    let segments: Vec<&str> = path.split(LOOKUP_SEP).collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(OrmError::QuerySetError(format!(
            "Invalid lookup path '{path}'"
        )));
    }

    let mut current = Arc::clone(model);
    let mut walk = Walk::default();
    let mut i = 0;

    loop {
        let seg = segments[i];
        let rest = &segments[i + 1..];

        if seg == PK {
            let operator = terminal_operator(path, rest)?;
            let name = pk_name(&current);
            return Ok(walk.finish(current, name, operator, String::new()));
        }

        let field = current.field_or_err(seg)?;
        let Some(relation) = field.relation.clone() else {
            if field.relation_target().is_some() {
                return Err(OrmError::ImproperlyConfigured(format!(
                    "Relation {}.{seg} was never resolved",
                    current.name
                )));
            }
            let operator = terminal_operator(path, rest)?;
            return Ok(walk.finish(current, seg.to_string(), operator, String::new()));
        };

        let remaining = segments[i..].join(LOOKUP_SEP);
        let traversal = field.traverse_field(&remaining).ok_or_else(|| {
            OrmError::QuerySetError(format!("Cannot traverse '{seg}' on {}", current.name))
        })?;
        let target = Arc::clone(registry.get(&traversal.target)?);
        let stored_locally = matches!(relation, Relation::Forward { .. });

        // A relation followed by something that is not a field of the target
        // is an operator applied to the relation itself.
        let next_is_operator = match rest {
            [] => true,
            [next] => *next != PK && target.field(next).is_none(),
            _ => false,
        };
        let operator = rest
            .first()
            .filter(|_| next_is_operator)
            .map_or_else(|| "exact".to_string(), |s| (*s).to_string());

        if next_is_operator && stored_locally && !(traverse_last && rest.is_empty()) {
            return Ok(walk.finish(current, seg.to_string(), operator, String::new()));
        }

        if target.database != current.database {
            let remainder = if next_is_operator {
                join_path(&pk_name(&target), &rest.join(LOOKUP_SEP))
            } else {
                rest.join(LOOKUP_SEP)
            };
            return Ok(walk.finish(current, seg.to_string(), "exact".to_string(), remainder));
        }

        walk.forward.push(seg.to_string());
        match traversal.reverse_segment {
            Some(back) => walk.reverse.insert(0, back),
            None => walk.reverse_ok = false,
        }
        walk.is_many |= relation.is_many();
        walk.hops.push(Hop {
            from: Arc::clone(&current),
            field: seg.to_string(),
            relation,
            to: Arc::clone(&target),
        });
        current = target;

        if next_is_operator {
            let name = pk_name(&current);
            return Ok(walk.finish(current, name, operator, String::new()));
        }
        i += 1;
    }
}

/// State accumulated while walking a path.
struct Walk {
    forward: Vec<String>,
    reverse: Vec<String>,
    reverse_ok: bool,
    is_many: bool,
    hops: Vec<Hop>,
}

impl Default for Walk {
    fn default() -> Self {
        Self {
            forward: Vec::new(),
            reverse: Vec::new(),
            reverse_ok: true,
            is_many: false,
            hops: Vec::new(),
        }
    }
}

impl Walk {
    fn finish(
        self,
        model: Arc<ModelMeta>,
        field_name: String,
        operator: String,
        cross_db_remainder: String,
    ) -> CrawlResult {
        CrawlResult {
            model,
            field_name,
            operator,
            forward_path: self.forward.join(LOOKUP_SEP),
            reverse_path: if self.reverse_ok {
                ReversePath::Path(self.reverse.join(LOOKUP_SEP))
            } else {
                ReversePath::Unavailable
            },
            cross_db_remainder,
            is_many: self.is_many,
            hops: self.hops,
        }
    }
}

fn terminal_operator(path: &str, rest: &[&str]) -> OrmResult<String> {
    match rest {
        [] => Ok("exact".to_string()),
        [op] => Ok((*op).to_string()),
        _ => Err(OrmError::QuerySetError(format!(
            "Cannot resolve '{path}': '{}' is not a relation",
            rest.join(LOOKUP_SEP)
        ))),
    }
}
