//! Filter expressions.
//!
//! A filter is a dotted path in the public grammar
//! `segment(__segment)*(__operator)?` paired with a value, e.g.
//! `author__name__icontains = "ann"`. [`Q`] combines filters with `&`, `|`
//! and `!`. [`Lookup`] is typed sugar that appends the operator suffix for
//! the built-in operators.
//!
//! # Examples
//!
//! ```
//! use relorm_db::query::lookups::{Lookup, Q};
//!
//! // name = "Alice"
//! let q = Q::kw("name", "Alice");
//!
//! // name = "Alice" AND age > 25
//! let combined = q & Q::filter("age", Lookup::Gt(25.into()));
//!
//! // author.name = "Alice" OR author.name = "Bob"
//! let either = Q::kw("author__name", "Alice") | Q::kw("author__name", "Bob");
//!
//! // NOT(active = false)
//! let negated = !Q::kw("active", false);
//! ```

use std::ops;

use crate::value::Value;

/// A typed built-in lookup, appended to a field path as `__<operator>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// `field = value`.
    Exact(Value),
    /// Case-insensitive equality.
    IExact(Value),
    /// `field <> value`.
    Neq(Value),
    /// Substring match.
    Contains(String),
    /// Case-insensitive substring match.
    IContains(String),
    /// `field IN (values...)`.
    In(Vec<Value>),
    /// `field NOT IN (values...)`.
    NotIn(Vec<Value>),
    /// `field > value`.
    Gt(Value),
    /// `field >= value`.
    Gte(Value),
    /// `field < value`.
    Lt(Value),
    /// `field <= value`.
    Lte(Value),
    /// Prefix match.
    StartsWith(String),
    /// Case-insensitive prefix match.
    IStartsWith(String),
    /// Suffix match.
    EndsWith(String),
    /// Case-insensitive suffix match.
    IEndsWith(String),
    /// `field BETWEEN low AND high`.
    Range(Value, Value),
    /// `field IS NULL` or `field IS NOT NULL`.
    IsNull(bool),
}

impl Lookup {
    /// The operator suffix this lookup compiles through.
    pub const fn operator(&self) -> &'static str {
        match self {
            Self::Exact(_) => "exact",
            Self::IExact(_) => "iexact",
            Self::Neq(_) => "neq",
            Self::Contains(_) => "contains",
            Self::IContains(_) => "icontains",
            Self::In(_) => "in",
            Self::NotIn(_) => "not_in",
            Self::Gt(_) => "gt",
            Self::Gte(_) => "gte",
            Self::Lt(_) => "lt",
            Self::Lte(_) => "lte",
            Self::StartsWith(_) => "startswith",
            Self::IStartsWith(_) => "istartswith",
            Self::EndsWith(_) => "endswith",
            Self::IEndsWith(_) => "iendswith",
            Self::Range(..) => "range",
            Self::IsNull(_) => "isnull",
        }
    }

    /// The filter value carried by this lookup.
    pub fn into_value(self) -> Value {
        match self {
            Self::Exact(v)
            | Self::IExact(v)
            | Self::Neq(v)
            | Self::Gt(v)
            | Self::Gte(v)
            | Self::Lt(v)
            | Self::Lte(v) => v,
            Self::Contains(s)
            | Self::IContains(s)
            | Self::StartsWith(s)
            | Self::IStartsWith(s)
            | Self::EndsWith(s)
            | Self::IEndsWith(s) => Value::String(s),
            Self::In(vs) | Self::NotIn(vs) => Value::List(vs),
            Self::Range(lo, hi) => Value::List(vec![lo, hi]),
            Self::IsNull(b) => Value::Bool(b),
        }
    }
}

/// A composable filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Q {
    /// A single path/value condition.
    Filter {
        /// Dotted path, optionally ending in an operator suffix.
        path: String,
        /// The value compared against.
        value: Value,
    },
    /// Logical AND of multiple conditions.
    And(Vec<Q>),
    /// Logical OR of multiple conditions.
    Or(Vec<Q>),
    /// Logical negation of a condition.
    Not(Box<Q>),
}

impl Q {
    /// A condition in keyword form: `path` may end with `__<operator>`.
    pub fn kw(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Filter {
            path: path.into(),
            value: value.into(),
        }
    }

    /// A condition built from a typed [`Lookup`].
    pub fn filter(field: impl Into<String>, lookup: Lookup) -> Self {
        let field = field.into();
        let path = match lookup {
            Lookup::Exact(_) => field,
            _ => format!("{field}__{}", lookup.operator()),
        };
        Self::Filter {
            path,
            value: lookup.into_value(),
        }
    }

    /// Returns `true` if this is an empty AND/OR.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::And(children) | Self::Or(children) => children.is_empty(),
            _ => false,
        }
    }

    /// Visits every `(path, value)` leaf.
    pub fn leaves(&self) -> Vec<(&str, &Value)> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<(&'a str, &'a Value)>) {
        match self {
            Self::Filter { path, value } => out.push((path, value)),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
            Self::Not(inner) => inner.collect_leaves(out),
        }
    }
}

impl ops::BitAnd for Q {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            // Flatten nested ANDs
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (other, Self::And(mut right)) => {
                right.insert(0, other);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }
}

impl ops::BitOr for Q {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            // Flatten nested ORs
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), other) => {
                left.push(other);
                Self::Or(left)
            }
            (other, Self::Or(mut right)) => {
                right.insert(0, other);
                Self::Or(right)
            }
            (left, right) => Self::Or(vec![left, right]),
        }
    }
}

impl ops::Not for Q {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kw_filter() {
        match Q::kw("author__name__icontains", "ann") {
            Q::Filter { path, value } => {
                assert_eq!(path, "author__name__icontains");
                assert_eq!(value, Value::String("ann".into()));
            }
            other => panic!("Expected Filter, got {other:?}"),
        }
    }

    #[test]
    fn test_lookup_appends_operator() {
        assert_eq!(
            Q::filter("age", Lookup::Gt(Value::from(25))),
            Q::kw("age__gt", 25)
        );
        assert_eq!(Q::filter("name", Lookup::Exact("a".into())), Q::kw("name", "a"));
        assert_eq!(
            Q::filter("id", Lookup::In(vec![1.into(), 2.into()])),
            Q::kw("id__in", Value::List(vec![1.into(), 2.into()]))
        );
        assert_eq!(
            Q::filter("n", Lookup::Range(1.into(), 9.into())),
            Q::kw("n__range", Value::List(vec![1.into(), 9.into()]))
        );
    }

    #[test]
    fn test_and_flattening() {
        let combined = (Q::kw("a", 1) & Q::kw("b", 2)) & Q::kw("c", 3);
        match &combined {
            Q::And(children) => assert_eq!(children.len(), 3),
            _ => panic!("Expected And with 3 children"),
        }
    }

    #[test]
    fn test_or_flattening() {
        let combined = Q::kw("a", 1) | (Q::kw("b", 2) | Q::kw("c", 3));
        match &combined {
            Q::Or(children) => {
                assert_eq!(children.len(), 3);
                assert_eq!(children[0], Q::kw("a", 1));
            }
            _ => panic!("Expected Or with 3 children"),
        }
    }

    #[test]
    fn test_double_negation() {
        let q = Q::kw("active", true);
        assert_eq!(!!q.clone(), q);
    }

    #[test]
    fn test_complex_combination() {
        let combined = (Q::kw("name", "Alice") & Q::kw("age__gt", 25)) | Q::kw("name", "Bob");
        match &combined {
            Q::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(&children[0], Q::And(_)));
            }
            _ => panic!("Expected Or"),
        }
        let leaves = combined.leaves();
        assert_eq!(leaves.iter().map(|(p, _)| *p).collect::<Vec<_>>(), vec!["name", "age__gt", "name"]);
    }

    #[test]
    fn test_q_is_empty() {
        assert!(Q::And(vec![]).is_empty());
        assert!(Q::Or(vec![]).is_empty());
        assert!(!Q::kw("x", 1).is_empty());
    }
}
