//! The operator table.
//!
//! Operators are the `__<name>` suffixes of the filter grammar. They are not
//! a hardcoded list: an [`OperatorTable`] maps names to [`Operator`]
//! definitions, ships with the usual defaults and accepts custom entries.
//!
//! # Examples
//!
//! ```
//! use relorm_db::query::operators::{Operator, OperatorTable};
//!
//! let mut table = OperatorTable::with_defaults();
//! table.register("bitand", Operator::template("({column} & {value}) <> 0"));
//! assert!(table.get("bitand").is_some());
//! assert!(table.get("icontains").is_some());
//! ```

use std::collections::HashMap;

use once_cell::sync::Lazy;
use relorm_core::{OrmError, OrmResult};

use crate::connection::DatabaseBackendType;
use crate::value::Value;

/// Which part of a string a pattern operator anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// `%value%`
    Contains,
    /// `value%`
    StartsWith,
    /// `%value`
    EndsWith,
}

/// How an operator renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    /// A binary comparison (`=`, `<>`, `>`, ...). Comparing with NULL
    /// renders `IS NULL` / `IS NOT NULL` for `=` / `<>`.
    Compare(&'static str),
    /// Case-insensitive equality.
    IExact,
    /// A `LIKE` pattern with wildcard escaping.
    Pattern {
        /// Anchoring of the pattern.
        kind: PatternKind,
        /// Compare case-insensitively.
        case_insensitive: bool,
    },
    /// List membership.
    In {
        /// `NOT IN` when set.
        negated: bool,
    },
    /// `IS NULL` (true) / `IS NOT NULL` (false).
    IsNull,
    /// `BETWEEN low AND high`.
    Range,
    /// A custom template with `{column}` and `{value}` placeholders.
    Template(String),
}

impl Operator {
    /// A custom template operator.
    pub fn template(sql: impl Into<String>) -> Self {
        Self::Template(sql.into())
    }

    /// Whether the operator can compare several columns at once.
    pub fn supports_composite(&self) -> bool {
        matches!(
            self,
            Self::Compare("=" | "<>") | Self::In { .. } | Self::IsNull
        )
    }
}

/// Accumulates bind parameters and hands out dialect placeholders.
///
/// SQL is always assembled in text order, so placeholder numbers match
/// parameter positions.
#[derive(Debug)]
pub struct Params {
    backend: DatabaseBackendType,
    values: Vec<Value>,
}

impl Params {
    /// Creates an empty parameter list.
    pub const fn new(backend: DatabaseBackendType) -> Self {
        Self {
            backend,
            values: Vec::new(),
        }
    }

    /// The dialect being compiled for.
    pub const fn backend(&self) -> DatabaseBackendType {
        self.backend
    }

    /// Binds a value and returns its placeholder.
    pub fn push(&mut self, value: Value) -> String {
        self.values.push(value);
        self.backend.placeholder(self.values.len())
    }

    /// Number of bound values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consumes the accumulator.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Escapes `LIKE` wildcards so user input matches literally.
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

const fn escape_clause(backend: DatabaseBackendType) -> &'static str {
    match backend {
        DatabaseBackendType::MySQL => " ESCAPE '\\\\'",
        DatabaseBackendType::PostgreSQL | DatabaseBackendType::SQLite => " ESCAPE '\\'",
    }
}

static DEFAULT_OPERATORS: Lazy<OperatorTable> = Lazy::new(OperatorTable::build_defaults);

/// Registry of filter operators by name.
#[derive(Debug, Clone)]
pub struct OperatorTable {
    operators: HashMap<String, Operator>,
}

impl Default for OperatorTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl OperatorTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            operators: HashMap::new(),
        }
    }

    /// Creates a table with the built-in operators.
    pub fn with_defaults() -> Self {
        DEFAULT_OPERATORS.clone()
    }

    fn build_defaults() -> Self {
        let mut table = Self::new();
        for (name, op) in [
            ("exact", Operator::Compare("=")),
            ("neq", Operator::Compare("<>")),
            ("gt", Operator::Compare(">")),
            ("gte", Operator::Compare(">=")),
            ("lt", Operator::Compare("<")),
            ("lte", Operator::Compare("<=")),
            ("iexact", Operator::IExact),
            ("in", Operator::In { negated: false }),
            ("not_in", Operator::In { negated: true }),
            ("isnull", Operator::IsNull),
            ("range", Operator::Range),
        ] {
            table.register(name, op);
        }
        for (name, kind) in [
            ("contains", PatternKind::Contains),
            ("startswith", PatternKind::StartsWith),
            ("endswith", PatternKind::EndsWith),
        ] {
            table.register(
                name,
                Operator::Pattern {
                    kind,
                    case_insensitive: false,
                },
            );
            table.register(
                format!("i{name}"),
                Operator::Pattern {
                    kind,
                    case_insensitive: true,
                },
            );
        }
        table
    }

    /// Registers (or replaces) an operator.
    pub fn register(&mut self, name: impl Into<String>, op: Operator) {
        self.operators.insert(name.into(), op);
    }

    /// Looks up an operator.
    pub fn get(&self, name: &str) -> Option<&Operator> {
        self.operators.get(name)
    }

    /// Whether `name` is a registered operator.
    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    /// Looks up an operator, failing with a query error.
    pub fn resolve(&self, name: &str) -> OrmResult<&Operator> {
        self.get(name).ok_or_else(|| {
            OrmError::QuerySetError(format!("Unsupported lookup '{name}'"))
        })
    }

    /// Renders `column <op> value` for a single column.
    pub fn compile(
        &self,
        name: &str,
        column: &str,
        value: &Value,
        params: &mut Params,
    ) -> OrmResult<String> {
        let backend = params.backend();
        Ok(match self.resolve(name)? {
            Operator::Compare(op) => match (value, *op) {
                (Value::Null, "=") => format!("{column} IS NULL"),
                (Value::Null, "<>") => format!("{column} IS NOT NULL"),
                (Value::List(_), _) => {
                    return Err(OrmError::QuerySetError(format!(
                        "Lookup '{name}' expects a single value"
                    )))
                }
                (v, op) => format!("{column} {op} {}", params.push(v.clone())),
            },
            Operator::IExact => match value {
                Value::Null => format!("{column} IS NULL"),
                v => format!("UPPER({column}) = UPPER({})", params.push(v.clone())),
            },
            Operator::Pattern {
                kind,
                case_insensitive,
            } => {
                let text = match value {
                    Value::String(s) => escape_like(s),
                    Value::Null => {
                        return Err(OrmError::QuerySetError(format!(
                            "Lookup '{name}' does not accept NULL"
                        )))
                    }
                    other => escape_like(&other.to_string()),
                };
                let pattern = match kind {
                    PatternKind::Contains => format!("%{text}%"),
                    PatternKind::StartsWith => format!("{text}%"),
                    PatternKind::EndsWith => format!("%{text}"),
                };
                let ph = params.push(Value::String(pattern));
                let esc = escape_clause(backend);
                match (case_insensitive, backend) {
                    (true, DatabaseBackendType::PostgreSQL) => format!("{column} ILIKE {ph}{esc}"),
                    (true, _) => format!("UPPER({column}) LIKE UPPER({ph}){esc}"),
                    (false, _) => format!("{column} LIKE {ph}{esc}"),
                }
            }
            Operator::In { negated } => {
                let Value::List(items) = value else {
                    return Err(OrmError::QuerySetError(format!(
                        "Lookup '{name}' expects a list of values"
                    )));
                };
                if items.is_empty() {
                    // Nothing is in an empty set.
                    return Ok(if *negated { "1 = 1" } else { "1 = 0" }.to_string());
                }
                let phs: Vec<String> = items.iter().map(|v| params.push(v.clone())).collect();
                let kw = if *negated { "NOT IN" } else { "IN" };
                format!("{column} {kw} ({})", phs.join(", "))
            }
            Operator::IsNull => {
                if is_truthy(value) {
                    format!("{column} IS NULL")
                } else {
                    format!("{column} IS NOT NULL")
                }
            }
            Operator::Range => match value {
                Value::List(bounds) if bounds.len() == 2 => {
                    let lo = params.push(bounds[0].clone());
                    let hi = params.push(bounds[1].clone());
                    format!("{column} BETWEEN {lo} AND {hi}")
                }
                _ => {
                    return Err(OrmError::QuerySetError(
                        "Lookup 'range' expects exactly two values".to_string(),
                    ))
                }
            },
            Operator::Template(template) => {
                let rendered = template.replace("{column}", column);
                if rendered.contains("{value}") {
                    let ph = params.push(value.clone());
                    rendered.replace("{value}", &ph)
                } else {
                    rendered
                }
            }
        })
    }

    /// Renders an operator over several columns at once (composite keys).
    ///
    /// `exact`/`neq` compare every column, `in` compares row values and
    /// `isnull` checks all columns.
    pub fn compile_composite(
        &self,
        name: &str,
        columns: &[String],
        value: &Value,
        params: &mut Params,
    ) -> OrmResult<String> {
        if let [column] = columns {
            return self.compile(name, column, value, params);
        }
        let op = self.resolve(name)?;
        if !op.supports_composite() {
            return Err(OrmError::QuerySetError(format!(
                "Lookup '{name}' is not supported on multi-column fields"
            )));
        }
        let tuple = |v: &Value| -> OrmResult<Vec<Value>> {
            let parts = v.as_parts();
            if parts.len() == columns.len() {
                Ok(parts.to_vec())
            } else {
                Err(OrmError::QuerySetError(format!(
                    "Expected {} key values, got {}",
                    columns.len(),
                    parts.len()
                )))
            }
        };
        Ok(match op {
            Operator::Compare(cmp) => {
                if value.is_null() {
                    let parts: Vec<String> = columns
                        .iter()
                        .map(|c| {
                            if *cmp == "=" {
                                format!("{c} IS NULL")
                            } else {
                                format!("{c} IS NOT NULL")
                            }
                        })
                        .collect();
                    return Ok(format!("({})", parts.join(" AND ")));
                }
                let parts: Vec<String> = columns
                    .iter()
                    .zip(tuple(value)?)
                    .map(|(c, v)| format!("{c} = {}", params.push(v)))
                    .collect();
                let all = format!("({})", parts.join(" AND "));
                if *cmp == "=" {
                    all
                } else {
                    format!("NOT {all}")
                }
            }
            Operator::IsNull => {
                let test = if is_truthy(value) { "IS NULL" } else { "IS NOT NULL" };
                let parts: Vec<String> = columns.iter().map(|c| format!("{c} {test}")).collect();
                format!("({})", parts.join(" AND "))
            }
            Operator::In { negated } => {
                let Value::List(items) = value else {
                    return Err(OrmError::QuerySetError(format!(
                        "Lookup '{name}' expects a list of values"
                    )));
                };
                if items.is_empty() {
                    return Ok(if *negated { "1 = 1" } else { "1 = 0" }.to_string());
                }
                let mut rows = Vec::with_capacity(items.len());
                for item in items {
                    let phs: Vec<String> = tuple(item)?.into_iter().map(|v| params.push(v)).collect();
                    rows.push(format!("({})", phs.join(", ")));
                }
                let kw = if *negated { "NOT IN" } else { "IN" };
                let list = if params.backend().supports_values_list() {
                    format!("(VALUES {})", rows.join(", "))
                } else {
                    format!("({})", rows.join(", "))
                };
                format!("({}) {kw} {list}", columns.join(", "))
            }
            _ => {
                return Err(OrmError::QuerySetError(format!(
                    "Lookup '{name}' is not supported on multi-column fields"
                )))
            }
        })
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Null => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(name: &str, value: Value, backend: DatabaseBackendType) -> (String, Vec<Value>) {
        let table = OperatorTable::with_defaults();
        let mut params = Params::new(backend);
        let sql = table.compile(name, "\"t\".\"c\"", &value, &mut params).unwrap();
        (sql, params.into_values())
    }

    #[test]
    fn test_exact_and_null() {
        let (sql, params) = compile("exact", Value::Int(3), DatabaseBackendType::PostgreSQL);
        assert_eq!(sql, "\"t\".\"c\" = $1");
        assert_eq!(params, vec![Value::Int(3)]);
        let (sql, params) = compile("exact", Value::Null, DatabaseBackendType::SQLite);
        assert_eq!(sql, "\"t\".\"c\" IS NULL");
        assert!(params.is_empty());
        let (sql, _) = compile("neq", Value::Null, DatabaseBackendType::SQLite);
        assert_eq!(sql, "\"t\".\"c\" IS NOT NULL");
    }

    #[test]
    fn test_contains_escapes_wildcards() {
        let (sql, params) = compile("contains", "50%_off".into(), DatabaseBackendType::SQLite);
        assert_eq!(sql, "\"t\".\"c\" LIKE ? ESCAPE '\\'");
        assert_eq!(params, vec![Value::String("%50\\%\\_off%".into())]);
    }

    #[test]
    fn test_icontains_per_backend() {
        let (sql, _) = compile("icontains", "a".into(), DatabaseBackendType::PostgreSQL);
        assert_eq!(sql, "\"t\".\"c\" ILIKE $1 ESCAPE '\\'");
        let (sql, _) = compile("istartswith", "a".into(), DatabaseBackendType::SQLite);
        assert_eq!(sql, "UPPER(\"t\".\"c\") LIKE UPPER(?) ESCAPE '\\'");
        let (sql, params) = compile("endswith", "a".into(), DatabaseBackendType::MySQL);
        assert_eq!(sql, "\"t\".\"c\" LIKE ? ESCAPE '\\\\'");
        assert_eq!(params, vec![Value::String("%a".into())]);
    }

    #[test]
    fn test_in_and_empty_in() {
        let (sql, params) = compile(
            "in",
            Value::List(vec![1.into(), 2.into()]),
            DatabaseBackendType::PostgreSQL,
        );
        assert_eq!(sql, "\"t\".\"c\" IN ($1, $2)");
        assert_eq!(params.len(), 2);
        let (sql, _) = compile("in", Value::List(vec![]), DatabaseBackendType::SQLite);
        assert_eq!(sql, "1 = 0");
        let (sql, _) = compile("not_in", Value::List(vec![]), DatabaseBackendType::SQLite);
        assert_eq!(sql, "1 = 1");
    }

    #[test]
    fn test_isnull_and_range() {
        let (sql, _) = compile("isnull", true.into(), DatabaseBackendType::SQLite);
        assert_eq!(sql, "\"t\".\"c\" IS NULL");
        let (sql, _) = compile("isnull", false.into(), DatabaseBackendType::SQLite);
        assert_eq!(sql, "\"t\".\"c\" IS NOT NULL");
        let (sql, params) = compile(
            "range",
            Value::List(vec![1.into(), 5.into()]),
            DatabaseBackendType::PostgreSQL,
        );
        assert_eq!(sql, "\"t\".\"c\" BETWEEN $1 AND $2");
        assert_eq!(params, vec![Value::Int(1), Value::Int(5)]);
    }

    #[test]
    fn test_unknown_operator() {
        let table = OperatorTable::with_defaults();
        let mut params = Params::new(DatabaseBackendType::SQLite);
        let err = table.compile("regex", "c", &Value::Int(1), &mut params).unwrap_err();
        assert!(err.to_string().contains("Unsupported lookup 'regex'"));
    }

    #[test]
    fn test_custom_template() {
        let mut table = OperatorTable::with_defaults();
        table.register("bitand", Operator::template("({column} & {value}) <> 0"));
        let mut params = Params::new(DatabaseBackendType::PostgreSQL);
        let sql = table.compile("bitand", "\"flags\"", &Value::Int(4), &mut params).unwrap();
        assert_eq!(sql, "(\"flags\" & $1) <> 0");
    }

    #[test]
    fn test_composite_in_uses_row_values() {
        let table = OperatorTable::with_defaults();
        let cols = vec!["\"a\"".to_string(), "\"b\"".to_string()];
        let value = Value::List(vec![
            Value::List(vec![1.into(), "x".into()]),
            Value::List(vec![2.into(), "y".into()]),
        ]);

        let mut params = Params::new(DatabaseBackendType::SQLite);
        let sql = table.compile_composite("in", &cols, &value, &mut params).unwrap();
        assert_eq!(sql, "(\"a\", \"b\") IN (VALUES (?, ?), (?, ?))");
        assert_eq!(params.len(), 4);

        let mut params = Params::new(DatabaseBackendType::MySQL);
        let sql = table.compile_composite("in", &cols, &value, &mut params).unwrap();
        assert_eq!(sql, "(\"a\", \"b\") IN ((?, ?), (?, ?))");
    }

    #[test]
    fn test_composite_exact_and_unsupported() {
        let table = OperatorTable::with_defaults();
        let cols = vec!["a".to_string(), "b".to_string()];
        let mut params = Params::new(DatabaseBackendType::PostgreSQL);
        let sql = table
            .compile_composite("exact", &cols, &Value::List(vec![1.into(), 2.into()]), &mut params)
            .unwrap();
        assert_eq!(sql, "(a = $1 AND b = $2)");
        assert!(table
            .compile_composite("gt", &cols, &Value::Int(1), &mut params)
            .is_err());
        assert!(table
            .compile_composite("exact", &cols, &Value::Int(1), &mut params)
            .is_err());
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a\\b%c_d"), "a\\\\b\\%c\\_d");
    }
}
