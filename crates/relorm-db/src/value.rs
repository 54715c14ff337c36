//! ORM value types for representing database values in a backend-agnostic way.
//!
//! The [`Value`] enum is the core type used throughout the engine to represent
//! field values, query parameters, and results. [`PkKey`] is the immutable,
//! hashable form of a primary-key tuple used as the result-cache key.

use std::fmt;

/// A backend-agnostic representation of a database value.
///
/// # Examples
///
/// ```
/// use relorm_db::value::Value;
///
/// let v = Value::from(42_i64);
/// assert_eq!(v, Value::Int(42));
///
/// let v = Value::from("hello");
/// assert_eq!(v, Value::String("hello".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A boolean value.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit floating-point number.
    Float(f64),
    /// A UTF-8 string.
    String(String),
    /// Raw binary data.
    Bytes(Vec<u8>),
    /// A date without time.
    Date(chrono::NaiveDate),
    /// A date and time without timezone.
    DateTime(chrono::NaiveDateTime),
    /// A date and time with UTC timezone.
    DateTimeTz(chrono::DateTime<chrono::Utc>),
    /// A time without date.
    Time(chrono::NaiveTime),
    /// A UUID value.
    Uuid(uuid::Uuid),
    /// A JSON value.
    Json(serde_json::Value),
    /// A list of values (IN clauses, composite keys).
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Date(d) => write!(f, "{d}"),
            Self::DateTime(dt) => write!(f, "{dt}"),
            Self::DateTimeTz(dt) => write!(f, "{dt}"),
            Self::Time(t) => write!(f, "{t}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Json(j) => write!(f, "{j}"),
            Self::List(vals) => {
                write!(f, "[")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

// ── Conversions ────────────────────────────────────────────────────────

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i64 => Int,
    f64 => Float,
    String => String,
    Vec<u8> => Bytes,
    chrono::NaiveDate => Date,
    chrono::NaiveDateTime => DateTime,
    chrono::DateTime<chrono::Utc> => DateTimeTz,
    chrono::NaiveTime => Time,
    uuid::Uuid => Uuid,
    serde_json::Value => Json,
    Vec<Value> => List,
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Self::Null,
        }
    }
}

impl Value {
    /// Returns `true` if this value is `Null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Attempts to extract a boolean value.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempts to extract an integer value.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Attempts to extract a float value.
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Attempts to extract a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the elements of a list, or the value itself as a one-element slice.
    pub fn as_parts(&self) -> &[Self] {
        match self {
            Self::List(vals) => vals,
            other => std::slice::from_ref(other),
        }
    }
}

// ── Primary-key tuples ─────────────────────────────────────────────────

/// One hashable component of a [`PkKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    /// SQL NULL.
    Null,
    /// A boolean component.
    Bool(bool),
    /// An integer component.
    Int(i64),
    /// A float component, compared by bit pattern.
    Float(u64),
    /// A textual component (strings and temporal values).
    Text(String),
    /// A binary component.
    Bytes(Vec<u8>),
    /// A UUID component.
    Uuid(uuid::Uuid),
}

impl From<&Value> for KeyPart {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::Int(*i),
            Value::Float(f) => Self::Float(f.to_bits()),
            Value::String(s) => Self::Text(s.clone()),
            Value::Bytes(b) => Self::Bytes(b.clone()),
            Value::Uuid(u) => Self::Uuid(*u),
            other => Self::Text(other.to_string()),
        }
    }
}

/// An immutable, ordered tuple of primary-key values.
///
/// Equal keys identify the same row of the same model; the result cache uses
/// `(model name, PkKey)` as its key.
///
/// # Examples
///
/// ```
/// use relorm_db::value::{PkKey, Value};
///
/// let a = PkKey::from_values(&[Value::Int(1), Value::from("x")]);
/// let b = PkKey::from_values(&[Value::Int(1), Value::from("x")]);
/// assert_eq!(a, b);
/// assert!(!a.is_null());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PkKey(Vec<KeyPart>);

impl PkKey {
    /// Builds a key from the primary-key values in declaration order.
    pub fn from_values(values: &[Value]) -> Self {
        Self(values.iter().map(KeyPart::from).collect())
    }

    /// Returns `true` when every component is NULL (an outer join with no match).
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|p| *p == KeyPart::Null)
    }

    /// Returns the key components.
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

impl fmt::Display for PkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match part {
                KeyPart::Null => write!(f, "NULL")?,
                KeyPart::Bool(b) => write!(f, "{b}")?,
                KeyPart::Int(v) => write!(f, "{v}")?,
                KeyPart::Float(bits) => write!(f, "{}", f64::from_bits(*bits))?,
                KeyPart::Text(s) => write!(f, "{s}")?,
                KeyPart::Bytes(b) => write!(f, "<{} bytes>", b.len())?,
                KeyPart::Uuid(u) => write!(f, "{u}")?,
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_from_integers() {
        assert_eq!(Value::from(42_i32), Value::Int(42));
        assert_eq!(Value::from(42_i64), Value::Int(42));
    }

    #[test]
    fn test_from_option() {
        let some_val: Option<i64> = Some(42);
        assert_eq!(Value::from(some_val), Value::Int(42));

        let none_val: Option<i64> = None;
        assert_eq!(Value::from(none_val), Value::Null);
    }

    #[test]
    fn test_from_chrono_date() {
        let d = chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(Value::from(d), Value::Date(d));
    }

    #[test]
    fn test_display_list() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(list.to_string(), "[1, 2, 3]");
    }

    #[test]
    fn test_as_parts() {
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(list.as_parts().len(), 2);
        assert_eq!(Value::Int(7).as_parts(), &[Value::Int(7)]);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Int(42).as_int(), Some(42));
        assert_eq!(Value::Float(1.5).as_float(), Some(1.5));
        assert_eq!(Value::String("hi".into()).as_str(), Some("hi"));
        assert!(Value::Null.is_null());
        assert_eq!(Value::Int(1).as_str(), None);
    }

    // ── PkKey ───────────────────────────────────────────────────────

    #[test]
    fn test_pk_key_hashable() {
        let mut map = HashMap::new();
        map.insert(PkKey::from_values(&[Value::Int(1)]), "one");
        assert_eq!(
            map.get(&PkKey::from_values(&[Value::Int(1)])),
            Some(&"one")
        );
        assert!(map.get(&PkKey::from_values(&[Value::Int(2)])).is_none());
    }

    #[test]
    fn test_pk_key_composite_order_matters() {
        let a = PkKey::from_values(&[Value::Int(1), Value::Int(2)]);
        let b = PkKey::from_values(&[Value::Int(2), Value::Int(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_pk_key_null() {
        assert!(PkKey::from_values(&[Value::Null, Value::Null]).is_null());
        assert!(!PkKey::from_values(&[Value::Null, Value::Int(1)]).is_null());
    }

    #[test]
    fn test_pk_key_display() {
        let key = PkKey::from_values(&[Value::Int(3), Value::from("b")]);
        assert_eq!(key.to_string(), "(3, b)");
    }
}
