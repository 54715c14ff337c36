//! Raw result rows returned by a [`Connection`](crate::connection::Connection).

use relorm_core::{OrmError, OrmResult};

use crate::value::Value;

/// A single row returned by a database query.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a new row from column names and values.
    ///
    /// Extra values beyond the number of columns are dropped, and missing
    /// values are padded with NULL.
    pub fn new(columns: Vec<String>, mut values: Vec<Value>) -> Self {
        values.resize(columns.len(), Value::Null);
        Self { columns, values }
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the raw values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Gets a typed value by column name.
    pub fn get<T: FromValue>(&self, column: &str) -> OrmResult<T> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| OrmError::DatabaseError(format!("Column '{column}' not found in row")))?;
        T::from_value(&self.values[idx])
    }

    /// Gets a typed value by column index.
    pub fn get_by_index<T: FromValue>(&self, idx: usize) -> OrmResult<T> {
        self.values
            .get(idx)
            .ok_or_else(|| {
                OrmError::DatabaseError(format!(
                    "Column index {idx} out of bounds (row has {} columns)",
                    self.values.len()
                ))
            })
            .and_then(T::from_value)
    }

    /// Returns the raw value at an index, or NULL when out of bounds.
    pub fn value_at(&self, idx: usize) -> &Value {
        self.values.get(idx).unwrap_or(&Value::Null)
    }
}

/// Conversion from a [`Value`] reference into a Rust type.
pub trait FromValue: Sized {
    /// Attempts to convert a value reference to this type.
    fn from_value(value: &Value) -> OrmResult<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> OrmResult<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            _ => Err(OrmError::DatabaseError(format!(
                "Expected Int, got {value:?}"
            ))),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Int(i) => i32::try_from(*i).map_err(|e| {
                OrmError::DatabaseError(format!("Int value out of i32 range: {e}"))
            }),
            _ => Err(OrmError::DatabaseError(format!(
                "Expected Int, got {value:?}"
            ))),
        }
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Int(i) => u64::try_from(*i).map_err(|e| {
                OrmError::DatabaseError(format!("Int value out of u64 range: {e}"))
            }),
            _ => Err(OrmError::DatabaseError(format!(
                "Expected Int, got {value:?}"
            ))),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            _ => Err(OrmError::DatabaseError(format!(
                "Expected Float, got {value:?}"
            ))),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            _ => Err(OrmError::DatabaseError(format!(
                "Expected Bool, got {value:?}"
            ))),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(OrmError::DatabaseError(format!(
                "Expected String, got {value:?}"
            ))),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Uuid(u) => Ok(*u),
            Value::String(s) => uuid::Uuid::parse_str(s)
                .map_err(|e| OrmError::DatabaseError(format!("Invalid UUID '{s}': {e}"))),
            _ => Err(OrmError::DatabaseError(format!(
                "Expected Uuid, got {value:?}"
            ))),
        }
    }
}

impl FromValue for chrono::NaiveDate {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            _ => Err(OrmError::DatabaseError(format!(
                "Expected Date, got {value:?}"
            ))),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Json(j) => Ok(j.clone()),
            _ => Err(OrmError::DatabaseError(format!(
                "Expected Json, got {value:?}"
            ))),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}
