//! Field definitions and the [`Field`] capability.
//!
//! Every model field exposes the same small capability set, [`Field`]:
//! `clean` (model value to column values), `to_model` (column values back to
//! a model value), `columns`, and for relationship-capable fields
//! `traverse_field`. The engine only ever talks to fields through this trait;
//! the concrete behaviour is chosen when the [`FieldDef`] is declared.

pub mod types;

use relorm_core::OrmResult;

use crate::value::Value;

pub use types::{ColumnPair, FieldDef, FieldType, OnDelete, RelatedName, Relation};

/// The result of following a relationship field one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traversal {
    /// Name of the model on the far side of the relation.
    pub target: String,
    /// Name under which the target model can navigate back, if it can.
    pub reverse_segment: Option<String>,
    /// The path left after consuming this field's segment (may be empty).
    pub remainder: String,
}

/// The capability every model field offers to the query engine.
pub trait Field: Send + Sync {
    /// The attribute name of the field.
    fn name(&self) -> &str;

    /// The physical columns backing this field, in order. Empty for
    /// relations stored elsewhere (reverse and many-to-many).
    fn columns(&self) -> Vec<String>;

    /// Converts a model value into `(column, value)` pairs ready to bind.
    fn clean(&self, value: &Value) -> OrmResult<Vec<(String, Value)>>;

    /// Converts raw column values (in [`columns`](Self::columns) order) into
    /// the model value.
    fn to_model(&self, raw: &[Value]) -> OrmResult<Value>;

    /// Follows the relation named by the first segment of `path`.
    ///
    /// Returns `None` for plain fields or when the segment does not name
    /// this field.
    fn traverse_field(&self, _path: &str) -> Option<Traversal> {
        None
    }
}
