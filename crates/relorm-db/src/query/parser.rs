//! Turning rows into instances.
//!
//! The parser reads rows through a [`RowLayout`], reusing instances from a
//! [`ResultCache`] so that one primary key maps to one live instance for
//! the lifetime of a result set.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use relorm_core::OrmResult;

use super::compiler::{ModelSlot, RowLayout};
use super::crawler::LOOKUP_SEP;
use super::spec::EmbedParent;
use crate::fields::Field;
use crate::instance::{Instance, Related};
use crate::row::Row;
use crate::value::{PkKey, Value};

/// Instances by `(model name, primary key)`.
#[derive(Default)]
pub struct ResultCache {
    entries: HashMap<(String, PkKey), Instance>,
}

impl ResultCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached instance for a key.
    pub fn get(&self, model: &str, key: &PkKey) -> Option<&Instance> {
        self.entries.get(&(model.to_string(), key.clone()))
    }

    /// Caches an instance under its current primary key.
    pub fn insert(&mut self, instance: &Instance) {
        let key = instance.pk_key();
        if !key.is_null() {
            self.entries
                .insert((instance.model().name.clone(), key), instance.clone());
        }
    }

    /// Number of cached instances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One parsed row.
#[derive(Debug, Clone)]
pub struct ParsedRow {
    /// The root instance.
    pub instance: Instance,
    /// The prefetch key, when the layout carries key columns.
    pub key: Option<PkKey>,
}

fn hydrate_slot(row: &Row, slot: &ModelSlot, cache: &mut ResultCache) -> OrmResult<Option<Instance>> {
    if slot.pk.iter().all(|&i| row.value_at(i).is_null()) {
        return Ok(None);
    }
    let mut values = HashMap::with_capacity(slot.fields.len());
    let mut key_parts = Vec::new();
    for sf in &slot.fields {
        let field = slot.model.field_or_err(&sf.name)?;
        let raw: Vec<Value> = sf.indexes.iter().map(|&i| row.value_at(i).clone()).collect();
        let value = field.to_model(&raw)?;
        if field.primary_key {
            key_parts.extend(value.as_parts().iter().cloned());
        }
        values.insert(sf.name.clone(), value);
    }
    let key = PkKey::from_values(&key_parts);
    if let Some(existing) = cache.get(&slot.model.name, &key) {
        let existing = existing.clone();
        existing.fill(values);
        return Ok(Some(existing));
    }
    let deferred: BTreeSet<String> = slot.deferred.iter().cloned().collect();
    let instance = Instance::hydrate(slot.model.clone(), values, deferred);
    cache.insert(&instance);
    Ok(Some(instance))
}

/// Parses rows into root instances, attaching joined relations and extra
/// columns. One entry is returned per row; roots repeat when a to-many
/// relation was joined.
pub fn parse_rows(rows: &[Row], layout: &RowLayout, cache: &mut ResultCache) -> OrmResult<Vec<ParsedRow>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(root) = hydrate_slot(row, &layout.root, cache)? else {
            continue;
        };
        let mut by_path: HashMap<&str, Option<Instance>> = HashMap::new();
        by_path.insert("", Some(root.clone()));
        for joined in &layout.joined {
            let parent = by_path.get(joined.parent.as_str()).cloned().flatten();
            let child = match &parent {
                Some(_) => hydrate_slot(row, &joined.slot, cache)?,
                None => None,
            };
            if let Some(parent) = &parent {
                if joined.many {
                    parent.push_related(&joined.field, child.clone());
                } else {
                    parent.attach(&joined.field, Related::One(child.clone()));
                }
            }
            by_path.insert(joined.path.as_str(), child);
        }
        for (label, idx) in &layout.extras {
            root.set_extra(label, row.value_at(*idx).clone());
        }
        let key = if layout.keys.is_empty() {
            None
        } else {
            let parts = layout
                .keys
                .iter()
                .zip(&layout.key_types)
                .map(|(&i, ty)| ty.to_model(row.value_at(i)))
                .collect::<OrmResult<Vec<_>>>()?;
            Some(PkKey::from_values(&parts))
        };
        out.push(ParsedRow {
            instance: root,
            key,
        });
    }
    Ok(out)
}

/// Parses `values()` rows into label-to-value maps.
pub fn parse_values(rows: &[Row], layout: &RowLayout) -> OrmResult<Vec<BTreeMap<String, Value>>> {
    rows.iter()
        .map(|row| {
            layout
                .values
                .iter()
                .map(|col| {
                    let parts = col
                        .indexes
                        .iter()
                        .zip(&col.types)
                        .map(|(&i, ty)| ty.to_model(row.value_at(i)))
                        .collect::<OrmResult<Vec<_>>>()?;
                    let value = if parts.len() == 1 {
                        parts.into_iter().next().unwrap_or(Value::Null)
                    } else if parts.iter().all(Value::is_null) {
                        Value::Null
                    } else {
                        Value::List(parts)
                    };
                    Ok((col.label.clone(), value))
                })
                .collect()
        })
        .collect()
}

/// Keeps the first instance per model and primary key. Instances without
/// a primary key are all kept.
pub fn unique(instances: impl IntoIterator<Item = Instance>) -> Vec<Instance> {
    let mut seen: HashSet<(String, PkKey)> = HashSet::new();
    instances
        .into_iter()
        .filter(|inst| {
            let key = inst.pk_key();
            key.is_null() || seen.insert((inst.model().name.clone(), key))
        })
        .collect()
}

/// Unwraps each root to the instance at `embed.path`; roots where the path
/// leads nowhere are dropped. With `reattach`, the unwrapped instance holds
/// its root under that name and the root keeps a weak back-reference.
pub fn embed(roots: &[Instance], embed: &EmbedParent) -> Vec<Instance> {
    let mut out = Vec::with_capacity(roots.len());
    for root in roots {
        let mut current = Some(root.clone());
        let mut last_segment = "";
        for segment in embed.path.split(LOOKUP_SEP) {
            current = current.and_then(|c| c.related_one(segment));
            last_segment = segment;
        }
        let Some(target) = current else {
            continue;
        };
        if let Some(attr) = &embed.reattach {
            target.attach(attr, Related::One(Some(root.clone())));
            if !embed.path.contains(LOOKUP_SEP) {
                root.attach(last_segment, Related::Back(target.downgrade()));
            }
        }
        out.push(target);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::connection::DatabaseBackendType;
    use crate::fields::{FieldDef, FieldType};
    use crate::model::ModelBuilder;
    use crate::query::compiler::Compiler;
    use crate::query::operators::OperatorTable;
    use crate::query::spec::QuerySpec;
    use crate::registry::{ModelRegistry, Registry};

    fn registry() -> Arc<Registry> {
        let mut reg = ModelRegistry::new();
        reg.register(
            ModelBuilder::new("User")
                .field(FieldDef::new("name", FieldType::CharField))
                .build()
                .unwrap(),
        )
        .unwrap();
        reg.register(
            ModelBuilder::new("Post")
                .field(FieldDef::new("title", FieldType::CharField))
                .field(FieldDef::foreign_key("author", "User").nullable().related_name("posts"))
                .build()
                .unwrap(),
        )
        .unwrap();
        reg.freeze().unwrap()
    }

    fn layout(model: &str, spec: &QuerySpec) -> RowLayout {
        let reg = registry();
        let ops = OperatorTable::with_defaults();
        Compiler::new(&reg, &ops, DatabaseBackendType::SQLite, None)
            .build_select(spec, reg.get(model).unwrap())
            .unwrap()
            .layout
    }

    fn row(labels: &[String], values: Vec<Value>) -> Row {
        Row::new(labels.to_vec(), values)
    }

    #[test]
    fn test_same_pk_same_instance() {
        let layout = layout("User", &QuerySpec::default());
        let rows = vec![
            row(&layout.labels, vec![1.into(), "ann".into()]),
            row(&layout.labels, vec![1.into(), "ann".into()]),
            row(&layout.labels, vec![2.into(), "bob".into()]),
        ];
        let mut cache = ResultCache::new();
        let parsed = parse_rows(&rows, &layout, &mut cache).unwrap();
        assert_eq!(parsed.len(), 3);
        assert!(parsed[0].instance.ptr_eq(&parsed[1].instance));
        assert!(!parsed[0].instance.ptr_eq(&parsed[2].instance));
        assert_eq!(cache.len(), 2);
        let roots = unique(parsed.into_iter().map(|p| p.instance));
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn test_unique_keys_on_model_and_pk() {
        let reg = registry();
        let user = |pk: i64| {
            let inst = Instance::new(Arc::clone(reg.get("User").unwrap()));
            inst.set("id", pk).unwrap();
            inst
        };
        let post = Instance::new(Arc::clone(reg.get("Post").unwrap()));
        post.set("id", 1).unwrap();
        let draft = || Instance::new(Arc::clone(reg.get("Post").unwrap()));

        let kept = unique(vec![user(1), user(2), user(1), post.clone(), draft(), draft()]);
        assert_eq!(kept.len(), 5);
        assert_eq!(kept[2].model().name, "Post");
        assert!(kept[2].ptr_eq(&post));
    }

    #[test]
    fn test_select_related_attaches_and_handles_null() {
        let spec = QuerySpec {
            select_related: vec!["author".into()],
            ..QuerySpec::default()
        };
        let layout = layout("Post", &spec);
        let rows = vec![
            row(&layout.labels, vec![10.into(), "a".into(), 1.into(), 1.into(), "ann".into()]),
            row(&layout.labels, vec![11.into(), "b".into(), Value::Null, Value::Null, Value::Null]),
        ];
        let mut cache = ResultCache::new();
        let parsed = parse_rows(&rows, &layout, &mut cache).unwrap();
        let author = parsed[0].instance.related_one("author").unwrap();
        assert_eq!(author.get("name").unwrap(), Value::from("ann"));
        assert!(matches!(parsed[1].instance.related("author"), Some(Related::One(None))));
    }

    #[test]
    fn test_reverse_join_collects_children() {
        let spec = QuerySpec {
            select_related: vec!["posts".into()],
            ..QuerySpec::default()
        };
        let layout = layout("User", &spec);
        let rows = vec![
            row(&layout.labels, vec![1.into(), "ann".into(), 10.into(), "a".into(), 1.into()]),
            row(&layout.labels, vec![1.into(), "ann".into(), 11.into(), "b".into(), 1.into()]),
            row(&layout.labels, vec![2.into(), "bob".into(), Value::Null, Value::Null, Value::Null]),
        ];
        let mut cache = ResultCache::new();
        let parsed = parse_rows(&rows, &layout, &mut cache).unwrap();
        let roots = unique(parsed.into_iter().map(|p| p.instance));
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].related_many("posts").unwrap().len(), 2);
        assert!(roots[1].related_many("posts").unwrap().is_empty());
    }

    #[test]
    fn test_partial_rows_produce_proxies_and_fill_from_cache() {
        let only = QuerySpec {
            only: vec!["id".into()],
            ..QuerySpec::default()
        };
        let partial = layout("User", &only);
        let full = layout("User", &QuerySpec::default());
        let mut cache = ResultCache::new();

        let first = parse_rows(&[row(&partial.labels, vec![1.into()])], &partial, &mut cache).unwrap();
        let proxy = first[0].instance.clone();
        assert!(proxy.is_proxy());

        let second = parse_rows(&[row(&full.labels, vec![1.into(), "ann".into()])], &full, &mut cache).unwrap();
        assert!(second[0].instance.ptr_eq(&proxy));
        assert!(!proxy.is_proxy());
        assert_eq!(proxy.get("name").unwrap(), Value::from("ann"));
    }

    #[test]
    fn test_embed_with_reattach() {
        let spec = QuerySpec {
            select_related: vec!["author".into()],
            ..QuerySpec::default()
        };
        let layout = layout("Post", &spec);
        let rows = vec![row(&layout.labels, vec![10.into(), "a".into(), 1.into(), 1.into(), "ann".into()])];
        let mut cache = ResultCache::new();
        let roots: Vec<Instance> = parse_rows(&rows, &layout, &mut cache)
            .unwrap()
            .into_iter()
            .map(|p| p.instance)
            .collect();
        let embedded = embed(
            &roots,
            &EmbedParent {
                path: "author".into(),
                reattach: Some("via".into()),
            },
        );
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].model().name, "User");
        assert!(embedded[0].related_one("via").unwrap().ptr_eq(&roots[0]));
        assert!(roots[0].related_one("author").unwrap().ptr_eq(&embedded[0]));
    }
}
