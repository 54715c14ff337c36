//! Bulk database operations.
//!
//! `bulk_create` packs many instances into multi-row INSERT statements and
//! `bulk_update` issues one UPDATE per instance; both run in a single
//! transaction. Neither runs instance save hooks.

use std::sync::Arc;

use relorm_core::{OrmError, OrmResult};

use super::crawler::PK;
use super::executor::{execute, insert_columns, log_statement};
use super::lookups::Q;
use super::spec::QuerySpec;
use crate::fields::Field;
use crate::instance::Instance;
use crate::model::ModelMeta;
use crate::orm::Orm;
use crate::transactions::atomic;
use crate::value::Value;

/// Options for `bulk_create` operations.
#[derive(Debug, Clone, Default)]
pub struct BulkCreateOptions {
    /// Number of rows per INSERT statement. `None` uses the engine default.
    pub batch_size: Option<usize>,
}

/// Options for `bulk_update` operations.
#[derive(Debug, Clone, Default)]
pub struct BulkUpdateOptions {
    /// Fields written for every instance; empty writes every loaded
    /// non-key field.
    pub fields: Vec<String>,
}

/// Groups instances into runs that insert the same columns, each run cut
/// into chunks of at most `batch_size` rows.
fn insert_batches(
    model: &ModelMeta,
    instances: &[Instance],
    batch_size: usize,
) -> OrmResult<Vec<(Vec<String>, Vec<Vec<Value>>)>> {
    let mut batches: Vec<(Vec<String>, Vec<Vec<Value>>)> = Vec::new();
    for instance in instances {
        if instance.model().name != model.name {
            return Err(OrmError::QuerySetError(format!(
                "Cannot bulk create {} instances through {}",
                instance.model().name,
                model.name
            )));
        }
        let (columns, values) = insert_columns(model, instance)?;
        match batches.last_mut() {
            Some((cols, rows)) if *cols == columns && rows.len() < batch_size => rows.push(values),
            _ => batches.push((columns, vec![values])),
        }
    }
    Ok(batches)
}

/// Inserts `instances` with multi-row INSERTs in one transaction and
/// returns the number of rows written.
///
/// Instances with an explicit primary key are marked persisted; generated
/// keys are not read back.
pub(crate) async fn bulk_create(
    orm: &Orm,
    model: &Arc<ModelMeta>,
    spec: &QuerySpec,
    instances: &[Instance],
    options: &BulkCreateOptions,
) -> OrmResult<u64> {
    if instances.is_empty() {
        return Ok(0);
    }
    let batch_size = options
        .batch_size
        .unwrap_or(orm.settings().default_batch_size)
        .max(1);
    let batches = insert_batches(model, instances, batch_size)?;
    let alias = spec.using_database.as_deref().unwrap_or(&model.database);
    let conn = orm.connection(alias)?;
    let written = atomic(conn.as_ref(), |txn| async move {
        let compiler = orm.compiler(txn.backend_type());
        let mut written = 0;
        for (columns, rows) in &batches {
            let (sql, params) = compiler.build_insert(spec, model, columns, rows)?;
            log_statement(&sql, params.len());
            txn.execute(&sql, &params).await?;
            written += rows.len() as u64;
        }
        Ok(written)
    })
    .await?;
    for instance in instances {
        if !instance.pk_key().is_null() {
            instance.set_persisted(true);
        }
    }
    tracing::debug!(model = %model.name, rows = written, "relorm.bulk_create");
    Ok(written)
}

/// Writes `options.fields` of every instance, one UPDATE per instance, in a
/// single transaction. Returns the number of rows updated.
pub(crate) async fn bulk_update(
    orm: &Orm,
    model: &Arc<ModelMeta>,
    spec: &QuerySpec,
    instances: &[Instance],
    options: &BulkUpdateOptions,
) -> OrmResult<u64> {
    let mut fields = Vec::new();
    for name in &options.fields {
        let field = model.field_or_err(name)?;
        if field.primary_key || !field.is_concrete() {
            return Err(OrmError::QuerySetError(format!(
                "bulk_update() can only write non-key concrete fields; '{name}' is not one"
            )));
        }
        fields.push(field);
    }
    let mut statements = Vec::with_capacity(instances.len());
    for instance in instances {
        if instance.pk_key().is_null() {
            return Err(OrmError::QuerySetError(format!(
                "All {} instances passed to bulk_update() must have a primary key",
                model.name
            )));
        }
        let mut assignments = Vec::new();
        if fields.is_empty() {
            let loaded = instance.values();
            for field in model.concrete_fields().filter(|f| !f.primary_key) {
                if let Some(value) = loaded.get(&field.name) {
                    assignments.extend(field.clean(value)?);
                }
            }
        } else {
            for field in &fields {
                assignments.extend(field.clean(&instance.get(&field.name)?)?);
            }
        }
        if assignments.is_empty() {
            continue;
        }
        let mut one = spec.clone();
        one.filters.push(Q::kw(PK, instance.pk()));
        statements.push((one, assignments));
    }
    if statements.is_empty() {
        return Ok(0);
    }
    let alias = spec.using_database.as_deref().unwrap_or(&model.database);
    let conn = orm.connection(alias)?;
    let updated = atomic(conn.as_ref(), |txn| async move {
        let compiler = orm.compiler(txn.backend_type());
        let mut updated = 0;
        for (one, assignments) in &statements {
            let (sql, params) = compiler.build_update(one, model, assignments)?;
            updated += execute(txn, &sql, &params).await?;
        }
        Ok(updated)
    })
    .await?;
    tracing::debug!(model = %model.name, rows = updated, "relorm.bulk_update");
    Ok(updated)
}
