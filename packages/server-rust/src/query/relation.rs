//! Relation joins and where-clause relation reduction.
//!
//! Relation membership lives in join classes named
//! `_Join:<field>:<owningClass>` holding `{_id, owningId, relatedId}`
//! documents. Constraints on relation fields and `$relatedTo` are rewritten
//! into `objectId` constraints before the where-clause is transformed.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

use basalt_core::{ClassSchema, Error, Map, Pointer, Result, Value, Where};
use tracing::debug;

use super::write::new_object_id;
use crate::service::ServerContext;
use crate::storage::{adapter_error, find_all, Document, FindOptions, StorageQuery, StorageValue};

pub const OWNING_ID: &str = "owningId";
pub const RELATED_ID: &str = "relatedId";

/// Name of the join class backing `owning_class.field`.
#[must_use]
pub fn join_class(field: &str, owning_class: &str) -> String {
    format!("_Join:{field}:{owning_class}")
}

fn in_query(key: &str, ids: &[String]) -> StorageQuery {
    let mut constraint = Document::new();
    constraint.insert(
        "$in".to_string(),
        StorageValue::Array(ids.iter().cloned().map(StorageValue::String).collect()),
    );
    let mut query = StorageQuery::new();
    query.insert(key.to_string(), StorageValue::Document(constraint));
    query
}

fn edge_query(owning_id: &str, related_id: &str) -> StorageQuery {
    let mut query = StorageQuery::new();
    query.insert(OWNING_ID.to_string(), owning_id.into());
    query.insert(RELATED_ID.to_string(), related_id.into());
    query
}

/// Selects `project` from every join document whose `key` is in `ids`.
async fn join_lookup(
    ctx: &ServerContext,
    join: &str,
    key: &str,
    ids: &[String],
    project: &str,
) -> Result<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let docs = find_all(ctx.storage.as_ref(), join, &in_query(key, ids), ctx.config.page_size)
        .await
        .map_err(|e| adapter_error(&e))?;
    let found: BTreeSet<String> = docs
        .iter()
        .filter_map(|doc| doc.get(project).and_then(StorageValue::as_str))
        .map(str::to_string)
        .collect();
    Ok(found.into_iter().collect())
}

/// Ids related to any of `owning_ids` through `owning_class.field`.
///
/// # Errors
///
/// Returns `InternalServerError` if the adapter fails.
pub async fn related_ids(
    ctx: &ServerContext,
    field: &str,
    owning_class: &str,
    owning_ids: &[String],
) -> Result<Vec<String>> {
    join_lookup(ctx, &join_class(field, owning_class), OWNING_ID, owning_ids, RELATED_ID).await
}

/// Ids of `owning_class` objects whose `field` contains any of `related`.
///
/// # Errors
///
/// Returns `InternalServerError` if the adapter fails.
pub async fn owning_ids(
    ctx: &ServerContext,
    field: &str,
    owning_class: &str,
    related: &[String],
) -> Result<Vec<String>> {
    join_lookup(ctx, &join_class(field, owning_class), RELATED_ID, related, OWNING_ID).await
}

/// Records `related_id` in `owning_class.field` of `owning_id`; a no-op if
/// the edge exists.
///
/// # Errors
///
/// Returns `InternalServerError` if the adapter fails.
pub async fn add_relation(
    ctx: &ServerContext,
    field: &str,
    owning_class: &str,
    owning_id: &str,
    related_id: &str,
) -> Result<()> {
    let join = join_class(field, owning_class);
    let edge = edge_query(owning_id, related_id);
    let existing = ctx
        .storage
        .count(&join, &edge, &FindOptions::default())
        .await
        .map_err(|e| adapter_error(&e))?;
    if existing > 0 {
        return Ok(());
    }
    let mut doc = edge;
    doc.insert("_id".to_string(), new_object_id().into());
    ctx.storage.insert(&join, doc).await.map_err(|e| adapter_error(&e))
}

/// Removes `related_id` from `owning_class.field` of `owning_id`.
///
/// # Errors
///
/// Returns `InternalServerError` if the adapter fails.
pub async fn remove_relation(
    ctx: &ServerContext,
    field: &str,
    owning_class: &str,
    owning_id: &str,
    related_id: &str,
) -> Result<()> {
    ctx.storage
        .delete(&join_class(field, owning_class), &edge_query(owning_id, related_id))
        .await
        .map(|_| ())
        .map_err(|e| adapter_error(&e))
}

/// Removes every edge owned by `owning_id` in each relation of `schema`.
///
/// # Errors
///
/// Returns `InternalServerError` if the adapter fails.
pub async fn clear_relations(
    ctx: &ServerContext,
    schema: &ClassSchema,
    owning_id: &str,
) -> Result<()> {
    for (field, _) in schema.relations() {
        let mut query = StorageQuery::new();
        query.insert(OWNING_ID.to_string(), owning_id.into());
        ctx.storage
            .delete(&join_class(field, &schema.class_name), &query)
            .await
            .map_err(|e| adapter_error(&e))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reduction
// ---------------------------------------------------------------------------

fn pointer_ids(key: &str, value: &Value) -> Result<Vec<String>> {
    let pointer = |v: &Value| match v {
        Value::Pointer(p) => Ok(p.object_id.clone()),
        other => Err(Error::InvalidQuery(format!(
            "{key} is a Relation; expected a Pointer, got {}",
            other.type_name()
        ))),
    };
    match value {
        Value::Array(items) => items.iter().map(pointer).collect(),
        single => Ok(vec![pointer(single)?]),
    }
}

/// Adds `objectId <op> ids` to `where_clause`, intersecting with an existing
/// `$in` and unioning with an existing `$nin`.
fn constrain_object_id(where_clause: &mut Where, op: &str, ids: Vec<String>) {
    let mut ops = match where_clause.remove("objectId") {
        Some(Value::Object(ops)) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
            ops
        }
        Some(literal) => Map::from([("$eq".to_string(), literal)]),
        None => Map::new(),
    };
    let merged: Vec<String> = match (op, ops.get(op).and_then(Value::as_array)) {
        ("$in", Some(existing)) => {
            let existing: BTreeSet<&str> = existing.iter().filter_map(Value::as_str).collect();
            ids.into_iter().filter(|id| existing.contains(id.as_str())).collect()
        }
        (_, Some(existing)) => {
            let mut union: BTreeSet<String> =
                existing.iter().filter_map(Value::as_str).map(str::to_string).collect();
            union.extend(ids);
            union.into_iter().collect()
        }
        (_, None) => ids,
    };
    ops.insert(op.to_string(), Value::Array(merged.into_iter().map(Value::String).collect()));
    where_clause.insert("objectId".to_string(), Value::Object(ops));
}

/// Rewrites `$relatedTo` and constraints on relation fields of `schema` into
/// `objectId` constraints, descending into `$or`/`$and` branches.
///
/// # Errors
///
/// Returns `InvalidQuery` for a malformed `$relatedTo` or an unsupported
/// relation constraint, `InternalServerError` if the adapter fails.
pub fn reduce_relations<'a>(
    ctx: &'a ServerContext,
    schema: &'a ClassSchema,
    where_clause: &'a mut Where,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        for key in ["$or", "$and"] {
            if let Some(Value::Array(branches)) = where_clause.get_mut(key) {
                for branch in branches.iter_mut().filter_map(Value::as_object_mut) {
                    reduce_relations(ctx, schema, branch).await?;
                }
            }
        }

        if let Some(related_to) = where_clause.remove("$relatedTo") {
            let (object, key) = parse_related_to(&related_to)?;
            debug!(class = %object.class_name, key = %key, "reducing $relatedTo");
            let ids = related_ids(ctx, &key, &object.class_name, &[object.object_id]).await?;
            constrain_object_id(where_clause, "$in", ids);
        }

        let fields: Vec<String> = schema
            .relations()
            .map(|(field, _)| field.to_string())
            .filter(|field| where_clause.contains_key(field))
            .collect();
        for field in fields {
            let Some(constraint) = where_clause.remove(&field) else {
                continue;
            };
            let (op, related) = match &constraint {
                Value::Object(ops) if constraint.is_operator_object() => {
                    let mut found = None;
                    for (name, operand) in ops {
                        let op = match name.as_str() {
                            "$eq" | "$in" | "$all" => "$in",
                            "$ne" | "$nin" => "$nin",
                            other => {
                                return Err(Error::InvalidQuery(format!(
                                    "{other} is not supported on relation field {field}"
                                )))
                            }
                        };
                        if found.is_some() {
                            return Err(Error::InvalidQuery(format!(
                                "relation field {field} takes a single constraint"
                            )));
                        }
                        found = Some((op, pointer_ids(&field, operand)?));
                    }
                    found.ok_or_else(|| {
                        Error::InvalidQuery(format!("empty constraint on {field}"))
                    })?
                }
                literal => ("$in", pointer_ids(&field, literal)?),
            };
            let ids = owning_ids(ctx, &field, &schema.class_name, &related).await?;
            constrain_object_id(where_clause, op, ids);
        }
        Ok(())
    })
}

fn parse_related_to(value: &Value) -> Result<(Pointer, String)> {
    let malformed = || {
        Error::InvalidQuery("$relatedTo requires {object: Pointer, key: string}".to_string())
    };
    let map = value.as_object().ok_or_else(malformed)?;
    match (map.get("object"), map.get("key")) {
        (Some(Value::Pointer(object)), Some(Value::String(key))) if map.len() == 2 => {
            Ok((object.clone(), key.clone()))
        }
        _ => Err(malformed()),
    }
}
