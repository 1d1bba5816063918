//! Where-clause transform: REST query to storage predicate.
//!
//! Operator documents are processed in reverse lexical key order, so that
//! `$regex` is already present when `$options` is seen and `$nearSphere`
//! when a `$maxDistance*` key is seen.

use basalt_core::geo::{applicable_distance_key, distance_in_radians, MAX_DISTANCE_KEYS};
use basalt_core::{ClassSchema, Error, FieldType, Map, Result, SubqueryOp, Value, Where};
use regex::Regex;

use super::coders::{coder_for, encode_field, encode_interior, parse_timestamp, point_to_storage};
use super::keys::{storage_key, DATE_KEYS};
use crate::storage::{Document, StorageQuery, StorageValue};

/// Transforms a fully resolved where-clause.
///
/// # Errors
///
/// - `InvalidJson` for an unsupported top-level operator, an unknown
///   constraint operator or an operand of the wrong shape
/// - `InvalidQuery` for a malformed `$or`/`$and`, a bad `$regex`/`$options`
///   pair or a distance without `$nearSphere`
/// - `CommandUnavailable` for sub-query operators that should have been
///   resolved by the compiler
pub fn transform_where(schema: &ClassSchema, query: &Where) -> Result<StorageQuery> {
    let mut out = StorageQuery::new();
    for (key, value) in query {
        let (stored_key, stored) = transform_key_value(schema, key, value)?;
        out.insert(stored_key, stored);
    }
    Ok(out)
}

fn transform_key_value(
    schema: &ClassSchema,
    key: &str,
    value: &Value,
) -> Result<(String, StorageValue)> {
    match key {
        "$or" | "$and" => {
            let branches = value.as_array().ok_or_else(|| {
                Error::InvalidQuery(format!("bad {key} format - use an array value"))
            })?;
            let stored = branches
                .iter()
                .map(|branch| {
                    let branch = branch.as_object().ok_or_else(|| {
                        Error::InvalidQuery(format!("bad {key} format - use an array of objects"))
                    })?;
                    transform_where(schema, branch).map(StorageValue::Document)
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((key.to_string(), StorageValue::Array(stored)))
        }
        op if op.starts_with('$') => Err(Error::InvalidJson(format!(
            "unsupported top-level operator: {op}"
        ))),
        _ => {
            let field_type = schema.field(key);
            let stored_key = storage_key(schema, key);
            let stored = match value {
                Value::Object(ops) if value.is_operator_object() => {
                    StorageValue::Document(transform_constraint(key, field_type, ops)?)
                }
                Value::Array(_) => encode_operand(key, field_type, value)?,
                atom if matches!(field_type, Some(FieldType::Array)) => {
                    let mut all = Document::new();
                    let element = encode_interior(atom)?;
                    all.insert("$all".to_string(), StorageValue::Array(vec![element]));
                    StorageValue::Document(all)
                }
                atom => encode_operand(key, field_type, atom)?,
            };
            Ok((stored_key, stored))
        }
    }
}

/// Encodes a comparison operand for `key`.
///
/// Elements compared against an Array field use the interior encoding. Date
/// fields also accept ISO strings. Other special-typed fields only accept
/// operands of their own type (or `null`), so a query cannot reach the
/// encoded form directly.
fn encode_operand(
    key: &str,
    field_type: Option<&FieldType>,
    value: &Value,
) -> Result<StorageValue> {
    let is_date = DATE_KEYS.contains(&key) || matches!(field_type, Some(FieldType::Date));
    if let (true, Value::String(text)) = (is_date, value) {
        return parse_timestamp(text).map(StorageValue::Timestamp);
    }
    match field_type {
        Some(FieldType::Array) => encode_interior(value),
        Some(declared) => match coder_for(declared) {
            Some(coder) if !value.is_null() => coder.to_storage(value),
            _ => encode_field(value, field_type),
        },
        None => encode_field(value, field_type),
    }
}

fn operand_list(
    key: &str,
    op: &str,
    field_type: Option<&FieldType>,
    operand: &Value,
) -> Result<StorageValue> {
    let items = operand
        .as_array()
        .ok_or_else(|| Error::InvalidJson(format!("bad {op} value")))?;
    items
        .iter()
        .map(|item| encode_operand(key, field_type, item))
        .collect::<Result<Vec<_>>>()
        .map(StorageValue::Array)
}

fn transform_constraint(key: &str, field_type: Option<&FieldType>, ops: &Map) -> Result<Document> {
    let distance_key = applicable_distance_key(ops.keys().map(String::as_str));
    let mut out = Document::new();
    for (op, operand) in ops.iter().rev() {
        let op = op.as_str();
        let stored = match op {
            "$lt" | "$lte" | "$gt" | "$gte" | "$ne" | "$eq" => {
                encode_operand(key, field_type, operand)?
            }
            "$in" | "$nin" => operand_list(key, op, field_type, operand)?,
            "$all" => operand_list(key, op, Some(&FieldType::Array), operand)?,
            "$exists" => StorageValue::Bool(
                operand
                    .as_bool()
                    .ok_or_else(|| Error::InvalidJson("bad $exists value".to_string()))?,
            ),
            "$regex" => {
                if field_type.and_then(coder_for).is_some() {
                    return Err(Error::InvalidJson(format!(
                        "bad $regex: {key} is not a string field"
                    )));
                }
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| Error::InvalidJson("bad $regex value".to_string()))?;
                Regex::new(pattern).map_err(|e| Error::InvalidQuery(format!("bad $regex: {e}")))?;
                StorageValue::String(pattern.to_string())
            }
            "$options" => {
                let options = operand
                    .as_str()
                    .filter(|o| {
                        !o.is_empty() && o.chars().all(|c| matches!(c, 'i' | 'm' | 'x' | 's'))
                    })
                    .ok_or_else(|| Error::InvalidQuery("got a bad $options".to_string()))?;
                if !out.contains_key("$regex") {
                    return Err(Error::InvalidQuery(
                        "got a bad $options: $regex is required".to_string(),
                    ));
                }
                StorageValue::String(options.to_string())
            }
            "$nearSphere" => match operand {
                Value::GeoPoint(point) => point_to_storage(point),
                _ => return Err(Error::InvalidJson("bad $nearSphere value".to_string())),
            },
            op if MAX_DISTANCE_KEYS.contains(&op) => {
                let distance = operand
                    .as_f64()
                    .ok_or_else(|| Error::InvalidJson(format!("bad {op} value")))?;
                if !out.contains_key("$nearSphere") {
                    return Err(Error::InvalidQuery(format!("{op} requires $nearSphere")));
                }
                if distance_key == Some(op) {
                    out.insert(
                        "$maxDistance".to_string(),
                        StorageValue::Float(distance_in_radians(op, distance)),
                    );
                }
                continue;
            }
            "$within" => {
                out.insert("$geoWithin".to_string(), transform_box(operand)?);
                continue;
            }
            other if SubqueryOp::from_key(other).is_some() => {
                return Err(Error::CommandUnavailable(format!(
                    "{other} must be resolved before reaching storage"
                )))
            }
            other => return Err(Error::InvalidJson(format!("bad constraint: {other}"))),
        };
        out.insert(op.to_string(), stored);
    }
    Ok(out)
}

/// `{"$box": [sw, ne]}` with geo points to the storage box instruction.
fn transform_box(operand: &Value) -> Result<StorageValue> {
    let corners = operand
        .as_object()
        .and_then(|o| o.get("$box"))
        .and_then(Value::as_array)
        .map(Vec::as_slice);
    match corners {
        Some([Value::GeoPoint(sw), Value::GeoPoint(ne)]) => {
            let mut doc = Document::new();
            doc.insert(
                "$box".to_string(),
                StorageValue::Array(vec![point_to_storage(sw), point_to_storage(ne)]),
            );
            Ok(StorageValue::Document(doc))
        }
        _ => Err(Error::InvalidJson("bad $within $box value".to_string())),
    }
}
