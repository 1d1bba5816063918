//! In-memory query evaluation over decoded JSON objects.
//!
//! Used on the write path to decide live-query delivery without a storage
//! round-trip. It covers a subset of the storage constraint semantics:
//! literal equality (including element-of-array membership),
//! `$eq/$ne/$lt/$lte/$gt/$gte/$in/$nin/$all/$exists/$regex`,
//! `$nearSphere` with the `$maxDistance*` family, `$within {$box}`, `$or`
//! and `$and`. For that subset the result must agree with the storage
//! evaluator run on the encoded object and transformed query. Dates match
//! by instant, including against ISO strings.
//!
//! Sub-query and relation operators (`$select`, `$dontSelect`, `$inQuery`,
//! `$notInQuery`, `$relatedTo`) and any unknown operator never match.

use std::cmp::Ordering;

use regex::Regex;
use tracing::debug;

use crate::geo::{applicable_distance_key, distance_in_radians};
use crate::messages::EventOp;
use crate::query::Where;
use crate::types::{GeoPoint, Map, Value};

/// Whether `object` satisfies every constraint of `query`.
#[must_use]
pub fn matches_query(object: &Map, query: &Where) -> bool {
    query
        .iter()
        .all(|(key, constraint)| matches_key(object, key, constraint))
}

/// Event to emit for a saved object, given whether its previous version
/// matched (`None` for a newly created object) and whether it matches now.
#[must_use]
pub fn classify_save(original_matched: Option<bool>, current_matched: bool) -> Option<EventOp> {
    match (original_matched, current_matched) {
        (None, true) => Some(EventOp::Create),
        (Some(true), true) => Some(EventOp::Update),
        (Some(false), true) => Some(EventOp::Enter),
        (Some(true), false) => Some(EventOp::Leave),
        (None | Some(false), false) => None,
    }
}

/// Resolves a possibly dotted key through nested objects.
#[must_use]
pub fn lookup<'a>(object: &'a Map, key: &str) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let mut current = object.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn matches_key(object: &Map, key: &str, constraint: &Value) -> bool {
    match key {
        "$or" => {
            each_subquery(constraint).is_some_and(|mut qs| qs.any(|q| matches_query(object, q)))
        }
        "$and" => {
            each_subquery(constraint).is_some_and(|mut qs| qs.all(|q| matches_query(object, q)))
        }
        op if op.starts_with('$') => {
            debug!(operator = op, "top-level operator not supported by live matching");
            false
        }
        _ => matches_constraint(lookup(object, key), constraint),
    }
}

/// Sub-queries of `$or`/`$and`; `None` if any element is not an object.
fn each_subquery(value: &Value) -> Option<impl Iterator<Item = &Map>> {
    let items = value.as_array()?;
    if items.iter().any(|q| q.as_object().is_none()) {
        return None;
    }
    Some(items.iter().filter_map(Value::as_object))
}

fn matches_constraint(field: Option<&Value>, constraint: &Value) -> bool {
    match constraint {
        Value::Object(ops) if constraint.is_operator_object() => ops
            .iter()
            .all(|(op, operand)| matches_operator(field, op, operand, ops)),
        literal => equals_or_contains(field, literal),
    }
}

/// Equality, where an array field also matches when one element is equal.
fn equals_or_contains(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => false,
        Some(value) => {
            value.query_eq(expected)
                || value
                    .as_array()
                    .is_some_and(|items| items.iter().any(|item| item.query_eq(expected)))
        }
    }
}

fn compares(field: Option<&Value>, operand: &Value, accept: fn(Ordering) -> bool) -> bool {
    field
        .and_then(|value| value.compare(operand))
        .is_some_and(accept)
}

fn matches_operator(field: Option<&Value>, op: &str, operand: &Value, siblings: &Map) -> bool {
    match op {
        "$eq" => equals_or_contains(field, operand),
        "$ne" => !equals_or_contains(field, operand),
        "$lt" => compares(field, operand, Ordering::is_lt),
        "$lte" => compares(field, operand, Ordering::is_le),
        "$gt" => compares(field, operand, Ordering::is_gt),
        "$gte" => compares(field, operand, Ordering::is_ge),
        "$in" => operand
            .as_array()
            .is_some_and(|list| list.iter().any(|e| equals_or_contains(field, e))),
        "$nin" => operand
            .as_array()
            .is_some_and(|list| !list.iter().any(|e| equals_or_contains(field, e))),
        "$all" => match (field, operand.as_array()) {
            (Some(Value::Array(items)), Some(list)) => {
                list.iter().all(|e| items.iter().any(|item| item.query_eq(e)))
            }
            _ => false,
        },
        "$exists" => operand.as_bool().is_some_and(|want| want == field.is_some()),
        "$regex" => match (field.and_then(Value::as_str), operand.as_str()) {
            (Some(text), Some(pattern)) => Regex::new(pattern).is_ok_and(|re| re.is_match(text)),
            _ => false,
        },
        // Consumed by $regex and $nearSphere respectively.
        "$options"
        | "$maxDistance"
        | "$maxDistanceInRadians"
        | "$maxDistanceInMiles"
        | "$maxDistanceInKilometers" => true,
        "$nearSphere" => match (field, operand) {
            (Some(Value::GeoPoint(point)), Value::GeoPoint(center)) => {
                max_distance(siblings).is_none_or(|max| point.radians_to(center) <= max)
            }
            _ => false,
        },
        "$within" => match (field, box_corners(operand)) {
            (Some(Value::GeoPoint(point)), Some((sw, ne))) => point.within_box(&sw, &ne),
            _ => false,
        },
        other => {
            debug!(operator = other, "constraint not supported by live matching");
            false
        }
    }
}

/// Maximum `$nearSphere` distance in radians, from the distance key that
/// takes precedence.
fn max_distance(siblings: &Map) -> Option<f64> {
    let key = applicable_distance_key(siblings.keys().map(String::as_str))?;
    siblings
        .get(key)
        .and_then(Value::as_f64)
        .map(|amount| distance_in_radians(key, amount))
}

fn box_corners(operand: &Value) -> Option<(GeoPoint, GeoPoint)> {
    match operand.as_object()?.get("$box")?.as_array()?.as_slice() {
        [Value::GeoPoint(sw), Value::GeoPoint(ne)] => Some((*sw, *ne)),
        _ => None,
    }
}
