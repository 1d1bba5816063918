//! Evaluation of storage predicates against stored documents.
//!
//! Used by [`MemoryStorage`](super::MemoryStorage) and by anything else that
//! needs to decide a predicate without a database. Semantics match the
//! in-memory live matcher on decoded JSON for every operator both support:
//! a missing field never equals a literal (not even `null`), `$ne`/`$nin`
//! accept a missing field, comparisons stay within one type domain and never
//! look inside arrays.

use std::cmp::Ordering;

use basalt_core::GeoPoint;
use regex::RegexBuilder;
use tracing::debug;

use super::document::{Document, StorageQuery, StorageValue};

/// Whether `doc` satisfies `query`.
#[must_use]
pub fn matches(doc: &Document, query: &StorageQuery) -> bool {
    query
        .iter()
        .all(|(key, constraint)| matches_key(doc, key, constraint))
}

/// Resolves a possibly dotted key through nested documents.
#[must_use]
pub fn lookup<'a>(doc: &'a Document, key: &str) -> Option<&'a StorageValue> {
    let mut segments = key.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_document()?.get(segment)?;
    }
    Some(current)
}

fn matches_key(doc: &Document, key: &str, constraint: &StorageValue) -> bool {
    match key {
        "$or" => subqueries(constraint).is_some_and(|qs| qs.iter().any(|q| matches(doc, q))),
        "$and" => subqueries(constraint).is_some_and(|qs| qs.iter().all(|q| matches(doc, q))),
        op if op.starts_with('$') => {
            debug!(operator = op, "unknown top-level storage operator");
            false
        }
        _ => matches_constraint(lookup(doc, key), constraint),
    }
}

fn subqueries(value: &StorageValue) -> Option<Vec<&Document>> {
    value
        .as_array()?
        .iter()
        .map(StorageValue::as_document)
        .collect()
}

fn is_operator_document(value: &StorageValue) -> bool {
    value
        .as_document()
        .is_some_and(|doc| !doc.is_empty() && doc.keys().all(|k| k.starts_with('$')))
}

fn matches_constraint(field: Option<&StorageValue>, constraint: &StorageValue) -> bool {
    match constraint {
        StorageValue::Document(ops) if is_operator_document(constraint) => ops
            .iter()
            .all(|(op, operand)| matches_operator(field, op, operand, ops)),
        literal => equals_or_contains(field, literal),
    }
}

fn equals_or_contains(field: Option<&StorageValue>, expected: &StorageValue) -> bool {
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

fn compares(
    field: Option<&StorageValue>,
    operand: &StorageValue,
    accept: fn(Ordering) -> bool,
) -> bool {
    field
        .and_then(|value| value.compare(operand))
        .is_some_and(accept)
}

fn matches_operator(
    field: Option<&StorageValue>,
    op: &str,
    operand: &StorageValue,
    siblings: &Document,
) -> bool {
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
            (Some(StorageValue::Array(items)), Some(list)) => {
                list.iter().all(|e| items.iter().any(|item| item.query_eq(e)))
            }
            _ => false,
        },
        "$exists" => operand
            .as_bool()
            .is_some_and(|want| want == field.is_some()),
        "$regex" => {
            let options = siblings.get("$options").and_then(StorageValue::as_str);
            match (field.and_then(StorageValue::as_str), operand.as_str()) {
                (Some(text), Some(pattern)) => regex_matches(pattern, options.unwrap_or(""), text),
                _ => false,
            }
        }
        "$options" | "$maxDistance" => true,
        "$nearSphere" => match (field.and_then(as_point), as_point(operand)) {
            (Some(point), Some(center)) => {
                let max = siblings.get("$maxDistance").and_then(StorageValue::as_f64);
                max.is_none_or(|max| point.radians_to(&center) <= max)
            }
            _ => false,
        },
        "$geoWithin" => match (field.and_then(as_point), box_corners(operand)) {
            (Some(point), Some((sw, ne))) => point.within_box(&sw, &ne),
            _ => false,
        },
        other => {
            debug!(operator = other, "unknown storage operator");
            false
        }
    }
}

fn regex_matches(pattern: &str, options: &str, text: &str) -> bool {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .ignore_whitespace(options.contains('x'))
        .dot_matches_new_line(options.contains('s'))
        .build()
        .is_ok_and(|re| re.is_match(text))
}

/// A `[longitude, latitude]` pair.
fn as_point(value: &StorageValue) -> Option<GeoPoint> {
    match value.as_array()?.as_slice() {
        [lon, lat] => Some(GeoPoint::new(lon.as_f64()?, lat.as_f64()?)),
        _ => None,
    }
}

fn box_corners(operand: &StorageValue) -> Option<(GeoPoint, GeoPoint)> {
    match operand.as_document()?.get("$box")?.as_array()?.as_slice() {
        [sw, ne] => Some((as_point(sw)?, as_point(ne)?)),
        _ => None,
    }
}
