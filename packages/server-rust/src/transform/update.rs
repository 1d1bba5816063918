//! Write transform: REST field updates to storage instructions.
//!
//! A REST update maps each field either to a literal (stored with `Set`) or
//! to an `{"__op": ...}` object. Relation edits produce an instruction with
//! no document effect; the write executor maintains the join class from the
//! REST body.

use basalt_core::schema::USER_CLASS;
use basalt_core::{Acl, ClassSchema, Error, FieldType, Map, Result, Value};

use super::acl::transform_acl;
use super::acl::{COMBINED, READ_PERMS, WRITE_PERMS};
use super::coders::{encode_field, encode_interior};
use super::keys::{storage_key, validate_field_name, AUTH_DATA_PREFIX, HASHED_PASSWORD};
use crate::storage::{Document, StorageUpdate, StorageValue, UpdateInstruction};

/// REST fields the server owns.
const READ_ONLY_KEYS: [&str; 2] = ["objectId", "createdAt"];

/// Transforms a REST update body.
///
/// `updatedAt` is ignored; the executor stamps it.
///
/// # Errors
///
/// - `InvalidKeyName` for `objectId`, `createdAt` or an illegal field name
/// - `IncorrectType` for a literal Relation value or a literal on a Relation
///   field
/// - `CommandUnavailable` for an unknown `__op`
/// - `InvalidJson` for a malformed operator or ACL
pub fn transform_update(schema: &ClassSchema, update: &Map) -> Result<StorageUpdate> {
    let mut out = StorageUpdate::new();
    for (key, value) in update {
        match key.as_str() {
            k if READ_ONLY_KEYS.contains(&k) => {
                return Err(Error::InvalidKeyName(format!("{k} cannot be modified")));
            }
            "updatedAt" => {}
            "ACL" => transform_acl_update(value, &mut out)?,
            "authData" => transform_auth_data(value, &mut out)?,
            // Stored verbatim; the embedding service hashes before writing.
            "password" if schema.class_name == USER_CLASS => match value {
                Value::String(password) => {
                    out.set(HASHED_PASSWORD, StorageValue::String(password.clone()));
                }
                Value::Null => out.insert(HASHED_PASSWORD, UpdateInstruction::Unset),
                other => {
                    return Err(Error::IncorrectType(format!(
                        "password must be a string, got {}",
                        other.type_name()
                    )))
                }
            },
            _ => {
                validate_field_name(key)?;
                let instruction = transform_field(schema, key, value)?;
                out.insert(storage_key(schema, key), instruction);
            }
        }
    }
    Ok(out)
}

fn transform_acl_update(value: &Value, out: &mut StorageUpdate) -> Result<()> {
    if value.is_null() {
        for key in [READ_PERMS, WRITE_PERMS, COMBINED] {
            out.insert(key, UpdateInstruction::Unset);
        }
        return Ok(());
    }
    for (key, stored) in transform_acl(&Acl::from_value(value)?).into_fields() {
        out.set(key, stored);
    }
    Ok(())
}

fn transform_auth_data(value: &Value, out: &mut StorageUpdate) -> Result<()> {
    let providers = value
        .as_object()
        .ok_or_else(|| Error::IncorrectType("authData must be an object".to_string()))?;
    for (provider, data) in providers {
        validate_field_name(provider)?;
        let key = format!("{AUTH_DATA_PREFIX}{provider}");
        if data.is_null() {
            out.insert(key, UpdateInstruction::Unset);
        } else {
            out.set(key, encode_interior(data)?);
        }
    }
    Ok(())
}

fn transform_field(schema: &ClassSchema, key: &str, value: &Value) -> Result<UpdateInstruction> {
    if let Some(op) = value.as_object().filter(|m| m.contains_key("__op")) {
        return transform_op(key, op);
    }
    if let Value::Relation { .. } = value {
        return Err(Error::IncorrectType(format!("{key}: a Relation cannot be set directly")));
    }
    if schema.is_relation(key) {
        return Err(Error::IncorrectType(format!(
            "{key} is a Relation; use AddRelation or RemoveRelation"
        )));
    }
    if value.is_null() {
        return Ok(UpdateInstruction::Unset);
    }
    encode_field(value, schema.field(key)).map(UpdateInstruction::Set)
}

fn op_objects<'a>(key: &str, name: &str, op: &'a Map) -> Result<&'a [Value]> {
    op.get("objects")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::InvalidJson(format!("{key}: {name} requires an objects array")))
}

fn encode_objects(key: &str, name: &str, op: &Map) -> Result<Vec<StorageValue>> {
    op_objects(key, name, op)?.iter().map(encode_interior).collect()
}

fn transform_op(key: &str, op: &Map) -> Result<UpdateInstruction> {
    let name = op
        .get("__op")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidJson(format!("{key}: __op must be a string")))?;
    Ok(match name {
        "Increment" => UpdateInstruction::Increment(
            op.get("amount")
                .and_then(Value::as_f64)
                .ok_or_else(|| {
                    Error::InvalidJson(format!("{key}: Increment requires a numeric amount"))
                })?,
        ),
        "Add" => UpdateInstruction::Append(encode_objects(key, name, op)?),
        "AddUnique" => UpdateInstruction::AppendUnique(encode_objects(key, name, op)?),
        "Remove" => UpdateInstruction::RemoveAll(encode_objects(key, name, op)?),
        "Delete" => UpdateInstruction::Unset,
        "AddRelation" | "RemoveRelation" => {
            let objects = op_objects(key, name, op)?;
            let class_name = match objects.first() {
                Some(Value::Pointer(pointer)) => Some(pointer.class_name.clone()),
                Some(other) => {
                    return Err(Error::InvalidJson(format!(
                        "{key}: {name} objects must be Pointers, got {}",
                        other.type_name()
                    )))
                }
                None => None,
            };
            UpdateInstruction::Relation { class_name }
        }
        other => return Err(Error::CommandUnavailable(format!("unknown __op {other} on {key}"))),
    })
}

/// Schema type implied by a REST value, `None` for values that carry no type
/// such as `null` or `Delete`.
fn implied_type(value: &Value) -> Option<FieldType> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(_) => FieldType::Boolean,
        Value::Int(_) | Value::Float(_) => FieldType::Number,
        Value::String(_) => FieldType::String,
        Value::Array(_) => FieldType::Array,
        Value::Object(map) => match map.get("__op").and_then(Value::as_str) {
            None => FieldType::Object,
            Some("Increment") => FieldType::Number,
            Some("Add" | "AddUnique" | "Remove") => FieldType::Array,
            Some("AddRelation" | "RemoveRelation") => {
                let first = map.get("objects").and_then(Value::as_array).and_then(|o| o.first());
                match first {
                    Some(Value::Pointer(pointer)) => FieldType::relation(&pointer.class_name),
                    _ => return None,
                }
            }
            Some(_) => return None,
        },
        Value::Pointer(pointer) => FieldType::pointer(&pointer.class_name),
        Value::Relation { class_name } => FieldType::relation(class_name),
        Value::Date(_) => FieldType::Date,
        Value::Bytes(_) => FieldType::Bytes,
        Value::GeoPoint(_) => FieldType::GeoPoint,
        Value::File(_) => FieldType::File,
    })
}

/// Checks a REST write body against `schema`, returning the fields it would
/// newly declare.
///
/// # Errors
///
/// Returns `IncorrectType` when a value conflicts with a declared type.
pub fn schema_additions(schema: &ClassSchema, body: &Map) -> Result<Vec<(String, FieldType)>> {
    let mut additions = Vec::new();
    for (key, value) in body {
        if matches!(
            key.as_str(),
            "objectId" | "createdAt" | "updatedAt" | "ACL" | "authData" | "password"
        ) {
            continue;
        }
        let Some(implied) = implied_type(value) else {
            continue;
        };
        match schema.field(key) {
            Some(declared) if *declared == implied => {}
            Some(declared) => {
                return Err(Error::IncorrectType(format!(
                    "schema mismatch for {}.{key}; expected {declared:?} but got {implied:?}",
                    schema.class_name
                )))
            }
            None => additions.push((key.clone(), implied)),
        }
    }
    Ok(additions)
}

/// Transforms a REST object body into a new storage document.
///
/// # Errors
///
/// Same as [`transform_update`].
pub fn transform_create(schema: &ClassSchema, object: &Map) -> Result<Document> {
    let update = transform_update(schema, object)?;
    let mut doc = Document::new();
    update.apply_to(&mut doc);
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(j: serde_json::Value) -> Map {
        match Value::from_json(j).unwrap() {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn game() -> ClassSchema {
        ClassSchema::new("Game")
            .with_field("owner", FieldType::pointer(USER_CLASS))
            .with_field("players", FieldType::relation(USER_CLASS))
            .with_field("score", FieldType::Number)
    }

    #[test]
    fn increment_on_empty_and_existing_original() {
        let body = map(json!({"key": {"__op": "Increment", "amount": 10}}));
        let update = transform_update(&game(), &body).unwrap();
        assert_eq!(update.get("key"), Some(&UpdateInstruction::Increment(10.0)));

        let mut empty = Document::new();
        update.apply_to(&mut empty);
        assert_eq!(empty.get("key"), Some(&StorageValue::Float(10.0)));

        let mut existing = Document::new();
        existing.insert("key".to_string(), StorageValue::Int(20));
        update.apply_to(&mut existing);
        assert_eq!(existing.get("key"), Some(&StorageValue::Float(30.0)));
    }

    #[test]
    fn array_operators() {
        let update = transform_update(
            &game(),
            &map(json!({
                "a": {"__op": "Add", "objects": [1]},
                "b": {"__op": "AddUnique", "objects": ["x"]},
                "c": {"__op": "Remove", "objects": [2]},
                "d": {"__op": "Delete"},
            })),
        )
        .unwrap();
        assert_eq!(update.get("a"), Some(&UpdateInstruction::Append(vec![StorageValue::Int(1)])));
        assert_eq!(update.get("b"), Some(&UpdateInstruction::AppendUnique(vec!["x".into()])));
        assert_eq!(
            update.get("c"),
            Some(&UpdateInstruction::RemoveAll(vec![StorageValue::Int(2)]))
        );
        assert_eq!(update.get("d"), Some(&UpdateInstruction::Unset));
    }

    #[test]
    fn relation_ops_collapse() {
        let update = transform_update(
            &game(),
            &map(json!({"players": {"__op": "AddRelation", "objects": [
                {"__type": "Pointer", "className": "_User", "objectId": "u1"}
            ]}})),
        )
        .unwrap();
        assert_eq!(
            update.get("players"),
            Some(&UpdateInstruction::Relation { class_name: Some(USER_CLASS.to_string()) })
        );

        let body = map(json!({"players": {"__op": "RemoveRelation", "objects": []}}));
        let empty = transform_update(&game(), &body).unwrap();
        assert_eq!(empty.get("players"), Some(&UpdateInstruction::Relation { class_name: None }));
    }

    #[test]
    fn rejected_updates() {
        let schema = game();
        let err = |j| transform_update(&schema, &map(j)).unwrap_err();
        assert!(matches!(err(json!({"objectId": "x"})), Error::InvalidKeyName(_)));
        assert!(matches!(err(json!({"createdAt": "x"})), Error::InvalidKeyName(_)));
        assert!(matches!(err(json!({"$set": 1})), Error::InvalidKeyName(_)));
        assert!(matches!(err(json!({"x": {"__op": "Multiply"}})), Error::CommandUnavailable(_)));
        assert!(matches!(
            err(json!({"x": {"__op": "Increment", "amount": "1"}})),
            Error::InvalidJson(_)
        ));
        assert!(matches!(
            err(json!({"players": {"__type": "Relation", "className": "_User"}})),
            Error::IncorrectType(_)
        ));
        assert!(matches!(err(json!({"players": "u1"})), Error::IncorrectType(_)));
        assert!(matches!(err(json!({"nested": {"a.b": 1}})), Error::InvalidNestedKey(_)));
    }

    #[test]
    fn acl_sets_three_fields_and_null_unsets() {
        let update =
            transform_update(&game(), &map(json!({"ACL": {"*": {"read": true}}}))).unwrap();
        for key in [READ_PERMS, WRITE_PERMS, COMBINED] {
            assert!(matches!(update.get(key), Some(UpdateInstruction::Set(_))), "{key}");
        }
        let cleared = transform_update(&game(), &map(json!({"ACL": null}))).unwrap();
        assert_eq!(cleared.get(READ_PERMS), Some(&UpdateInstruction::Unset));
    }

    #[test]
    fn create_maps_user_fields() {
        let user = ClassSchema::new(USER_CLASS);
        let doc = transform_create(
            &user,
            &map(json!({
                "username": "ann",
                "password": "secret",
                "authData": {"facebook": {"id": "1"}},
            })),
        )
        .unwrap();
        assert_eq!(doc.get(HASHED_PASSWORD), Some(&StorageValue::from("secret")));
        assert!(doc.get("_auth_data_facebook").and_then(StorageValue::as_document).is_some());
        assert_eq!(doc.get("username"), Some(&StorageValue::from("ann")));
    }

    #[test]
    fn create_stores_pointers_under_prefixed_key() {
        let doc = transform_create(
            &game(),
            &map(json!({
                "owner": {"__type": "Pointer", "className": "_User", "objectId": "u1"},
                "updatedAt": "x",
            })),
        )
        .unwrap();
        assert_eq!(doc.get("_p_owner"), Some(&StorageValue::from("_User$u1")));
        assert!(!doc.contains_key("updatedAt"));
    }

    #[test]
    fn additions_and_mismatches() {
        let schema = game();
        let additions = schema_additions(
            &schema,
            &map(json!({
                "score": 3,
                "name": "x",
                "team": {"__type": "Pointer", "className": "Team", "objectId": "t"},
            })),
        )
        .unwrap();
        assert_eq!(
            additions,
            vec![
                ("name".to_string(), FieldType::String),
                ("team".to_string(), FieldType::pointer("Team")),
            ]
        );
        assert!(matches!(
            schema_additions(&schema, &map(json!({"score": "high"}))),
            Err(Error::IncorrectType(_))
        ));
        let increment = map(json!({"score": {"__op": "Increment", "amount": 1}}));
        assert!(schema_additions(&schema, &increment).is_ok());
    }
}
