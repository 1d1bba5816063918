//! Read transform: storage document back to the REST object.

use basalt_core::types::{format_iso, Date};
use basalt_core::{ClassSchema, Map, Result, Value};

use super::acl::untransform_acl;
use super::coders::{decode_field, decode_interior, PointerCoder, SpecialTypeCoder};
use super::keys::{fixed_rest_key, AUTH_DATA_PREFIX, HASHED_PASSWORD, POINTER_PREFIX};
use crate::storage::{Document, StorageValue};

/// Rebuilds the REST object of a stored document.
///
/// `createdAt` and `updatedAt` come back as ISO strings, `expiresAt` as a
/// Date. Relation fields are synthesized from the schema. Internal keys
/// (`_acl`, `_rperm`, `_wperm` and any other `_`-prefixed key without a REST
/// counterpart) are dropped; the permission lists come back as `ACL`.
///
/// # Errors
///
/// Returns `InternalServerError` for a corrupt stored value.
pub fn untransform_object(schema: &ClassSchema, doc: &Document) -> Result<Map> {
    let mut object = Map::new();
    let mut auth_data = Map::new();
    for (key, stored) in doc {
        if let Some(rest_key) = fixed_rest_key(key) {
            object.insert(rest_key.to_string(), untransform_fixed(rest_key, stored)?);
        } else if key == HASHED_PASSWORD {
            object.insert("password".to_string(), decode_interior(stored)?);
        } else if let Some(provider) = key.strip_prefix(AUTH_DATA_PREFIX) {
            auth_data.insert(provider.to_string(), decode_interior(stored)?);
        } else if let Some(field) = key.strip_prefix(POINTER_PREFIX) {
            let value = match stored {
                StorageValue::Null => Value::Null,
                _ => PointerCoder.from_storage(stored)?,
            };
            object.insert(field.to_string(), value);
        } else if !key.starts_with('_') {
            object.insert(key.clone(), decode_field(stored, schema.field(key))?);
        }
    }
    if let Some(acl) = untransform_acl(doc) {
        object.insert("ACL".to_string(), acl.to_value());
    }
    if !auth_data.is_empty() {
        object.insert("authData".to_string(), Value::Object(auth_data));
    }
    for (field, target_class) in schema.relations() {
        object.insert(
            field.to_string(),
            Value::Relation {
                class_name: target_class.to_string(),
            },
        );
    }
    Ok(object)
}

fn untransform_fixed(rest_key: &str, stored: &StorageValue) -> Result<Value> {
    Ok(match (rest_key, stored) {
        ("createdAt" | "updatedAt", StorageValue::Timestamp(ts)) => Value::String(format_iso(ts)),
        ("expiresAt", StorageValue::Timestamp(ts)) => Value::Date(Date::from_datetime(ts)),
        _ => decode_interior(stored)?,
    })
}
