//! Mapping between REST field names and storage keys.

use std::sync::LazyLock;

use basalt_core::schema::USER_CLASS;
use basalt_core::{ClassSchema, Error, Result, SortKey};
use regex::Regex;

use crate::storage::SortDirection;

/// REST name to storage key for fields every class shares.
const FIXED_KEYS: [(&str, &str); 5] = [
    ("objectId", "_id"),
    ("createdAt", "_created_at"),
    ("updatedAt", "_updated_at"),
    ("sessionToken", "_session_token"),
    ("expiresAt", "_expiresAt"),
];

/// Storage key prefix for pointer fields.
pub const POINTER_PREFIX: &str = "_p_";

/// Storage key prefix for one `authData` provider.
pub const AUTH_DATA_PREFIX: &str = "_auth_data_";

/// Storage key of `_User.password`. The value is written as received, so
/// callers of the write path must pass the password already hashed.
pub const HASHED_PASSWORD: &str = "_hashed_password";

/// REST fields whose string values are timestamps in storage.
pub const DATE_KEYS: [&str; 3] = ["createdAt", "updatedAt", "expiresAt"];

static FIELD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z][0-9A-Za-z_]*$").expect("valid field name pattern"));

/// Storage key for a REST field of `schema`'s class.
///
/// Dotted keys map their first segment; `authData.<provider>` maps to the
/// provider's own storage key.
#[must_use]
pub fn storage_key(schema: &ClassSchema, key: &str) -> String {
    if let Some((head, rest)) = key.split_once('.') {
        if head == "authData" {
            return match rest.split_once('.') {
                Some((provider, tail)) => format!("{AUTH_DATA_PREFIX}{provider}.{tail}"),
                None => format!("{AUTH_DATA_PREFIX}{rest}"),
            };
        }
        return format!("{}.{rest}", storage_key(schema, head));
    }
    if let Some((_, stored)) = FIXED_KEYS.iter().find(|(rest, _)| *rest == key) {
        return (*stored).to_string();
    }
    if key == "password" && schema.class_name == USER_CLASS {
        return HASHED_PASSWORD.to_string();
    }
    if schema.is_pointer(key) {
        return format!("{POINTER_PREFIX}{key}");
    }
    key.to_string()
}

/// REST name of a fixed storage key such as `_id`.
#[must_use]
pub fn fixed_rest_key(stored: &str) -> Option<&'static str> {
    FIXED_KEYS
        .iter()
        .find(|(_, s)| *s == stored)
        .map(|(rest, _)| *rest)
}

/// Validates a top-level field name on write.
///
/// # Errors
///
/// Returns `InvalidKeyName` unless the name starts with a letter and
/// contains only letters, digits and `_`.
pub fn validate_field_name(key: &str) -> Result<()> {
    if FIELD_NAME.is_match(key) {
        Ok(())
    } else {
        Err(Error::InvalidKeyName(format!("invalid field name: {key}")))
    }
}

/// Validates a key inside a nested object.
///
/// # Errors
///
/// Returns `InvalidNestedKey` if the key contains `$` or `.`.
pub fn validate_nested_key(key: &str) -> Result<()> {
    if key.contains('$') || key.contains('.') {
        Err(Error::InvalidNestedKey(format!(
            "nested keys should not contain the '$' or '.' characters: {key}"
        )))
    } else {
        Ok(())
    }
}

/// Maps REST sort keys to storage keys.
///
/// # Errors
///
/// Returns `InvalidKeyName` for a sort key that is not a valid field name or
/// a fixed key.
pub fn transform_sort(
    schema: &ClassSchema,
    order: &[SortKey],
) -> Result<Vec<(String, SortDirection)>> {
    order
        .iter()
        .map(|key| {
            let head = key.field.split('.').next().unwrap_or_default();
            if !FIXED_KEYS.iter().any(|(rest, _)| *rest == head) {
                validate_field_name(head)?;
            }
            let direction = if key.descending {
                SortDirection::Descending
            } else {
                SortDirection::Ascending
            };
            Ok((storage_key(schema, &key.field), direction))
        })
        .collect()
}
