//! Post-fetch projection and sanitization of result rows.

use std::collections::BTreeSet;

use basalt_core::schema::USER_CLASS;
use basalt_core::{Map, Value};

/// Keeps only the fields named in `keys`.
pub fn project(row: &mut Map, keys: &BTreeSet<String>) {
    row.retain(|key, _| keys.contains(key));
}

/// Strips fields no client may see.
///
/// `_User` rows lose `password` and any `authData` provider set to `null`;
/// an `authData` left empty is removed.
pub fn sanitize_row(class_name: &str, row: &mut Map) {
    if class_name != USER_CLASS {
        return;
    }
    row.remove("password");
    let now_empty = match row.get_mut("authData") {
        Some(Value::Object(providers)) => {
            providers.retain(|_, data| !data.is_null());
            providers.is_empty()
        }
        Some(Value::Null) => true,
        _ => false,
    };
    if now_empty {
        row.remove("authData");
    }
}

/// Rewrites `className` on every row after a redirected query.
pub fn apply_redirect(rows: &mut [Map], class_name: &str) {
    for row in rows {
        row.insert("className".to_string(), Value::from(class_name));
    }
}
