//! Encoding of JSON atoms to storage values and back.
//!
//! Each special type has a [`SpecialTypeCoder`] used where the schema
//! declares a field of that type:
//!
//! | JSON | Storage |
//! |---|---|
//! | `Pointer{className, objectId}` | `"<className>$<objectId>"` |
//! | `Date{iso}` | timestamp |
//! | `Bytes{base64}` | binary |
//! | `GeoPoint{longitude, latitude}` | `[longitude, latitude]` |
//! | `File{name}` | `name` |
//!
//! Inside arrays and nested objects there is no schema to consult, so dates
//! and bytes keep their native encoding and the other special types are
//! stored as their tagged `{"__type": ...}` documents.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use basalt_core::types::{Bytes, Date, File};
use basalt_core::{Error, FieldType, GeoPoint, Map, Pointer, Result, Value};
use chrono::{DateTime, Utc};

use super::keys::validate_nested_key;
use crate::storage::{Document, StorageValue};

/// Bidirectional mapping between one special JSON type and its storage form.
pub trait SpecialTypeCoder: Send + Sync {
    /// Whether `value` is the JSON form this coder handles.
    fn is_recognized(&self, value: &Value) -> bool;

    /// Encodes a recognized value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidJson` for an unrecognized or malformed value.
    fn to_storage(&self, value: &Value) -> Result<StorageValue>;

    /// Decodes a stored value.
    ///
    /// # Errors
    ///
    /// Returns `InternalServerError` if the stored value is not in this
    /// coder's storage form.
    fn from_storage(&self, stored: &StorageValue) -> Result<Value>;
}

fn unrecognized(kind: &str, value: &Value) -> Error {
    Error::InvalidJson(format!("expected {kind}, got {}", value.type_name()))
}

fn undecodable(kind: &str, stored: &StorageValue) -> Error {
    Error::InternalServerError(format!("stored value is not a {kind}: {stored:?}"))
}

pub struct PointerCoder;

impl SpecialTypeCoder for PointerCoder {
    fn is_recognized(&self, value: &Value) -> bool {
        matches!(value, Value::Pointer(_))
    }

    fn to_storage(&self, value: &Value) -> Result<StorageValue> {
        match value {
            Value::Pointer(p) => {
                Ok(StorageValue::String(format!("{}${}", p.class_name, p.object_id)))
            }
            other => Err(unrecognized("Pointer", other)),
        }
    }

    fn from_storage(&self, stored: &StorageValue) -> Result<Value> {
        stored
            .as_str()
            .and_then(|s| s.split_once('$'))
            .map(|(class_name, object_id)| Value::Pointer(Pointer::new(class_name, object_id)))
            .ok_or_else(|| undecodable("Pointer", stored))
    }
}

pub struct DateCoder;

impl SpecialTypeCoder for DateCoder {
    fn is_recognized(&self, value: &Value) -> bool {
        matches!(value, Value::Date(_))
    }

    fn to_storage(&self, value: &Value) -> Result<StorageValue> {
        match value {
            Value::Date(date) => Ok(StorageValue::Timestamp(date.to_datetime()?)),
            other => Err(unrecognized("Date", other)),
        }
    }

    fn from_storage(&self, stored: &StorageValue) -> Result<Value> {
        match stored {
            StorageValue::Timestamp(ts) => Ok(Value::Date(Date::from_datetime(ts))),
            other => Err(undecodable("Date", other)),
        }
    }
}

pub struct BytesCoder;

impl SpecialTypeCoder for BytesCoder {
    fn is_recognized(&self, value: &Value) -> bool {
        matches!(value, Value::Bytes(_))
    }

    fn to_storage(&self, value: &Value) -> Result<StorageValue> {
        match value {
            Value::Bytes(bytes) => STANDARD
                .decode(&bytes.base64)
                .map(StorageValue::Binary)
                .map_err(|e| Error::InvalidJson(format!("invalid base64: {e}"))),
            other => Err(unrecognized("Bytes", other)),
        }
    }

    fn from_storage(&self, stored: &StorageValue) -> Result<Value> {
        match stored {
            StorageValue::Binary(raw) => Ok(Value::Bytes(Bytes {
                base64: STANDARD.encode(raw),
            })),
            other => Err(undecodable("Bytes", other)),
        }
    }
}

pub struct GeoPointCoder;

impl SpecialTypeCoder for GeoPointCoder {
    fn is_recognized(&self, value: &Value) -> bool {
        matches!(value, Value::GeoPoint(_))
    }

    fn to_storage(&self, value: &Value) -> Result<StorageValue> {
        match value {
            Value::GeoPoint(point) => Ok(point_to_storage(point)),
            other => Err(unrecognized("GeoPoint", other)),
        }
    }

    fn from_storage(&self, stored: &StorageValue) -> Result<Value> {
        let pair = stored.as_array().map(Vec::as_slice);
        match pair {
            Some([lon, lat]) => match (lon.as_f64(), lat.as_f64()) {
                (Some(longitude), Some(latitude)) => {
                    Ok(Value::GeoPoint(GeoPoint::new(longitude, latitude)))
                }
                _ => Err(undecodable("GeoPoint", stored)),
            },
            _ => Err(undecodable("GeoPoint", stored)),
        }
    }
}

pub struct FileCoder;

impl SpecialTypeCoder for FileCoder {
    fn is_recognized(&self, value: &Value) -> bool {
        matches!(value, Value::File(_))
    }

    fn to_storage(&self, value: &Value) -> Result<StorageValue> {
        match value {
            Value::File(file) => Ok(StorageValue::String(file.name.clone())),
            other => Err(unrecognized("File", other)),
        }
    }

    fn from_storage(&self, stored: &StorageValue) -> Result<Value> {
        stored
            .as_str()
            .map(|name| Value::File(File { name: name.to_string() }))
            .ok_or_else(|| undecodable("File", stored))
    }
}

/// `[longitude, latitude]`.
#[must_use]
pub fn point_to_storage(point: &GeoPoint) -> StorageValue {
    StorageValue::Array(vec![
        StorageValue::Float(point.longitude),
        StorageValue::Float(point.latitude),
    ])
}

/// Coder for a declared field type, if the type is a special one.
#[must_use]
pub fn coder_for(field_type: &FieldType) -> Option<&'static dyn SpecialTypeCoder> {
    match field_type {
        FieldType::Pointer { .. } => Some(&PointerCoder),
        FieldType::Date => Some(&DateCoder),
        FieldType::Bytes => Some(&BytesCoder),
        FieldType::GeoPoint => Some(&GeoPointCoder),
        FieldType::File => Some(&FileCoder),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Atoms
// ---------------------------------------------------------------------------

/// Encodes a top-level field value, using the field's coder when the schema
/// declares a special type and the value is of that type.
///
/// # Errors
///
/// Returns `IncorrectType` for a Relation value, `InvalidNestedKey` for an
/// illegal nested key and `InvalidJson` for malformed special values.
pub fn encode_field(value: &Value, field_type: Option<&FieldType>) -> Result<StorageValue> {
    if let Some(coder) = field_type.and_then(coder_for) {
        if coder.is_recognized(value) {
            return coder.to_storage(value);
        }
    }
    encode_interior(value)
}

/// Encodes a value found inside an array or nested object.
///
/// # Errors
///
/// Same as [`encode_field`].
pub fn encode_interior(value: &Value) -> Result<StorageValue> {
    Ok(match value {
        Value::Null => StorageValue::Null,
        Value::Bool(b) => StorageValue::Bool(*b),
        Value::Int(i) => StorageValue::Int(*i),
        Value::Float(f) => StorageValue::Float(*f),
        Value::String(s) => StorageValue::String(s.clone()),
        Value::Array(items) => StorageValue::Array(
            items
                .iter()
                .map(encode_interior)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Object(map) => {
            let mut doc = Document::new();
            for (key, item) in map {
                validate_nested_key(key)?;
                doc.insert(key.clone(), encode_interior(item)?);
            }
            StorageValue::Document(doc)
        }
        Value::Date(_) => DateCoder.to_storage(value)?,
        Value::Bytes(_) => BytesCoder.to_storage(value)?,
        Value::Pointer(_) | Value::GeoPoint(_) | Value::File(_) => tagged_document(value),
        Value::Relation { class_name } => {
            return Err(Error::IncorrectType(format!(
                "a Relation to {class_name} cannot be stored as a value"
            )))
        }
    })
}

/// The `{"__type": ...}` document of a pointer, geo point or file.
fn tagged_document(value: &Value) -> StorageValue {
    let mut doc = Document::new();
    if let serde_json::Value::Object(members) = value.to_json() {
        for (key, member) in members {
            let stored = match member {
                serde_json::Value::String(s) => StorageValue::String(s),
                serde_json::Value::Number(n) => StorageValue::Float(n.as_f64().unwrap_or_default()),
                _ => StorageValue::Null,
            };
            doc.insert(key, stored);
        }
    }
    StorageValue::Document(doc)
}

/// Decodes a top-level stored field with the field's coder, falling back to
/// the interior decoding when the stored value is not in the coder's form.
///
/// # Errors
///
/// Never fails for well-formed storage; kept fallible for adapter-provided
/// values.
pub fn decode_field(stored: &StorageValue, field_type: Option<&FieldType>) -> Result<Value> {
    if let Some(coder) = field_type.and_then(coder_for) {
        if let Ok(value) = coder.from_storage(stored) {
            return Ok(value);
        }
    }
    decode_interior(stored)
}

/// Decodes a value found inside an array or nested document.
///
/// # Errors
///
/// Returns `InternalServerError` for a tagged document missing members.
pub fn decode_interior(stored: &StorageValue) -> Result<Value> {
    Ok(match stored {
        StorageValue::Null => Value::Null,
        StorageValue::Bool(b) => Value::Bool(*b),
        StorageValue::Int(i) => Value::Int(*i),
        StorageValue::Float(f) => Value::Float(*f),
        StorageValue::String(s) => Value::String(s.clone()),
        StorageValue::Array(items) => Value::Array(
            items
                .iter()
                .map(decode_interior)
                .collect::<Result<Vec<_>>>()?,
        ),
        StorageValue::Document(doc) => decode_document(doc)?,
        StorageValue::Timestamp(_) => DateCoder.from_storage(stored)?,
        StorageValue::Binary(_) => BytesCoder.from_storage(stored)?,
    })
}

fn decode_document(doc: &Document) -> Result<Value> {
    let mut map = Map::new();
    for (key, item) in doc {
        map.insert(key.clone(), decode_interior(item)?);
    }
    let tagged = matches!(
        doc.get("__type").and_then(StorageValue::as_str),
        Some("Pointer" | "GeoPoint" | "File")
    );
    if !tagged {
        return Ok(Value::Object(map));
    }
    Value::from_json(Value::Object(map).to_json())
        .map_err(|e| Error::InternalServerError(format!("corrupt tagged document: {e}")))
}

/// Parses a REST date string into a timestamp.
///
/// # Errors
///
/// Returns `InvalidJson` if the string is not RFC 3339.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    Date { iso: text.to_string() }.to_datetime()
}
