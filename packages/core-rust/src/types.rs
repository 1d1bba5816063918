//! Public JSON object model.
//!
//! [`Value`] is a closed tagged union over plain JSON plus the special types
//! that the REST boundary marks with a `__type` discriminator. Conversion to
//! and from `serde_json::Value` is the only place the discriminator is
//! inspected; everything downstream pattern-matches on variants.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

use crate::error::{Error, Result};

/// JSON object body. `BTreeMap` keeps serialization deterministic.
pub type Map = BTreeMap<String, Value>;

/// Typed reference to another object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pointer {
    pub class_name: String,
    pub object_id: String,
}

impl Pointer {
    #[must_use]
    pub fn new(class_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            object_id: object_id.into(),
        }
    }
}

/// Date carried as its ISO-8601 text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Date {
    pub iso: String,
}

impl Date {
    /// Builds a date in the canonical `YYYY-MM-DDTHH:MM:SS.sssZ` form.
    #[must_use]
    pub fn from_datetime(dt: &DateTime<Utc>) -> Self {
        Self { iso: format_iso(dt) }
    }

    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(&Utc::now())
    }

    /// Parses the ISO text.
    ///
    /// # Errors
    ///
    /// Returns `InvalidJson` if the text is not RFC 3339.
    pub fn to_datetime(&self) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.iso)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::InvalidJson(format!("invalid date {:?}: {e}", self.iso)))
    }
}

/// Formats a timestamp the way the REST boundary prints dates.
#[must_use]
pub fn format_iso(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Binary payload carried as base64 text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bytes {
    pub base64: String,
}

/// Longitude/latitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

/// Reference to a stored file by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct File {
    pub name: String,
}

/// A decoded JSON value.
///
/// Numbers keep the integer/float split of the wire, but equality and
/// ordering treat `Int` and `Float` as one number domain.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(Map),
    Pointer(Pointer),
    /// Schema-declared relation placeholder; never stored inline.
    Relation { class_name: String },
    Date(Date),
    Bytes(Bytes),
    GeoPoint(GeoPoint),
    File(File),
}

impl Value {
    /// Decodes a `serde_json::Value`, recognizing `__type` special objects.
    ///
    /// # Errors
    ///
    /// Returns `InvalidJson` when a special object is missing members or a
    /// geo point is out of range.
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        Ok(match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::Array(
                items
                    .into_iter()
                    .map(Self::from_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            serde_json::Value::Object(obj) => {
                let special = obj
                    .get("__type")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string);
                match special.as_deref() {
                    Some(kind) if is_special_type(kind) => decode_special(kind, &obj)?,
                    _ => Self::Object(
                        obj.into_iter()
                            .map(|(k, v)| Ok((k, Self::from_json(v)?)))
                            .collect::<Result<Map>>()?,
                    ),
                }
            }
        })
    }

    /// Encodes back to the REST wire form.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => json!(i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Self::Pointer(p) => json!({
                "__type": "Pointer",
                "className": p.class_name,
                "objectId": p.object_id,
            }),
            Self::Relation { class_name } => json!({
                "__type": "Relation",
                "className": class_name,
            }),
            Self::Date(d) => json!({"__type": "Date", "iso": d.iso}),
            Self::Bytes(b) => json!({"__type": "Bytes", "base64": b.base64}),
            Self::GeoPoint(g) => json!({
                "__type": "GeoPoint",
                "longitude": g.longitude,
                "latitude": g.latitude,
            }),
            Self::File(f) => json!({"__type": "File", "name": f.name}),
        }
    }

    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) | Self::Float(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Pointer(_) => "Pointer",
            Self::Relation { .. } => "Relation",
            Self::Date(_) => "Date",
            Self::Bytes(_) => "Bytes",
            Self::GeoPoint(_) => "GeoPoint",
            Self::File(_) => "File",
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of `Int` and `Float`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Map> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// True for an object whose keys are all `$`-prefixed operators.
    #[must_use]
    pub fn is_operator_object(&self) -> bool {
        match self {
            Self::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
            _ => false,
        }
    }

    /// Orders two values of the same comparable domain.
    ///
    /// Numbers compare numerically and strings lexically. Dates compare as
    /// instants, and a date also compares against a string holding an
    /// RFC 3339 instant. Pointers order by their `<className>$<objectId>`
    /// form and files by name, which is how they are stored. Anything else
    /// is incomparable.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Date(_), Self::Date(_) | Self::String(_)) | (Self::String(_), Self::Date(_)) => {
                Some(self.instant()?.cmp(&other.instant()?))
            }
            (Self::Pointer(a), Self::Pointer(b)) => Some(
                format!("{}${}", a.class_name, a.object_id)
                    .cmp(&format!("{}${}", b.class_name, b.object_id)),
            ),
            (Self::File(a), Self::File(b)) => Some(a.name.cmp(&b.name)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Equality used by query matching: strict equality, except that dates
    /// are equal when they denote the same instant, whether given as a
    /// `Date` or as an ISO string.
    #[must_use]
    pub fn query_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Date(_), Self::Date(_) | Self::String(_)) | (Self::String(_), Self::Date(_)) => {
                self.compare(other) == Some(Ordering::Equal)
            }
            _ => self == other,
        }
    }

    fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(date) => date.to_datetime().ok(),
            Self::String(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    #[allow(clippy::float_cmp)]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Pointer(a), Self::Pointer(b)) => a == b,
            (Self::Relation { class_name: a }, Self::Relation { class_name: b }) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::GeoPoint(a), Self::GeoPoint(b)) => a == b,
            (Self::File(a), Self::File(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Self::from_json(json).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Self::Object(map)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<Pointer> for Value {
    fn from(p: Pointer) -> Self {
        Self::Pointer(p)
    }
}

fn is_special_type(kind: &str) -> bool {
    matches!(
        kind,
        "Pointer" | "Relation" | "Date" | "Bytes" | "GeoPoint" | "File"
    )
}

fn member_str(
    obj: &serde_json::Map<String, serde_json::Value>,
    kind: &str,
    key: &str,
) -> Result<String> {
    obj.get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidJson(format!("{kind} requires a string {key}")))
}

fn member_f64(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> Result<f64> {
    obj.get(key)
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| Error::InvalidJson(format!("GeoPoint requires a numeric {key}")))
}

fn decode_special(kind: &str, obj: &serde_json::Map<String, serde_json::Value>) -> Result<Value> {
    Ok(match kind {
        "Pointer" => Value::Pointer(Pointer {
            class_name: member_str(obj, kind, "className")?,
            object_id: member_str(obj, kind, "objectId")?,
        }),
        "Relation" => Value::Relation {
            class_name: member_str(obj, kind, "className")?,
        },
        "Date" => Value::Date(Date {
            iso: member_str(obj, kind, "iso")?,
        }),
        "Bytes" => Value::Bytes(Bytes {
            base64: member_str(obj, kind, "base64")?,
        }),
        "GeoPoint" => {
            let longitude = member_f64(obj, "longitude")?;
            let latitude = member_f64(obj, "latitude")?;
            if !(-180.0..=180.0).contains(&longitude) || !(-90.0..=90.0).contains(&latitude) {
                return Err(Error::InvalidJson(format!(
                    "GeoPoint out of range: ({longitude}, {latitude})"
                )));
            }
            Value::GeoPoint(GeoPoint { longitude, latitude })
        }
        "File" => Value::File(File {
            name: member_str(obj, kind, "name")?,
        }),
        other => return Err(Error::InvalidJson(format!("unknown __type {other}"))),
    })
}
