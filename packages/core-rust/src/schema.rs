//! Class schemas: field name to declared type.
//!
//! A schema is immutable for the duration of one request. Providers own and
//! cache them; the transform and compiler only read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Declared type of a field.
///
/// Serializes as `{"type": "Pointer", "targetClass": "_User"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Object,
    Array,
    GeoPoint,
    File,
    Bytes,
    Pointer {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
    Relation {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
    #[serde(rename = "ACL")]
    Acl,
}

impl FieldType {
    /// Target class of a Pointer or Relation field.
    #[must_use]
    pub fn target_class(&self) -> Option<&str> {
        match self {
            Self::Pointer { target_class } | Self::Relation { target_class } => Some(target_class),
            _ => None,
        }
    }

    #[must_use]
    pub fn pointer(target_class: &str) -> Self {
        Self::Pointer {
            target_class: target_class.to_string(),
        }
    }

    #[must_use]
    pub fn relation(target_class: &str) -> Self {
        Self::Relation {
            target_class: target_class.to_string(),
        }
    }
}

/// Schema of one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSchema {
    pub class_name: String,
    pub fields: BTreeMap<String, FieldType>,
}

impl ClassSchema {
    /// Creates a schema carrying the default fields every class has.
    #[must_use]
    pub fn new(class_name: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("objectId".to_string(), FieldType::String);
        fields.insert("createdAt".to_string(), FieldType::Date);
        fields.insert("updatedAt".to_string(), FieldType::Date);
        fields.insert("ACL".to_string(), FieldType::Acl);
        Self {
            class_name: class_name.to_string(),
            fields,
        }
    }

    /// Builder-style field declaration.
    #[must_use]
    pub fn with_field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.insert(name.to_string(), field_type);
        self
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldType> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn is_pointer(&self, name: &str) -> bool {
        matches!(self.fields.get(name), Some(FieldType::Pointer { .. }))
    }

    #[must_use]
    pub fn is_relation(&self, name: &str) -> bool {
        matches!(self.fields.get(name), Some(FieldType::Relation { .. }))
    }

    /// Relation fields and their target classes.
    pub fn relations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().filter_map(|(name, ty)| match ty {
            FieldType::Relation { target_class } => Some((name.as_str(), target_class.as_str())),
            _ => None,
        })
    }
}

/// Built-in user class.
pub const USER_CLASS: &str = "_User";
/// Built-in role class.
pub const ROLE_CLASS: &str = "_Role";
/// Built-in session class.
pub const SESSION_CLASS: &str = "_Session";
/// Built-in installation class.
pub const INSTALLATION_CLASS: &str = "_Installation";

/// Schemas of the system classes every deployment starts with.
#[must_use]
pub fn system_classes() -> Vec<ClassSchema> {
    vec![
        ClassSchema::new(USER_CLASS)
            .with_field("username", FieldType::String)
            .with_field("password", FieldType::String)
            .with_field("email", FieldType::String)
            .with_field("emailVerified", FieldType::Boolean)
            .with_field("authData", FieldType::Object),
        ClassSchema::new(ROLE_CLASS)
            .with_field("name", FieldType::String)
            .with_field("users", FieldType::relation(USER_CLASS))
            .with_field("roles", FieldType::relation(ROLE_CLASS)),
        ClassSchema::new(SESSION_CLASS)
            .with_field("user", FieldType::pointer(USER_CLASS))
            .with_field("sessionToken", FieldType::String)
            .with_field("expiresAt", FieldType::Date)
            .with_field("installationId", FieldType::String),
        ClassSchema::new(INSTALLATION_CLASS)
            .with_field("installationId", FieldType::String)
            .with_field("deviceType", FieldType::String)
            .with_field("deviceToken", FieldType::String)
            .with_field("channels", FieldType::Array),
    ]
}
