//! Per-object access control lists.
//!
//! Wire shape: `{"<entity>": {"read": true, "write": true}, "*": {"read": true}}`
//! where an entity is a user id, `role:<name>` or `*`. Only granted
//! permissions are kept; a `false` flag is the same as an absent one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Map, Value};

/// Entity granting access to everyone.
pub const PUBLIC: &str = "*";

/// Entity name for a role.
#[must_use]
pub fn role_entity(role_name: &str) -> String {
    format!("role:{role_name}")
}

/// Read/write grant of a single entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub write: bool,
}

impl Permission {
    fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// An ACL: entity to permission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl(BTreeMap<String, Permission>);

impl Acl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the JSON form of an ACL.
    ///
    /// # Errors
    ///
    /// Returns `InvalidJson` when the value is not an object of permission
    /// objects, or a permission carries a key other than `read`/`write`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::InvalidJson("ACL must be an object".to_string()))?;
        let mut acl = Self::new();
        for (entity, perms) in map {
            let perms = perms.as_object().ok_or_else(|| {
                Error::InvalidJson(format!("ACL entry for {entity} must be an object"))
            })?;
            let mut permission = Permission::default();
            for (name, granted) in perms {
                let granted = granted.as_bool().ok_or_else(|| {
                    Error::InvalidJson(format!("ACL {entity}.{name} must be a boolean"))
                })?;
                match name.as_str() {
                    "read" => permission.read = granted,
                    "write" => permission.write = granted,
                    other => {
                        return Err(Error::InvalidJson(format!(
                            "unknown ACL permission {other} for {entity}"
                        )))
                    }
                }
            }
            if !permission.is_empty() {
                acl.0.insert(entity.clone(), permission);
            }
        }
        Ok(acl)
    }

    /// JSON form of this ACL.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let map: Map = self
            .0
            .iter()
            .map(|(entity, perm)| {
                let mut perms = Map::new();
                if perm.read {
                    perms.insert("read".to_string(), Value::Bool(true));
                }
                if perm.write {
                    perms.insert("write".to_string(), Value::Bool(true));
                }
                (entity.clone(), Value::Object(perms))
            })
            .collect();
        Value::Object(map)
    }

    pub fn set_read(&mut self, entity: &str, granted: bool) {
        self.update(entity, |p| p.read = granted);
    }

    pub fn set_write(&mut self, entity: &str, granted: bool) {
        self.update(entity, |p| p.write = granted);
    }

    fn update(&mut self, entity: &str, f: impl FnOnce(&mut Permission)) {
        let perm = self.0.entry(entity.to_string()).or_default();
        f(perm);
        if perm.is_empty() {
            self.0.remove(entity);
        }
    }

    #[must_use]
    pub fn permission(&self, entity: &str) -> Permission {
        self.0.get(entity).copied().unwrap_or_default()
    }

    /// Entities with read access, in entity order.
    #[must_use]
    pub fn readers(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, p)| p.read)
            .map(|(e, _)| e.clone())
            .collect()
    }

    /// Entities with write access, in entity order.
    #[must_use]
    pub fn writers(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, p)| p.write)
            .map(|(e, _)| e.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Permission)> {
        self.0.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any of `entities` (or the public entity) may read.
    #[must_use]
    pub fn can_read<S: AsRef<str>>(&self, entities: &[S]) -> bool {
        self.permission(PUBLIC).read || entities.iter().any(|e| self.permission(e.as_ref()).read)
    }

    /// Whether any of `entities` (or the public entity) may write.
    #[must_use]
    pub fn can_write<S: AsRef<str>>(&self, entities: &[S]) -> bool {
        self.permission(PUBLIC).write || entities.iter().any(|e| self.permission(e.as_ref()).write)
    }
}
