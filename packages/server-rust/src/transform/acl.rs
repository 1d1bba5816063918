//! ACL split into `_rperm`, `_wperm` and the combined `_acl` document.

use basalt_core::Acl;

use crate::storage::{Document, StorageValue};

pub const READ_PERMS: &str = "_rperm";
pub const WRITE_PERMS: &str = "_wperm";
pub const COMBINED: &str = "_acl";

/// Storage form of an ACL.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAcl {
    pub rperm: Vec<String>,
    pub wperm: Vec<String>,
    /// `{entity: {"r": true, "w": true}}`.
    pub combined: Document,
}

impl StoredAcl {
    /// The three `(storage key, value)` pairs written for an ACL.
    #[must_use]
    pub fn into_fields(self) -> [(&'static str, StorageValue); 3] {
        let strings = |items: Vec<String>| {
            StorageValue::Array(items.into_iter().map(StorageValue::String).collect())
        };
        [
            (READ_PERMS, strings(self.rperm)),
            (WRITE_PERMS, strings(self.wperm)),
            (COMBINED, StorageValue::Document(self.combined)),
        ]
    }
}

/// Splits an ACL into permission lists and the combined document. The lists
/// are in entity order; only membership is significant.
#[must_use]
pub fn transform_acl(acl: &Acl) -> StoredAcl {
    let mut combined = Document::new();
    for (entity, permission) in acl.iter() {
        let mut flags = Document::new();
        if permission.read {
            flags.insert("r".to_string(), StorageValue::Bool(true));
        }
        if permission.write {
            flags.insert("w".to_string(), StorageValue::Bool(true));
        }
        combined.insert(entity.clone(), StorageValue::Document(flags));
    }
    StoredAcl {
        rperm: acl.readers(),
        wperm: acl.writers(),
        combined,
    }
}

/// Rebuilds an ACL from the permission lists of a stored document.
///
/// Returns `None` when the document carries neither list, which is distinct
/// from an explicitly empty ACL.
#[must_use]
pub fn untransform_acl(doc: &Document) -> Option<Acl> {
    let rperm = doc.get(READ_PERMS);
    let wperm = doc.get(WRITE_PERMS);
    if rperm.is_none() && wperm.is_none() {
        return None;
    }
    let mut acl = Acl::new();
    for entity in rperm.map(StorageValue::string_items).unwrap_or_default() {
        acl.set_read(&entity, true);
    }
    for entity in wperm.map(StorageValue::string_items).unwrap_or_default() {
        acl.set_write(&entity, true);
    }
    Some(acl)
}
