//! Storage-native documents, queries, find options and update instructions.
//!
//! This is the representation handed across the adapter boundary. Special
//! JSON types are already encoded: pointers are `"Class$id"` strings under a
//! `_p_` key, dates are timestamps, bytes are binary, geo points are
//! `[longitude, latitude]` pairs.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// A stored document or storage predicate.
pub type Document = BTreeMap<String, StorageValue>;

/// Storage predicate: field to literal or operator document, plus `$or`/`$and`.
pub type StorageQuery = Document;

/// A storage-native value.
#[derive(Debug, Clone)]
pub enum StorageValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<StorageValue>),
    Document(Document),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
}

impl StorageValue {
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
    pub fn as_array(&self) -> Option<&Vec<StorageValue>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Self::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// Strings of an array value; non-string elements are skipped.
    #[must_use]
    pub fn string_items(&self) -> Vec<String> {
        self.as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(StorageValue::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Orders values of one comparable domain: numbers, strings or
    /// timestamps. A timestamp also compares against a string holding an
    /// RFC 3339 instant. Arrays and documents are incomparable.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Timestamp(_), Self::Timestamp(_) | Self::String(_))
            | (Self::String(_), Self::Timestamp(_)) => {
                Some(self.instant()?.cmp(&other.instant()?))
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Equality used by predicates: strict, except that a timestamp equals
    /// a string naming the same instant.
    #[must_use]
    pub fn query_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Timestamp(_), Self::String(_)) | (Self::String(_), Self::Timestamp(_)) => {
                self.compare(other) == Some(Ordering::Equal)
            }
            _ => self == other,
        }
    }

    fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::String(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Rank of the value's type, for a total sort order across types.
    fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Int(_) | Self::Float(_) => 1,
            Self::String(_) => 2,
            Self::Document(_) => 3,
            Self::Array(_) => 4,
            Self::Binary(_) => 5,
            Self::Bool(_) => 6,
            Self::Timestamp(_) => 7,
        }
    }

    /// Total order used for sorting; missing values sort first.
    #[must_use]
    pub fn sort_cmp(a: Option<&Self>, b: Option<&Self>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a
                .compare(b)
                .unwrap_or_else(|| a.type_rank().cmp(&b.type_rank())),
        }
    }
}

impl PartialEq for StorageValue {
    #[allow(clippy::float_cmp)]
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Document(a), Self::Document(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl From<&str> for StorageValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for StorageValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<StorageValue>> for StorageValue {
    fn from(items: Vec<StorageValue>) -> Self {
        Self::Array(items)
    }
}

impl From<Document> for StorageValue {
    fn from(doc: Document) -> Self {
        Self::Document(doc)
    }
}

// ---------------------------------------------------------------------------
// Find options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Row-level ACL restriction injected by the query compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadScope {
    /// Unauthenticated caller: only public documents are visible.
    Anonymous,
    /// `[userId]` followed by the user's `role:<name>` entities.
    Entities(Vec<String>),
}

impl ReadScope {
    /// Whether a document with the given `_rperm` is visible.
    ///
    /// Documents without `_rperm` are visible to everyone, as are documents
    /// readable by `*`.
    #[must_use]
    pub fn permits(&self, rperm: Option<&StorageValue>) -> bool {
        let Some(rperm) = rperm else {
            return true;
        };
        let readers = rperm.string_items();
        if readers.iter().any(|r| r == basalt_core::acl::PUBLIC) {
            return true;
        }
        match self {
            Self::Anonymous => false,
            Self::Entities(entities) => readers.iter().any(|r| entities.contains(r)),
        }
    }
}

/// Options of a storage `find` or `count`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    /// Storage keys in priority order.
    pub sort: Vec<(String, SortDirection)>,
    /// `None` means unrestricted (master).
    pub read_scope: Option<ReadScope>,
}

impl FindOptions {
    /// Unrestricted options sorted by `_id`, used for paged internal lookups.
    #[must_use]
    pub fn page(skip: usize, limit: usize) -> Self {
        Self {
            skip: Some(skip),
            limit: Some(limit),
            sort: vec![("_id".to_string(), SortDirection::Ascending)],
            read_scope: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// Storage-native instruction for one field.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateInstruction {
    Set(StorageValue),
    Unset,
    /// Adds to the current number, treating absent or non-numeric as 0.
    Increment(f64),
    Append(Vec<StorageValue>),
    /// Appends values not already deep-equal to an element.
    AppendUnique(Vec<StorageValue>),
    /// Drops every element deep-equal to one of the values.
    RemoveAll(Vec<StorageValue>),
    /// Relation edit; membership lives in the join class, so this has no
    /// effect on the document.
    Relation { class_name: Option<String> },
}

/// Storage key to instruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageUpdate(pub BTreeMap<String, UpdateInstruction>);

impl StorageUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: StorageValue) {
        self.0.insert(key.into(), UpdateInstruction::Set(value));
    }

    pub fn insert(&mut self, key: impl Into<String>, instruction: UpdateInstruction) {
        self.0.insert(key.into(), instruction);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&UpdateInstruction> {
        self.0.get(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &UpdateInstruction)> {
        self.0.iter()
    }

    /// Applies every instruction to `doc`.
    pub fn apply_to(&self, doc: &mut Document) {
        for (key, instruction) in &self.0 {
            match instruction {
                UpdateInstruction::Set(value) => {
                    doc.insert(key.clone(), value.clone());
                }
                UpdateInstruction::Unset => {
                    doc.remove(key);
                }
                UpdateInstruction::Increment(amount) => {
                    let current = doc.get(key).and_then(StorageValue::as_f64).unwrap_or(0.0);
                    doc.insert(key.clone(), StorageValue::Float(current + amount));
                }
                UpdateInstruction::Append(values) => {
                    let mut items = current_items(doc, key);
                    items.extend(values.iter().cloned());
                    doc.insert(key.clone(), StorageValue::Array(items));
                }
                UpdateInstruction::AppendUnique(values) => {
                    let mut items = current_items(doc, key);
                    for value in values {
                        if !items.contains(value) {
                            items.push(value.clone());
                        }
                    }
                    doc.insert(key.clone(), StorageValue::Array(items));
                }
                UpdateInstruction::RemoveAll(values) => {
                    let mut items = current_items(doc, key);
                    items.retain(|item| !values.contains(item));
                    doc.insert(key.clone(), StorageValue::Array(items));
                }
                UpdateInstruction::Relation { .. } => {}
            }
        }
    }
}

fn current_items(doc: &Document, key: &str) -> Vec<StorageValue> {
    doc.get(key)
        .and_then(StorageValue::as_array)
        .cloned()
        .unwrap_or_default()
}
