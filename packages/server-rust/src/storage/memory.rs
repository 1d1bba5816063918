//! In-memory [`StorageAdapter`] implementation backed by [`DashMap`].
//!
//! Provides concurrent read/write access without external locking. Each
//! class is one `DashMap` entry holding its documents ordered by `_id`.
//! Suitable for development, testing and embedding.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;

use super::document::{
    Document, FindOptions, SortDirection, StorageQuery, StorageUpdate, StorageValue,
};
use super::matcher;
use super::StorageError;
use crate::traits::StorageAdapter;

/// In-memory storage: class name to `_id` to document.
pub struct MemoryStorage {
    classes: DashMap<String, BTreeMap<String, Document>>,
}

impl MemoryStorage {
    /// Creates a new, empty `MemoryStorage`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            classes: DashMap::new(),
        }
    }

    /// Number of documents stored for `class_name`.
    #[must_use]
    pub fn len(&self, class_name: &str) -> usize {
        self.classes.get(class_name).map_or(0, |docs| docs.len())
    }

    /// Removes every document of every class.
    pub fn clear(&self) {
        self.classes.clear();
    }

    /// Visible documents of `class_name` matching `query`, unsorted.
    fn matching(
        &self,
        class_name: &str,
        query: &StorageQuery,
        options: &FindOptions,
    ) -> Vec<Document> {
        let Some(docs) = self.classes.get(class_name) else {
            return Vec::new();
        };
        docs.values()
            .filter(|doc| {
                options
                    .read_scope
                    .as_ref()
                    .is_none_or(|scope| scope.permits(doc.get("_rperm")))
            })
            .filter(|doc| matcher::matches(doc, query))
            .cloned()
            .collect()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn document_id(doc: &Document) -> Option<&str> {
    doc.get("_id").and_then(StorageValue::as_str)
}

fn sort_documents(docs: &mut [Document], sort: &[(String, SortDirection)]) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for (key, direction) in sort {
            let ordering = StorageValue::sort_cmp(matcher::lookup(a, key), matcher::lookup(b, key));
            let ordering = match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering.is_ne() {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn find(
        &self,
        class_name: &str,
        query: &StorageQuery,
        options: &FindOptions,
    ) -> anyhow::Result<Vec<Document>> {
        let mut docs = self.matching(class_name, query, options);
        sort_documents(&mut docs, &options.sort);
        let skip = options.skip.unwrap_or(0);
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(docs.into_iter().skip(skip).take(limit).collect())
    }

    async fn count(
        &self,
        class_name: &str,
        query: &StorageQuery,
        options: &FindOptions,
    ) -> anyhow::Result<usize> {
        Ok(self.matching(class_name, query, options).len())
    }

    async fn insert(&self, class_name: &str, doc: Document) -> anyhow::Result<()> {
        let id = document_id(&doc)
            .ok_or(StorageError::MissingId)?
            .to_string();
        let mut docs = self.classes.entry(class_name.to_string()).or_default();
        if docs.contains_key(&id) {
            return Err(StorageError::Duplicate {
                class_name: class_name.to_string(),
                id,
            }
            .into());
        }
        docs.insert(id, doc);
        Ok(())
    }

    async fn update(
        &self,
        class_name: &str,
        query: &StorageQuery,
        update: &StorageUpdate,
    ) -> anyhow::Result<Option<Document>> {
        let Some(mut docs) = self.classes.get_mut(class_name) else {
            return Ok(None);
        };
        let Some(doc) = docs.values_mut().find(|doc| matcher::matches(doc, query)) else {
            return Ok(None);
        };
        let id = document_id(doc).map(str::to_string);
        update.apply_to(doc);
        if document_id(doc).map(str::to_string) != id {
            return Err(StorageError::IdChanged.into());
        }
        Ok(Some(doc.clone()))
    }

    async fn delete(&self, class_name: &str, query: &StorageQuery) -> anyhow::Result<usize> {
        let Some(mut docs) = self.classes.get_mut(class_name) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, doc| !matcher::matches(doc, query));
        Ok(before - docs.len())
    }
}
