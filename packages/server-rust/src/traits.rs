use std::sync::Arc;

use async_trait::async_trait;
use basalt_core::{ClassSchema, FieldType};

use crate::storage::{Document, FindOptions, StorageQuery, StorageUpdate};

/// Pluggable persistence backend.
///
/// Every method works on the storage representation produced by the
/// transform layer. Implementations: memory (tests, reference). A duplicate
/// `_id` on insert must surface as [`StorageError::Duplicate`](crate::storage::StorageError).
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Documents of `class_name` matching `query`, honoring every option.
    async fn find(
        &self,
        class_name: &str,
        query: &StorageQuery,
        options: &FindOptions,
    ) -> anyhow::Result<Vec<Document>>;

    /// Number of documents matching `query`; `skip`, `limit` and `sort` are
    /// ignored, the read scope is not.
    async fn count(
        &self,
        class_name: &str,
        query: &StorageQuery,
        options: &FindOptions,
    ) -> anyhow::Result<usize>;

    /// Stores a new document carrying a string `_id`.
    async fn insert(&self, class_name: &str, doc: Document) -> anyhow::Result<()>;

    /// Applies `update` to the first document matching `query`, returning the
    /// updated document, or `None` if nothing matched.
    async fn update(
        &self,
        class_name: &str,
        query: &StorageQuery,
        update: &StorageUpdate,
    ) -> anyhow::Result<Option<Document>>;

    /// Deletes every document matching `query`, returning how many were removed.
    async fn delete(&self, class_name: &str, query: &StorageQuery) -> anyhow::Result<usize>;
}

/// Source of class schemas.
///
/// Schemas are read-mostly; a returned `Arc` is a stable snapshot for the
/// duration of one request.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Schema of `class_name`, if the class exists.
    async fn get_schema(&self, class_name: &str) -> Option<Arc<ClassSchema>>;

    /// Whether `class_name` exists.
    async fn has_class(&self, class_name: &str) -> bool {
        self.get_schema(class_name).await.is_some()
    }

    /// Creates `class_name` with the default fields, or returns the existing
    /// schema.
    async fn create_class(&self, class_name: &str) -> anyhow::Result<Arc<ClassSchema>>;

    /// Declares additional fields on an existing class.
    async fn add_fields(
        &self,
        class_name: &str,
        fields: &[(String, FieldType)],
    ) -> anyhow::Result<Arc<ClassSchema>>;
}
