//! Storage representation and the in-memory reference collaborators.
//!
//! - [`document`]: storage-native values, predicates, find options and
//!   update instructions
//! - [`matcher`]: evaluation of storage predicates against documents
//! - [`memory`]: [`MemoryStorage`], a `DashMap`-backed [`StorageAdapter`]
//! - [`schema`]: [`MemorySchemaProvider`], an `ArcSwap`-backed schema source

pub mod document;
pub mod matcher;
pub mod memory;
pub mod schema;

pub use document::*;
pub use memory::MemoryStorage;
pub use schema::MemorySchemaProvider;

use crate::traits::StorageAdapter;

/// Failures reported by storage adapters through `anyhow`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("duplicate _id {id} in {class_name}")]
    Duplicate { class_name: String, id: String },
    #[error("document has no string _id")]
    MissingId,
    #[error("update changed the document _id")]
    IdChanged,
}

/// Maps an adapter failure to the engine's error taxonomy.
#[must_use]
pub fn adapter_error(err: &anyhow::Error) -> basalt_core::Error {
    match err.downcast_ref::<StorageError>() {
        Some(StorageError::Duplicate { class_name, id }) => basalt_core::Error::DuplicateValue(
            format!("an object with id {id} already exists in {class_name}"),
        ),
        _ => basalt_core::Error::InternalServerError(format!("storage adapter failed: {err:#}")),
    }
}

/// Fetches every document matching `query` by paging through the adapter
/// `page_size` rows at a time, ordered by `_id`, until a short page.
///
/// # Errors
///
/// Propagates adapter failures.
pub async fn find_all(
    storage: &dyn StorageAdapter,
    class_name: &str,
    query: &StorageQuery,
    page_size: usize,
) -> anyhow::Result<Vec<Document>> {
    let page_size = page_size.max(1);
    let mut all = Vec::new();
    loop {
        let page = storage
            .find(class_name, query, &FindOptions::page(all.len(), page_size))
            .await?;
        let short = page.len() < page_size;
        all.extend(page);
        if short {
            return Ok(all);
        }
    }
}
