//! Collaborators shared by every request.

use std::sync::Arc;

use crate::traits::{SchemaProvider, StorageAdapter};

use super::config::ServerConfig;

/// Storage, schema and configuration handed to compilers, executors and
/// resolvers at construction.
pub struct ServerContext {
    pub storage: Arc<dyn StorageAdapter>,
    pub schema: Arc<dyn SchemaProvider>,
    pub config: ServerConfig,
}

impl ServerContext {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        schema: Arc<dyn SchemaProvider>,
        config: ServerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            schema,
            config,
        })
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
