//! Basalt server: storage transform, query compilation, sessions and live
//! queries over pluggable storage and schema collaborators.
//!
//! A request runs as an [`Auth`] principal. Reads go through a
//! [`QueryCompiler`], writes through a [`WriteExecutor`]; both talk to the
//! [`StorageAdapter`] in the storage representation produced by
//! [`transform`]. A [`LiveQueryServer`] registered on the write path pushes
//! matching changes to subscribed clients.

pub mod auth;
pub mod live;
pub mod logging;
pub mod query;
pub mod service;
pub mod storage;
pub mod traits;
pub mod transform;

pub use auth::{Auth, AuthResolver};
pub use live::LiveQueryServer;
pub use logging::{init_tracing, LogFormat};
pub use query::{QueryCompiler, QueryResponse, WriteExecutor};
pub use service::{LiveQueryConfig, ServerConfig, ServerContext};
pub use storage::{MemorySchemaProvider, MemoryStorage};
pub use traits::{SchemaProvider, StorageAdapter};
