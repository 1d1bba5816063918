//! Query compilation and write execution over the storage transform.

pub mod compiler;
pub mod include;
pub mod relation;
pub mod sanitize;
pub mod subquery;
pub mod write;

pub use compiler::{QueryCompiler, QueryFuture, QueryResponse};
pub use write::{new_object_id, WriteExecutor};
