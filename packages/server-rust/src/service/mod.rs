//! Shared service plumbing.
//!
//! 1. **Configuration** (`config`): limits, cache sizing and live delivery settings
//! 2. **Context** (`context`): the storage and schema collaborators plus config
//! 3. **Background workers** (`worker`): bounded task queues served by tokio tasks

pub mod config;
pub mod context;
pub mod worker;

pub use config::{LiveQueryConfig, ServerConfig};
pub use context::ServerContext;
pub use worker::{BackgroundRunnable, BackgroundWorker};
