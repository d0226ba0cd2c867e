//! Pluggable object storage.
//!
//! The core depends only on [`ObjectStore`]; S3-compatible and OpenStack
//! Swift backends are provided, plus an in-memory one for tests. Keys
//! embed the bot's opaque id and are unique, so writes are safely
//! last-write-wins.

pub mod keys;
pub mod memory;
pub mod s3;
pub mod swift;

use std::time::Duration;

use qm_domain::config::StorageConfig;
use qm_domain::Result;

pub use memory::MemoryObjectStore;
pub use s3::S3Store;
pub use swift::SwiftStore;

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a blob; returns the backend's etag (or equivalent).
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<String>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// A pre-signed download URL valid for `ttl`.
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Build the configured backend.
pub fn from_config(config: &StorageConfig) -> Result<std::sync::Arc<dyn ObjectStore>> {
    Ok(match config {
        StorageConfig::Memory => std::sync::Arc::new(MemoryObjectStore::new()),
        StorageConfig::S3(s3) => std::sync::Arc::new(S3Store::from_config(s3)?),
        StorageConfig::Swift(swift) => std::sync::Arc::new(SwiftStore::from_config(swift)?),
    })
}
