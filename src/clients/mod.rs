// src/clients/mod.rs
// Thin adapters for the external memory service and metadata store.

pub mod memory;
pub mod metadata;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

pub use memory::HttpMemoryClient;
pub use metadata::MetadataStore;

/// Contract of the opaque memory service.
///
/// `memorize` may fail with transport, provider, or rate-limit errors; the
/// caller applies the per-item timeout and the backoff policy.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn memorize(&self, resource_url: &str, modality: &str, user_id: &str) -> Result<()>;

    async fn retrieve(&self, queries: &[String], filter: Option<Value>) -> Result<Value>;
}
