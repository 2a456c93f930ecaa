// Storage backend trait and implementations
mod config;
mod local;
mod remote;

pub use config::{BackendConfig, StorageConfig};
pub use local::LocalStorage;
pub use remote::RemoteStorage;

use crate::error::CaskResult;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Streamed blob content.
pub type BlobStream = BoxStream<'static, CaskResult<Bytes>>;

/// Size and timestamps of a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Where a blob lives, in backend terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlobLocation {
    Local { path: PathBuf },
    Object { bucket: String, key: String },
}

/// Byte-level operations shared by every blob backend.
///
/// Keys are relative, `/`-separated paths such as `cas/abc/def/<address>`.
/// Callers never need to know which implementation they are talking to.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Check if a key exists
    async fn exists(&self, key: &str) -> CaskResult<bool>;

    /// Read a whole object into memory
    async fn read(&self, key: &str) -> CaskResult<Bytes>;

    /// Read an object as a stream of chunks
    async fn read_stream(&self, key: &str) -> CaskResult<BlobStream>;

    /// Write (or overwrite) an object from memory
    async fn write(&self, key: &str, data: Bytes) -> CaskResult<()>;

    /// Copy a local file into place at `key`
    async fn put_file(&self, src: &Path, key: &str) -> CaskResult<()>;

    /// Server-side copy between two keys
    async fn copy(&self, from: &str, to: &str) -> CaskResult<()>;

    /// Delete an object; missing objects are not an error
    async fn delete(&self, key: &str) -> CaskResult<()>;

    /// Make sure the parent "directory" of `key` exists
    async fn mkdir(&self, key: &str) -> CaskResult<()>;

    async fn stat(&self, key: &str) -> CaskResult<BlobStat>;

    /// Backend-qualified location descriptor for `key`
    fn location(&self, key: &str) -> CaskResult<BlobLocation>;

    /// Irreversibly remove every stored object
    async fn purge(&self) -> CaskResult<()>;
}

/// Build the configured backend.
pub fn open_backend(config: &StorageConfig) -> CaskResult<Arc<dyn StorageBackend>> {
    match &config.backend {
        BackendConfig::Local => Ok(Arc::new(LocalStorage::new(config.clone()))),
        BackendConfig::ObjectStore { .. } => Ok(Arc::new(RemoteStorage::from_config(config)?)),
    }
}
