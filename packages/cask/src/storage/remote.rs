// Object store (S3-compatible) storage backend
use super::{BackendConfig, BlobLocation, BlobStat, BlobStream, StorageBackend, StorageConfig};
use crate::error::{CaskError, CaskResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Blobs kept in a bucket behind any `object_store` implementation.
pub struct RemoteStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl RemoteStorage {
    /// Wrap an already-built object store.
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Build an S3 client from the storage configuration.
    pub fn from_config(config: &StorageConfig) -> CaskResult<Self> {
        let BackendConfig::ObjectStore {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            allow_http,
        } = &config.backend
        else {
            return Err(CaskError::config("storage backend is not an object store"));
        };

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_allow_http(*allow_http);
        if let Some(region) = region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(key) = access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }

        tracing::info!(bucket = %bucket, endpoint = ?endpoint, "Using object store backend");
        Ok(Self::new(Arc::new(builder.build()?), bucket.clone()))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn not_found(key: &str, err: object_store::Error) -> CaskError {
    match err {
        object_store::Error::NotFound { .. } => CaskError::missing(key.to_string()),
        other => other.into(),
    }
}

#[async_trait]
impl StorageBackend for RemoteStorage {
    async fn exists(&self, key: &str) -> CaskResult<bool> {
        match self.store.head(&ObjectPath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, key: &str) -> CaskResult<Bytes> {
        let result = self
            .store
            .get(&ObjectPath::from(key))
            .await
            .map_err(|e| not_found(key, e))?;
        Ok(result.bytes().await?)
    }

    async fn read_stream(&self, key: &str) -> CaskResult<BlobStream> {
        let result = self
            .store
            .get(&ObjectPath::from(key))
            .await
            .map_err(|e| not_found(key, e))?;
        Ok(result
            .into_stream()
            .map(|chunk| chunk.map_err(CaskError::from))
            .boxed())
    }

    async fn write(&self, key: &str, data: Bytes) -> CaskResult<()> {
        self.store
            .put(&ObjectPath::from(key), PutPayload::from(data))
            .await?;
        Ok(())
    }

    async fn put_file(&self, src: &Path, key: &str) -> CaskResult<()> {
        let mut file = fs::File::open(src).await?;
        let mut writer = BufWriter::new(Arc::clone(&self.store), ObjectPath::from(key));
        tokio::io::copy(&mut file, &mut writer).await?;
        writer.shutdown().await?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> CaskResult<()> {
        self.store
            .copy(&ObjectPath::from(from), &ObjectPath::from(to))
            .await
            .map_err(|e| not_found(from, e))
    }

    async fn delete(&self, key: &str) -> CaskResult<()> {
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn mkdir(&self, _key: &str) -> CaskResult<()> {
        // Buckets have no directories
        Ok(())
    }

    async fn stat(&self, key: &str) -> CaskResult<BlobStat> {
        let meta = self
            .store
            .head(&ObjectPath::from(key))
            .await
            .map_err(|e| not_found(key, e))?;
        Ok(BlobStat {
            size: meta.size as u64,
            created: meta.last_modified,
            modified: meta.last_modified,
        })
    }

    fn location(&self, key: &str) -> CaskResult<BlobLocation> {
        Ok(BlobLocation::Object {
            bucket: self.bucket.clone(),
            key: ObjectPath::parse(key)
                .map_err(|e| CaskError::config(format!("invalid storage key {:?}: {}", key, e)))?
                .to_string(),
        })
    }

    async fn purge(&self) -> CaskResult<()> {
        Err(CaskError::Unsupported(format!(
            "power wash is disabled for object store bucket {}",
            self.bucket
        )))
    }
}
