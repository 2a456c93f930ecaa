// Local filesystem storage backend
use super::{BlobLocation, BlobStat, BlobStream, StorageBackend, StorageConfig};
use crate::error::{CaskError, CaskResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Local filesystem storage backend
///
/// Keys resolve under the storage root, so a blob key
/// `cas/{addr[:3]}/{addr[3:6]}/{addr}` lands in `{root}/cas/...`.
pub struct LocalStorage {
    config: StorageConfig,
}

impl LocalStorage {
    /// Create a new LocalStorage instance with the given configuration
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Create a new LocalStorage instance from a root path
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self::new(StorageConfig::local(root.as_ref()))
    }

    /// Get the root directory for storage
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn key_path(&self, key: &str) -> CaskResult<PathBuf> {
        let mut path = self.config.root.clone();
        for part in key.split('/').filter(|s| !s.is_empty()) {
            if part == "." || part == ".." || part.contains('\\') {
                return Err(CaskError::config(format!("invalid storage key: {:?}", key)));
            }
            path.push(part);
        }
        Ok(path)
    }

    /// Initialize storage directories
    pub async fn initialize(&self) -> CaskResult<()> {
        fs::create_dir_all(self.config.store_path()).await?;
        fs::create_dir_all(self.config.tmp_path()).await?;
        Ok(())
    }

    /// Clean up empty shard directories after a delete
    async fn cleanup_empty_dirs(&self, path: &Path) {
        let store = self.config.store_path();
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == store || !dir.starts_with(&store) {
                break;
            }
            // Only succeeds when empty
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

fn not_found(key: &str, err: std::io::Error) -> CaskError {
    if err.kind() == ErrorKind::NotFound {
        CaskError::missing(key.to_string())
    } else {
        err.into()
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn exists(&self, key: &str) -> CaskResult<bool> {
        Ok(fs::try_exists(self.key_path(key)?).await?)
    }

    async fn read(&self, key: &str) -> CaskResult<Bytes> {
        let data = fs::read(self.key_path(key)?)
            .await
            .map_err(|e| not_found(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn read_stream(&self, key: &str) -> CaskResult<BlobStream> {
        let file = fs::File::open(self.key_path(key)?)
            .await
            .map_err(|e| not_found(key, e))?;
        let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(CaskError::from));
        Ok(stream.boxed())
    }

    async fn write(&self, key: &str, data: Bytes) -> CaskResult<()> {
        let path = self.key_path(key)?;
        self.mkdir(key).await?;

        let mut file = fs::File::create(&path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn put_file(&self, src: &Path, key: &str) -> CaskResult<()> {
        let path = self.key_path(key)?;
        self.mkdir(key).await?;

        // Publish through a sibling file so readers never see a partial blob
        let partial = path.with_file_name(format!(
            "{}.partial-{}",
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("blob"),
            Uuid::new_v4().simple()
        ));
        if let Err(e) = fs::copy(src, &partial).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> CaskResult<()> {
        let src = self.key_path(from)?;
        if !fs::try_exists(&src).await? {
            return Err(CaskError::missing(from.to_string()));
        }
        self.put_file(&src, to).await
    }

    async fn delete(&self, key: &str) -> CaskResult<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.cleanup_empty_dirs(&path).await;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn mkdir(&self, key: &str) -> CaskResult<()> {
        if let Some(parent) = self.key_path(key)?.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn stat(&self, key: &str) -> CaskResult<BlobStat> {
        let meta = fs::metadata(self.key_path(key)?)
            .await
            .map_err(|e| not_found(key, e))?;
        let modified: DateTime<Utc> = meta.modified()?.into();
        let created: DateTime<Utc> = meta.created().map(Into::into).unwrap_or(modified);
        Ok(BlobStat {
            size: meta.len(),
            created,
            modified,
        })
    }

    fn location(&self, key: &str) -> CaskResult<BlobLocation> {
        Ok(BlobLocation::Local {
            path: self.key_path(key)?,
        })
    }

    async fn purge(&self) -> CaskResult<()> {
        for dir in [self.config.store_path(), self.config.tmp_path()] {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.initialize().await?;
        tracing::warn!(root = %self.config.root.display(), "Local storage purged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::with_root(temp_dir.path());
        storage.initialize().await.unwrap();
        (storage, temp_dir)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (storage, _temp) = create_test_storage().await;

        storage
            .write("cas/abc/def/abcdef01", Bytes::from_static(b"test data"))
            .await
            .unwrap();

        assert!(storage.exists("cas/abc/def/abcdef01").await.unwrap());
        let data = storage.read("cas/abc/def/abcdef01").await.unwrap();
        assert_eq!(&data[..], b"test data");
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let (storage, _temp) = create_test_storage().await;

        let err = storage.read("cas/000/000/missing").await.unwrap_err();
        assert!(matches!(err, CaskError::MissingResource { .. }));
    }

    #[tokio::test]
    async fn test_put_file_leaves_no_partials() {
        let (storage, temp) = create_test_storage().await;
        let src = temp.path().join("tmp").join("upload");
        fs::write(&src, b"staged").await.unwrap();

        storage.put_file(&src, "cas/123/456/123456").await.unwrap();

        let shard = temp.path().join("cas").join("123").join("456");
        let mut entries = fs::read_dir(&shard).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["123456".to_string()]);
        // Source is left for the caller to remove
        assert!(src.exists());
    }

    #[tokio::test]
    async fn test_delete_cleans_shards() {
        let (storage, temp) = create_test_storage().await;
        storage
            .write("cas/aaa/bbb/aaabbb", Bytes::from_static(b"x"))
            .await
            .unwrap();

        storage.delete("cas/aaa/bbb/aaabbb").await.unwrap();

        assert!(!storage.exists("cas/aaa/bbb/aaabbb").await.unwrap());
        assert!(!temp.path().join("cas").join("aaa").exists());
        assert!(temp.path().join("cas").exists());

        // Deleting again is fine
        storage.delete("cas/aaa/bbb/aaabbb").await.unwrap();
    }

    #[tokio::test]
    async fn test_read_stream() {
        let (storage, _temp) = create_test_storage().await;
        let data = vec![0xAB; 200_000];
        storage
            .write("cas/big/big/bigblob", Bytes::from(data.clone()))
            .await
            .unwrap();

        let mut stream = storage.read_stream("cas/big/big/bigblob").await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, data);
    }

    #[tokio::test]
    async fn test_stat_and_location() {
        let (storage, temp) = create_test_storage().await;
        storage
            .write("cas/abc/def/abcdef", Bytes::from_static(b"12345"))
            .await
            .unwrap();

        let stat = storage.stat("cas/abc/def/abcdef").await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(
            storage.location("cas/abc/def/abcdef").unwrap(),
            BlobLocation::Local {
                path: temp.path().join("cas/abc/def/abcdef")
            }
        );
    }

    #[tokio::test]
    async fn test_keys_cannot_leave_root() {
        let (storage, _temp) = create_test_storage().await;

        for bad in ["../outside.txt", "cas/./x", "cas/../../etc/passwd"] {
            assert!(matches!(
                storage.read(bad).await,
                Err(CaskError::Configuration(_))
            ));
            assert!(matches!(storage.delete(bad).await, Err(CaskError::Configuration(_))));
            assert!(storage.location(bad).is_err());
        }
    }

    #[tokio::test]
    async fn test_purge() {
        let (storage, temp) = create_test_storage().await;
        storage
            .write("cas/abc/def/abcdef", Bytes::from_static(b"x"))
            .await
            .unwrap();

        storage.purge().await.unwrap();

        assert!(!storage.exists("cas/abc/def/abcdef").await.unwrap());
        assert!(temp.path().join("cas").exists());
        assert!(temp.path().join("tmp").exists());
    }
}
