// Content-addressed blob engine over a pluggable storage backend
mod digest;
mod sidecar;
mod staging;

pub use digest::{digest_source, verify_stored, Digested};
pub use sidecar::{BlobSummary, Sidecar, SidecarFile};
pub use staging::{ByteStream, ContentSource, InputSpec, StagedWrite};

use crate::config::CaskConfig;
use crate::db;
use crate::error::{CaskError, CaskResult};
use crate::hash::DigestSet;
use crate::storage::{open_backend, BlobLocation, BlobStream, StorageBackend};
use crate::workers::WorkerPool;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Backend key of the blob for `address`.
pub fn blob_key(address: &str) -> String {
    let first = address.get(..3).unwrap_or(address);
    let second = address.get(3..6).unwrap_or("");
    format!("cas/{}/{}/{}", first, second, address)
}

/// Backend key of the sidecar for `address`.
pub fn sidecar_key(address: &str) -> String {
    format!("{}.json", blob_key(address))
}

/// How blob content should be handed back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
    #[default]
    Bytes,
    Stream,
}

/// Blob content in the requested form.
pub enum BlobContent {
    Bytes(Bytes),
    Stream(BlobStream),
}

impl BlobContent {
    /// Collect into memory regardless of form.
    pub async fn into_bytes(self) -> CaskResult<Bytes> {
        use futures::TryStreamExt;
        match self {
            BlobContent::Bytes(bytes) => Ok(bytes),
            BlobContent::Stream(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(Bytes::from(chunks.concat()))
            }
        }
    }
}

/// Options for a reference-counted delete.
#[derive(Debug, Clone, Copy, Default)]
pub struct CasDeleteOptions {
    /// Never touch the blob; only report the remaining reference count.
    pub soft_delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub blob_deleted: bool,
    pub references_remaining: u64,
}

/// Content-addressed storage engine.
///
/// Blobs live at `cas/{addr[0:3]}/{addr[3:6]}/{addr}` with a JSON sidecar
/// next to them. A write is staged to a temp file, finalized once the
/// catalog commits, or aborted when anything before the commit fails.
/// Deletes only remove the blob once no file record references it.
pub struct CasEngine {
    config: Arc<CaskConfig>,
    workers: WorkerPool,
    backend: OnceCell<Arc<dyn StorageBackend>>,
}

impl CasEngine {
    /// Engine whose backend is built from config on first use.
    pub fn new(config: Arc<CaskConfig>) -> Self {
        let workers = WorkerPool::new(&config.workers);
        Self {
            config,
            workers,
            backend: OnceCell::new(),
        }
    }

    /// Engine over an explicit backend.
    pub fn with_backend(config: Arc<CaskConfig>, backend: Arc<dyn StorageBackend>) -> Self {
        let workers = WorkerPool::new(&config.workers);
        Self {
            config,
            workers,
            backend: OnceCell::new_with(Some(backend)),
        }
    }

    pub fn config(&self) -> &CaskConfig {
        &self.config
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// The storage backend, selected once on first call.
    pub async fn backend(&self) -> CaskResult<&Arc<dyn StorageBackend>> {
        self.backend
            .get_or_try_init(|| async {
                let backend = open_backend(&self.config.storage)?;
                tracing::debug!(root = %self.config.storage.root.display(), "Storage backend selected");
                Ok::<_, CaskError>(backend)
            })
            .await
    }

    fn temp_dir(&self) -> PathBuf {
        self.config.storage.tmp_path()
    }

    /// Addresses are turned into storage keys, so only well-formed ones get through.
    fn check_address(&self, address: &str) -> CaskResult<()> {
        self.config.canonical_algorithm().validate_address(address)
    }

    /// Stage content for a write: copy it to a temp file and digest it.
    pub async fn stage_write(&self, spec: InputSpec) -> CaskResult<StagedWrite> {
        let source = spec.into_source()?;
        let backend = self.backend().await?;

        let temp_path = match source {
            ContentSource::Hash(_) => None,
            _ => {
                fs::create_dir_all(self.temp_dir()).await?;
                Some(self.temp_dir().join(Uuid::new_v4().simple().to_string()))
            }
        };

        let digested = match digest_source(
            backend.as_ref(),
            &self.workers,
            &self.config.digests,
            source,
            temp_path.as_deref(),
        )
        .await
        {
            Ok(digested) => digested,
            Err(e) => {
                if let Some(temp) = &temp_path {
                    remove_temp(temp).await;
                }
                return Err(e);
            }
        };

        let address = digested.digests.content_address().to_string();
        let key = blob_key(&address);

        let times = if digested.blob_exists {
            backend.stat(&key).await.map(|stat| (stat.created, stat.modified))
        } else {
            match &temp_path {
                Some(temp) => file_times(temp).await,
                None => Ok((Utc::now(), Utc::now())),
            }
        };
        let (created_at, modified_at) = match times {
            Ok(times) => times,
            Err(e) => {
                if let Some(temp) = &temp_path {
                    remove_temp(temp).await;
                }
                return Err(e);
            }
        };

        tracing::debug!(
            address = %address,
            size = digested.size_bytes,
            dedup = digested.blob_exists,
            "Staged write"
        );

        Ok(StagedWrite {
            temp_path,
            digests: digested.digests,
            content_address: address,
            blob_key: key,
            blob_already_exists: digested.blob_exists,
            size_bytes: digested.size_bytes,
            created_at,
            modified_at,
        })
    }

    /// Publish staged content. Returns whether bytes were copied.
    ///
    /// The existence check is the only gate, so calling this again after
    /// a crash or retry is safe. The temp file is removed on success.
    pub async fn finalize_write(&self, staged: &StagedWrite) -> CaskResult<bool> {
        let backend = self.backend().await?;

        let copied = if backend.exists(&staged.blob_key).await? {
            false
        } else {
            let temp = staged.temp_path.as_deref().ok_or_else(|| CaskError::HashNotFound {
                address: staged.content_address.clone(),
            })?;
            backend.mkdir(&staged.blob_key).await?;
            backend.put_file(temp, &staged.blob_key).await?;
            tracing::info!(
                address = %staged.content_address,
                size = staged.size_bytes,
                "Stored blob"
            );
            true
        };

        if let Some(temp) = &staged.temp_path {
            remove_temp(temp).await;
        }
        Ok(copied)
    }

    /// Discard staged content.
    pub async fn abort_write(&self, staged: &StagedWrite) {
        if let Some(temp) = &staged.temp_path {
            remove_temp(temp).await;
            tracing::debug!(address = %staged.content_address, "Aborted staged write");
        }
    }

    /// Read a blob.
    pub async fn read(&self, address: &str, mode: ReadMode) -> CaskResult<BlobContent> {
        self.check_address(address)?;
        let backend = self.backend().await?;
        let key = blob_key(address);
        if !backend.exists(&key).await? {
            return Err(CaskError::missing(format!("blob {}", address)));
        }
        match mode {
            ReadMode::Bytes => Ok(BlobContent::Bytes(backend.read(&key).await?)),
            ReadMode::Stream => Ok(BlobContent::Stream(backend.read_stream(&key).await?)),
        }
    }

    /// Whether a blob exists at `address`.
    pub async fn exists(&self, address: &str) -> CaskResult<bool> {
        self.check_address(address)?;
        self.backend().await?.exists(&blob_key(address)).await
    }

    /// Reference-counted delete.
    ///
    /// The caller must already have removed its own file record on `conn`,
    /// so the count only sees the references that remain.
    pub async fn delete(
        &self,
        conn: &mut SqliteConnection,
        address: &str,
        opts: CasDeleteOptions,
    ) -> CaskResult<DeleteOutcome> {
        self.check_address(address)?;
        let remaining = db::count_references(conn, address).await?;

        if opts.soft_delete {
            return Ok(DeleteOutcome {
                blob_deleted: false,
                references_remaining: remaining,
            });
        }

        if remaining == 0 {
            let backend = self.backend().await?;
            backend.delete(&sidecar_key(address)).await?;
            backend.delete(&blob_key(address)).await?;
            tracing::info!(address = %address, "Deleted unreferenced blob");
            Ok(DeleteOutcome {
                blob_deleted: true,
                references_remaining: 0,
            })
        } else {
            self.refresh_sidecar(conn, address).await?;
            tracing::debug!(address = %address, remaining, "Blob still referenced");
            Ok(DeleteOutcome {
                blob_deleted: false,
                references_remaining: remaining,
            })
        }
    }

    /// Rewrite the sidecar from the current reference set.
    pub async fn refresh_sidecar(&self, conn: &mut SqliteConnection, address: &str) -> CaskResult<()> {
        self.check_address(address)?;
        let references = db::references_to(conn, address).await?;
        let backend = self.backend().await?;
        match Sidecar::from_references(address, &references) {
            Some(sidecar) => {
                let json = serde_json::to_vec_pretty(&sidecar)?;
                backend.write(&sidecar_key(address), Bytes::from(json)).await
            }
            None => backend.delete(&sidecar_key(address)).await,
        }
    }

    pub async fn read_sidecar(&self, address: &str) -> CaskResult<Option<Sidecar>> {
        self.check_address(address)?;
        let backend = self.backend().await?;
        let key = sidecar_key(address);
        if !backend.exists(&key).await? {
            return Ok(None);
        }
        let data = backend.read(&key).await?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Recompute a stored blob's digests, failing if they no longer match.
    pub async fn verify(&self, address: &str) -> CaskResult<DigestSet> {
        self.check_address(address)?;
        let backend = self.backend().await?;
        verify_stored(backend.as_ref(), &self.config.digests, address).await
    }

    /// Where the blob for `address` lives.
    pub async fn disk_path(&self, address: &str) -> CaskResult<BlobLocation> {
        self.check_address(address)?;
        self.backend().await?.location(&blob_key(address))
    }

    /// Location of `address` with a record's bucket applied.
    ///
    /// Object locations take the bucket label when one is given; local
    /// paths are unaffected.
    pub async fn resolve_location(&self, address: &str, bucket: Option<&str>) -> CaskResult<BlobLocation> {
        let location = self.disk_path(address).await?;
        Ok(match (location, bucket) {
            (BlobLocation::Object { key, .. }, Some(bucket)) => BlobLocation::Object {
                bucket: bucket.to_string(),
                key,
            },
            (location, _) => location,
        })
    }

    /// Irreversibly empty the storage root. Object stores refuse.
    pub async fn power_wash(&self) -> CaskResult<()> {
        self.backend().await?.purge().await?;
        match fs::remove_dir_all(self.temp_dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(self.temp_dir()).await?;
        Ok(())
    }
}

async fn remove_temp(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
    }
}

async fn file_times(path: &Path) -> CaskResult<(DateTime<Utc>, DateTime<Utc>)> {
    let meta = fs::metadata(path).await?;
    let modified: DateTime<Utc> = meta.modified()?.into();
    let created: DateTime<Utc> = meta.created().map(Into::into).unwrap_or(modified);
    Ok((created, modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{record, test_db};
    use crate::hash::{digest_bytes, Algorithm};
    use crate::storage::{BlobStat, LocalStorage, RemoteStorage};
    use object_store::memory::InMemory;
    use tempfile::TempDir;

    fn engine(root: &Path) -> CasEngine {
        CasEngine::new(Arc::new(CaskConfig::with_root(root)))
    }

    async fn temp_files(root: &Path) -> usize {
        let mut count = 0;
        if let Ok(mut entries) = fs::read_dir(root.join("tmp")).await {
            while entries.next_entry().await.unwrap().is_some() {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn test_blob_key_sharding() {
        let address = "abcdef0123456789";
        assert_eq!(blob_key(address), "cas/abc/def/abcdef0123456789");
        assert_eq!(sidecar_key(address), "cas/abc/def/abcdef0123456789.json");
    }

    #[tokio::test]
    async fn test_stage_and_finalize() {
        let temp = TempDir::new().unwrap();
        let cas = engine(temp.path());

        let staged = cas.stage_write(InputSpec::from_bytes("hello")).await.unwrap();
        assert!(!staged.blob_already_exists);
        assert_eq!(staged.size_bytes, 5);
        assert!(staged.temp_path.as_ref().unwrap().exists());

        assert!(cas.finalize_write(&staged).await.unwrap());
        assert!(!staged.temp_path.as_ref().unwrap().exists());
        assert!(cas.exists(&staged.content_address).await.unwrap());

        let data = cas
            .read(&staged.content_address, ReadMode::Bytes)
            .await
            .unwrap()
            .into_bytes()
            .await
            .unwrap();
        assert_eq!(&data[..], b"hello");

        // Finalize again is a no-op
        assert!(!cas.finalize_write(&staged).await.unwrap());
    }

    #[tokio::test]
    async fn test_dedup_hit_skips_copy() {
        let temp = TempDir::new().unwrap();
        let cas = engine(temp.path());

        let first = cas.stage_write(InputSpec::from_bytes("same")).await.unwrap();
        cas.finalize_write(&first).await.unwrap();

        let second = cas.stage_write(InputSpec::from_bytes("same")).await.unwrap();
        assert!(second.blob_already_exists);
        assert_eq!(second.content_address, first.content_address);
        assert!(!cas.finalize_write(&second).await.unwrap());
        assert_eq!(temp_files(temp.path()).await, 0);
    }

    #[tokio::test]
    async fn test_path_and_stream_sources_agree() {
        let temp = TempDir::new().unwrap();
        let cas = engine(temp.path());
        let src = temp.path().join("source.bin");
        let data = vec![7u8; 50_000];
        std::fs::write(&src, &data).unwrap();

        let from_path = cas.stage_write(InputSpec::from_path(&src)).await.unwrap();
        let from_stream = cas
            .stage_write(InputSpec::from_stream(std::io::Cursor::new(data.clone())))
            .await
            .unwrap();

        assert_eq!(from_path.digests, from_stream.digests);
        assert_eq!(from_path.size_bytes, 50_000);
        assert_eq!(
            from_path.digests,
            digest_bytes(&[Algorithm::Sha256, Algorithm::Blake3], &data).unwrap()
        );

        cas.abort_write(&from_path).await;
        cas.abort_write(&from_stream).await;
        assert_eq!(temp_files(temp.path()).await, 0);
    }

    #[tokio::test]
    async fn test_missing_path_is_not_found_and_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let cas = engine(temp.path());

        let err = cas
            .stage_write(InputSpec::from_path(temp.path().join("nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, CaskError::MissingResource { .. }));
        assert_eq!(temp_files(temp.path()).await, 0);
    }

    #[tokio::test]
    async fn test_hash_reference_staging() {
        let temp = TempDir::new().unwrap();
        let cas = engine(temp.path());

        let stored = cas.stage_write(InputSpec::from_bytes("by ref")).await.unwrap();
        cas.finalize_write(&stored).await.unwrap();

        let by_ref = cas
            .stage_write(InputSpec::from_hash(&stored.content_address))
            .await
            .unwrap();
        assert!(by_ref.temp_path.is_none());
        assert!(by_ref.blob_already_exists);
        assert_eq!(by_ref.digests, stored.digests);
        assert_eq!(by_ref.size_bytes, 6);

        let never = digest_bytes(&[Algorithm::Sha256], b"never written").unwrap();
        let err = cas
            .stage_write(InputSpec::from_hash(never.content_address()))
            .await
            .unwrap_err();
        assert!(matches!(err, CaskError::HashNotFound { .. }));
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let temp = TempDir::new().unwrap();
        let cas = engine(temp.path());
        let staged = cas.stage_write(InputSpec::from_bytes("intact")).await.unwrap();
        cas.finalize_write(&staged).await.unwrap();

        assert_eq!(cas.verify(&staged.content_address).await.unwrap(), staged.digests);

        let BlobLocation::Local { path } = cas.disk_path(&staged.content_address).await.unwrap() else {
            panic!("expected a local path");
        };
        std::fs::write(&path, b"tampered").unwrap();
        assert!(matches!(
            cas.verify(&staged.content_address).await,
            Err(CaskError::DigestMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_reference_counted_delete() {
        let temp = TempDir::new().unwrap();
        let cas = engine(temp.path());
        let (db, _db_dir) = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let staged = cas.stage_write(InputSpec::from_bytes("same")).await.unwrap();
        cas.finalize_write(&staged).await.unwrap();
        let a = record("a.txt", b"same");
        let b = record("b.txt", b"same");
        db::insert_file(&mut conn, &a).await.unwrap();
        db::insert_file(&mut conn, &b).await.unwrap();
        cas.refresh_sidecar(&mut conn, &a.content_address).await.unwrap();

        db::delete_file(&mut conn, &a.file_id).await.unwrap();
        let outcome = cas
            .delete(&mut conn, &a.content_address, CasDeleteOptions::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeleteOutcome {
                blob_deleted: false,
                references_remaining: 1
            }
        );
        let sidecar = cas.read_sidecar(&a.content_address).await.unwrap().unwrap();
        assert_eq!(sidecar.file_ids(), vec![b.file_id.as_str()]);

        db::delete_file(&mut conn, &b.file_id).await.unwrap();
        let outcome = cas
            .delete(&mut conn, &a.content_address, CasDeleteOptions::default())
            .await
            .unwrap();
        assert!(outcome.blob_deleted);
        assert!(!cas.exists(&a.content_address).await.unwrap());
        assert!(cas.read_sidecar(&a.content_address).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_blob() {
        let temp = TempDir::new().unwrap();
        let cas = engine(temp.path());
        let (db, _db_dir) = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let staged = cas.stage_write(InputSpec::from_bytes("soft")).await.unwrap();
        cas.finalize_write(&staged).await.unwrap();

        let outcome = cas
            .delete(
                &mut conn,
                &staged.content_address,
                CasDeleteOptions { soft_delete: true },
            )
            .await
            .unwrap();
        assert_eq!(outcome.references_remaining, 0);
        assert!(!outcome.blob_deleted);
        assert!(cas.exists(&staged.content_address).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_missing_blob() {
        let temp = TempDir::new().unwrap();
        let cas = engine(temp.path());
        let never = digest_bytes(&[Algorithm::Sha256], b"never written").unwrap();
        assert!(matches!(
            cas.read(never.content_address(), ReadMode::Bytes).await,
            Err(CaskError::MissingResource { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_addresses_never_reach_storage() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("secret.txt"), b"outside the store").unwrap();
        let cas = engine(temp.path());
        let (db, _db_dir) = test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        for address in ["../../secret.txt", "abcdef", "A".repeat(64).as_str()] {
            assert!(matches!(
                cas.read(address, ReadMode::Bytes).await,
                Err(CaskError::Configuration(_))
            ));
            assert!(cas.exists(address).await.is_err());
            assert!(cas.disk_path(address).await.is_err());
            assert!(cas.verify(address).await.is_err());
            assert!(cas.read_sidecar(address).await.is_err());
            assert!(cas
                .delete(&mut conn, address, CasDeleteOptions::default())
                .await
                .is_err());
        }
        assert!(temp.path().join("secret.txt").exists());
    }

    /// Local storage whose `stat` always fails.
    struct UnstattableStorage(LocalStorage);

    #[async_trait::async_trait]
    impl StorageBackend for UnstattableStorage {
        async fn exists(&self, key: &str) -> CaskResult<bool> {
            self.0.exists(key).await
        }
        async fn read(&self, key: &str) -> CaskResult<Bytes> {
            self.0.read(key).await
        }
        async fn read_stream(&self, key: &str) -> CaskResult<BlobStream> {
            self.0.read_stream(key).await
        }
        async fn write(&self, key: &str, data: Bytes) -> CaskResult<()> {
            self.0.write(key, data).await
        }
        async fn put_file(&self, src: &Path, key: &str) -> CaskResult<()> {
            self.0.put_file(src, key).await
        }
        async fn copy(&self, from: &str, to: &str) -> CaskResult<()> {
            self.0.copy(from, to).await
        }
        async fn delete(&self, key: &str) -> CaskResult<()> {
            self.0.delete(key).await
        }
        async fn mkdir(&self, key: &str) -> CaskResult<()> {
            self.0.mkdir(key).await
        }
        async fn stat(&self, key: &str) -> CaskResult<BlobStat> {
            Err(CaskError::missing(key.to_string()))
        }
        fn location(&self, key: &str) -> CaskResult<BlobLocation> {
            self.0.location(key)
        }
        async fn purge(&self) -> CaskResult<()> {
            self.0.purge().await
        }
    }

    #[tokio::test]
    async fn test_failed_stat_after_digest_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(CaskConfig::with_root(temp.path()));
        let backend: Arc<dyn StorageBackend> =
            Arc::new(UnstattableStorage(LocalStorage::new(config.storage.clone())));
        let cas = CasEngine::with_backend(config, backend);

        let first = cas.stage_write(InputSpec::from_bytes("dup")).await.unwrap();
        cas.finalize_write(&first).await.unwrap();

        // Second write dedups, so timestamps come from the failing stat
        let err = cas.stage_write(InputSpec::from_bytes("dup")).await.unwrap_err();
        assert!(matches!(err, CaskError::MissingResource { .. }));
        assert_eq!(temp_files(temp.path()).await, 0);
    }

    #[tokio::test]
    async fn test_power_wash_local() {
        let temp = TempDir::new().unwrap();
        let cas = engine(temp.path());
        let staged = cas.stage_write(InputSpec::from_bytes("wash")).await.unwrap();
        cas.finalize_write(&staged).await.unwrap();

        cas.power_wash().await.unwrap();
        assert!(!cas.exists(&staged.content_address).await.unwrap());
    }

    #[tokio::test]
    async fn test_object_store_backend() {
        let temp = TempDir::new().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(RemoteStorage::new(Arc::new(InMemory::new()), "blobs"));
        let cas = CasEngine::with_backend(Arc::new(CaskConfig::with_root(temp.path())), backend);

        let staged = cas.stage_write(InputSpec::from_bytes("remote")).await.unwrap();
        assert!(cas.finalize_write(&staged).await.unwrap());
        assert_eq!(temp_files(temp.path()).await, 0);

        let location = cas
            .resolve_location(&staged.content_address, Some("archive"))
            .await
            .unwrap();
        assert_eq!(
            location,
            BlobLocation::Object {
                bucket: "archive".to_string(),
                key: blob_key(&staged.content_address),
            }
        );

        assert!(matches!(cas.power_wash().await, Err(CaskError::Unsupported(_))));
        assert!(cas.exists(&staged.content_address).await.unwrap());
    }
}
