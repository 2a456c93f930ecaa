// Digest engine: one pass over any content source
use super::blob_key;
use super::staging::ContentSource;
use crate::error::{CaskError, CaskResult};
use crate::hash::{digest_bytes, digest_reader, digest_stream_to, Algorithm, DigestSet, MultiHasher};
use crate::storage::StorageBackend;
use crate::workers::{TaskKind, WorkerPool};
use futures::StreamExt;
use std::io::Write;
use std::path::Path;
use tokio::fs;

/// Result of digesting one content source.
#[derive(Debug, Clone)]
pub struct Digested {
    pub digests: DigestSet,
    pub size_bytes: u64,
    /// A blob already exists at the resulting content address.
    pub blob_exists: bool,
}

/// Compute every configured digest of `source` in a single read.
///
/// Stream, path and bytes sources are copied into `temp` while hashing.
/// Hash sources are verified against the stored blob instead.
pub async fn digest_source(
    backend: &dyn StorageBackend,
    workers: &WorkerPool,
    algorithms: &[Algorithm],
    source: ContentSource,
    temp: Option<&Path>,
) -> CaskResult<Digested> {
    let (digests, size_bytes) = match source {
        ContentSource::Hash(address) => {
            let digests = verify_stored(backend, algorithms, &address).await?;
            let size_bytes = backend.stat(&blob_key(&address)).await?.size;
            return Ok(Digested {
                digests,
                size_bytes,
                blob_exists: true,
            });
        }
        ContentSource::Bytes(data) => {
            let temp = temp_required(temp)?;
            let algs = algorithms.to_vec();
            let hashed = data.clone();
            let digests = workers
                .run(TaskKind::Digest, move || digest_bytes(&algs, &hashed))
                .await?;
            fs::write(temp, &data).await?;
            (digests, data.len() as u64)
        }
        ContentSource::Path(path) => {
            let temp = temp_required(temp)?.to_path_buf();
            if !fs::try_exists(&path).await? {
                return Err(CaskError::missing(path.display().to_string()));
            }
            let algs = algorithms.to_vec();
            workers
                .run(TaskKind::Digest, move || {
                    let src = std::fs::File::open(&path)?;
                    let mut out = std::fs::File::create(&temp)?;
                    let result = digest_reader(&algs, src, Some(&mut out as &mut dyn Write))?;
                    out.sync_all()?;
                    Ok(result)
                })
                .await?
        }
        ContentSource::Stream(reader) => {
            let temp = temp_required(temp)?;
            let mut out = fs::File::create(temp).await?;
            let result = digest_stream_to(algorithms, reader, &mut out).await?;
            out.sync_all().await?;
            result
        }
    };

    let blob_exists = backend.exists(&blob_key(digests.content_address())).await?;
    Ok(Digested {
        digests,
        size_bytes,
        blob_exists,
    })
}

fn temp_required(temp: Option<&Path>) -> CaskResult<&Path> {
    temp.ok_or_else(|| CaskError::config("staging requires a temp location"))
}

/// Recompute the digests of a stored blob and check it still matches its
/// address.
pub async fn verify_stored(
    backend: &dyn StorageBackend,
    algorithms: &[Algorithm],
    address: &str,
) -> CaskResult<DigestSet> {
    let canonical = algorithms
        .first()
        .copied()
        .ok_or_else(|| CaskError::config("no digest algorithms configured"))?;
    canonical.validate_address(address)?;

    let key = blob_key(address);
    if !backend.exists(&key).await? {
        return Err(CaskError::HashNotFound {
            address: address.to_string(),
        });
    }

    let mut hasher = MultiHasher::new(algorithms);
    let mut stream = backend.read_stream(&key).await?;
    while let Some(chunk) = stream.next().await {
        hasher.update(&chunk?);
    }
    let digests = hasher.finish()?;

    if digests.content_address() != address {
        return Err(CaskError::DigestMismatch {
            expected: address.to_string(),
            computed: digests.content_address().to_string(),
        });
    }
    Ok(digests)
}
