// Input specs and writes staged ahead of the catalog commit
use crate::error::{CaskError, CaskResult};
use crate::hash::DigestSet;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use tokio::io::AsyncRead;

/// Boxed readable byte stream.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// One validated content source.
pub enum ContentSource {
    /// Read from a stream.
    Stream(ByteStream),
    /// Read from an absolute filesystem path.
    Path(PathBuf),
    /// In-memory content.
    Bytes(Bytes),
    /// Content already stored under this address; verify and reuse it.
    Hash(String),
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentSource::Stream(_) => write!(f, "Stream(..)"),
            ContentSource::Path(p) => write!(f, "Path({})", p.display()),
            ContentSource::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            ContentSource::Hash(h) => write!(f, "Hash({})", h),
        }
    }
}

/// Caller-supplied description of where content comes from.
///
/// Exactly one field must be set; anything else is a configuration error.
#[derive(Default)]
pub struct InputSpec {
    stream: Option<ByteStream>,
    path: Option<PathBuf>,
    bytes: Option<Bytes>,
    hash: Option<String>,
}

impl InputSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new().with_bytes(data)
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new().with_path(path)
    }

    pub fn from_hash(address: impl Into<String>) -> Self {
        Self::new().with_hash(address)
    }

    pub fn from_stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::new().with_stream(reader)
    }

    pub fn with_stream(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stream = Some(Box::new(reader));
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_bytes(mut self, data: impl Into<Bytes>) -> Self {
        self.bytes = Some(data.into());
        self
    }

    pub fn with_hash(mut self, address: impl Into<String>) -> Self {
        self.hash = Some(address.into());
        self
    }

    /// Validate that exactly one source was given.
    pub fn into_source(self) -> CaskResult<ContentSource> {
        let supplied = [
            self.stream.is_some(),
            self.path.is_some(),
            self.bytes.is_some(),
            self.hash.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if supplied != 1 {
            return Err(CaskError::config(format!(
                "exactly one content source is required, got {}",
                supplied
            )));
        }

        if let Some(stream) = self.stream {
            return Ok(ContentSource::Stream(stream));
        }
        if let Some(path) = self.path {
            if !path.is_absolute() {
                return Err(CaskError::config(format!(
                    "content path must be absolute: {}",
                    path.display()
                )));
            }
            return Ok(ContentSource::Path(path));
        }
        if let Some(bytes) = self.bytes {
            return Ok(ContentSource::Bytes(bytes));
        }
        match self.hash {
            Some(hash) => Ok(ContentSource::Hash(hash.trim().to_ascii_lowercase())),
            None => Err(CaskError::config("no content source supplied")),
        }
    }
}

/// Content staged for a write, not yet visible in the blob store.
///
/// Consumed by `finalize_write` or `abort_write`, both of which remove
/// the temp file.
#[derive(Debug, Clone)]
pub struct StagedWrite {
    /// Local temp copy; `None` when the content was referenced by hash.
    pub temp_path: Option<PathBuf>,
    pub digests: DigestSet,
    pub content_address: String,
    /// Backend key the blob lives (or will live) at.
    pub blob_key: String,
    pub blob_already_exists: bool,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}
