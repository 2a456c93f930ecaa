// Error taxonomy shared by the CAS engine, catalog and orchestrator
use crate::context::Permission;

/// Errors surfaced by cask operations.
#[derive(Debug, thiserror::Error)]
pub enum CaskError {
    /// Write target already exists and replace was not requested.
    #[error("file already exists: {path}")]
    DuplicateFile { path: String },

    /// Read, delete or metadata target is absent.
    #[error("resource not found: {what}")]
    MissingResource { what: String },

    /// A reference-only write points at an address with no blob.
    #[error("no blob stored for hash {address}")]
    HashNotFound { address: String },

    #[error("{actor} may not {permission} {path}")]
    AccessDenied {
        actor: String,
        path: String,
        permission: Permission,
    },

    /// Malformed input spec or configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Catalog row exists but the blob is momentarily absent (crash between
    /// commit and finalize). Retrying is expected to succeed.
    #[error("blob {address} is not available yet")]
    BlobUnavailable { address: String },

    /// Verify-and-recompute found bytes that do not match their address.
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl CaskError {
    pub fn missing(what: impl Into<String>) -> Self {
        CaskError::MissingResource { what: what.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CaskError::Configuration(msg.into())
    }

    /// Whether the caller should retry rather than treat this as final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaskError::BlobUnavailable { .. })
    }

    /// Whether this is one of the not-found kinds.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CaskError::MissingResource { .. } | CaskError::HashNotFound { .. }
        )
    }
}

/// Result alias for cask operations.
pub type CaskResult<T> = Result<T, CaskError>;
