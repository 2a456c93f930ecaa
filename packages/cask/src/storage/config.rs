// Storage configuration management
use crate::error::{CaskError, CaskResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which backend holds blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Blobs live under `{root}/cas/` on the local filesystem.
    Local,

    /// Blobs live in an S3-compatible bucket.
    ObjectStore {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_key_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret_access_key: Option<String>,
        #[serde(default)]
        allow_http: bool,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for local blobs, temp files and the catalog
    pub root: PathBuf,

    #[serde(default)]
    pub backend: BackendConfig,
}

impl StorageConfig {
    /// Local storage rooted at `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backend: BackendConfig::Local,
        }
    }

    /// Apply `CASK_ROOT`, `CASK_BACKEND` and the `CASK_S3_*` variables.
    pub fn apply_env(&mut self) -> CaskResult<()> {
        if let Ok(root) = std::env::var("CASK_ROOT") {
            self.root = PathBuf::from(root);
        }

        match std::env::var("CASK_BACKEND").ok().as_deref() {
            None => {}
            Some("local") => self.backend = BackendConfig::Local,
            Some("s3") | Some("object_store") => {
                let bucket = std::env::var("CASK_S3_BUCKET").map_err(|_| {
                    CaskError::config("CASK_BACKEND=s3 requires CASK_S3_BUCKET")
                })?;
                self.backend = BackendConfig::ObjectStore {
                    bucket,
                    region: std::env::var("CASK_S3_REGION").ok(),
                    endpoint: std::env::var("CASK_S3_ENDPOINT").ok(),
                    access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
                    secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
                    allow_http: std::env::var("CASK_S3_ALLOW_HTTP")
                        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                        .unwrap_or(false),
                };
            }
            Some(other) => {
                return Err(CaskError::config(format!(
                    "unknown storage backend: {}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Get the blob directory path
    pub fn store_path(&self) -> PathBuf {
        self.root.join("cas")
    }

    /// Get the staging directory for in-flight writes
    pub fn tmp_path(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Get the metadata database path
    pub fn db_path(&self) -> PathBuf {
        self.root.join("catalog.db")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cask");

        Self::local(root)
    }
}
