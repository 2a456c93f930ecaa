// Sync manifest and report types
//
// A sync manifest lists catalog paths and the content addresses they should
// point at; the blobs are expected to be in the store already. The report
// sorts every entry into exactly one outcome bucket.

use crate::error::CaskResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One path to register against an already-stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDescriptor {
    pub file_path: String,
    pub content_address: String,
}

impl SyncDescriptor {
    pub fn new(file_path: impl Into<String>, content_address: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            content_address: content_address.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncManifest {
    pub entries: Vec<SyncDescriptor>,
}

impl SyncManifest {
    /// Read a manifest from a JSON file.
    pub async fn load(path: &Path) -> CaskResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSuccess {
    pub file_path: String,
    pub file_id: String,
    pub content_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub file_path: String,
    pub content_address: String,
    pub error: String,
}

/// Per-entry outcome of a sync batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: Vec<SyncSuccess>,
    /// Entries that failed for any other reason, malformed addresses included.
    pub errors: Vec<SyncFailure>,
    /// Entries with a well-formed content address that has no blob.
    pub does_not_exist: Vec<SyncDescriptor>,
}

impl SyncReport {
    pub fn total(&self) -> usize {
        self.success.len() + self.errors.len() + self.does_not_exist.len()
    }
}
