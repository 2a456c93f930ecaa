// Sidecar metadata stored as `<blob key>.json` beside each blob
use crate::db::FileRecord;
use crate::hash::DigestSet;
use serde::{Deserialize, Serialize};

/// Which catalog records reference a blob, readable without the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    pub hash_id: String,
    /// Every digest of the blob.
    pub value: DigestSet,
    pub metadata: BlobSummary,
    pub files: Vec<SidecarFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSummary {
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarFile {
    pub file_id: String,
    pub filename: String,
    pub directory: String,
    pub metadata: serde_json::Value,
    pub partition_keys: Vec<String>,
}

impl From<&FileRecord> for SidecarFile {
    fn from(record: &FileRecord) -> Self {
        Self {
            file_id: record.file_id.clone(),
            filename: record.filename.clone(),
            directory: record.directory.clone(),
            metadata: record.metadata.clone(),
            partition_keys: record.partition_keys.clone(),
        }
    }
}

impl Sidecar {
    /// Build from the records currently referencing one address.
    ///
    /// Returns `None` for an empty reference set.
    pub fn from_references(address: &str, references: &[FileRecord]) -> Option<Self> {
        let first = references.first()?;
        Some(Self {
            hash_id: address.to_string(),
            value: first.digests.clone(),
            metadata: BlobSummary {
                size_bytes: first.size_bytes,
            },
            files: references.iter().map(SidecarFile::from).collect(),
        })
    }

    pub fn file_ids(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.file_id.as_str()).collect()
    }
}
