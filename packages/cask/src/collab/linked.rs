// Linked-data indexing hook
use crate::db::FileRecord;
use crate::error::CaskResult;
use crate::workers::WorkerPool;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::path::Path;

/// What an insert into the linked-data index produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedDataSummary {
    pub triples: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<String>,
}

/// Indexes linked-data files inside the ingesting transaction.
#[async_trait]
pub trait LinkedData: Send + Sync {
    /// Index the freshly stored file. `source` is a readable local copy of
    /// the content when one exists (the staged temp file). Parsing belongs
    /// on `workers` under [`TaskKind::LinkedData`](crate::workers::TaskKind).
    async fn insert(
        &self,
        conn: &mut SqliteConnection,
        workers: &WorkerPool,
        file_id: &str,
        source: Option<&Path>,
    ) -> CaskResult<LinkedDataSummary>;

    /// Drop everything indexed for `record`.
    async fn delete(&self, conn: &mut SqliteConnection, record: &FileRecord) -> CaskResult<()>;
}

/// Linked-data indexing disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLinkedData;

#[async_trait]
impl LinkedData for NoLinkedData {
    async fn insert(
        &self,
        _conn: &mut SqliteConnection,
        _workers: &WorkerPool,
        file_id: &str,
        _source: Option<&Path>,
    ) -> CaskResult<LinkedDataSummary> {
        tracing::debug!(file_id, "Linked-data indexing disabled, skipping");
        Ok(LinkedDataSummary::default())
    }

    async fn delete(&self, _conn: &mut SqliteConnection, _record: &FileRecord) -> CaskResult<()> {
        Ok(())
    }
}
