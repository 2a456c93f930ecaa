// Ingestion pipeline tying the CAS engine to the catalog
mod classify;
mod sync;

pub use classify::{classify, Classification};
pub use sync::SyncOptions;

use crate::cas::{BlobContent, CasDeleteOptions, CasEngine, InputSpec, ReadMode, StagedWrite};
use crate::collab::acl::{self, AccessGate, AllowAll};
use crate::collab::{
    DirectoryService, LinkedData, NoLinkedData, PathResolver, RuleResolver, SqlDirectories,
};
use crate::config::CaskConfig;
use crate::context::{Permission, RequestContext};
use crate::db::{self, FileRecord, MetadataDb, ResourceType};
use crate::error::{CaskError, CaskResult};
use chrono::Utc;
use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Overwrite an existing file at the target path.
    pub replace: bool,
    /// Mime type override; skips extension lookup.
    pub mime_type: Option<String>,
    /// Where the content came from, used as a classification fallback.
    pub source_path: Option<PathBuf>,
    /// Merged with the keys derived from path rules.
    pub partition_keys: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Remove the record but never the blob.
    pub soft_delete: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub mode: ReadMode,
}

/// Fields a patch may change. `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct FilePatch {
    /// Merged into an existing JSON object; replaces anything else.
    pub metadata: Option<serde_json::Value>,
    pub partition_keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub file_id: String,
    /// Bytes were copied into the store; `false` on a dedup hit.
    pub copied: bool,
    pub metadata: FileRecord,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub metadata: FileRecord,
    pub blob_deleted: bool,
    pub references_remaining: u64,
}

/// Write/delete/sync pipeline over a catalog and a CAS engine.
///
/// A file record and its linked-data rows are persisted in one catalog
/// transaction; staged content is only published after that commits.
/// Anything failing earlier rolls back and aborts the staged write.
pub struct Ingestor {
    config: Arc<CaskConfig>,
    db: MetadataDb,
    cas: Arc<CasEngine>,
    acl: Arc<dyn AccessGate>,
    directories: Arc<dyn DirectoryService>,
    paths: Arc<dyn PathResolver>,
    linked: Arc<dyn LinkedData>,
}

impl Ingestor {
    /// Orchestrator with the default collaborators: allow-all access,
    /// catalog-backed directories, the configured path rules and no
    /// linked-data indexing.
    pub fn new(config: Arc<CaskConfig>, db: MetadataDb, cas: Arc<CasEngine>) -> CaskResult<Self> {
        let paths = RuleResolver::new(&config.path_rules)?;
        Ok(Self {
            config,
            db,
            cas,
            acl: Arc::new(AllowAll),
            directories: Arc::new(SqlDirectories),
            paths: Arc::new(paths),
            linked: Arc::new(NoLinkedData),
        })
    }

    /// Open the catalog and CAS engine described by `config`.
    pub async fn open(config: CaskConfig) -> CaskResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let db = MetadataDb::open(config.db_path(), config.catalog.max_connections).await?;
        let cas = Arc::new(CasEngine::new(config.clone()));
        Self::new(config, db, cas)
    }

    pub fn with_access_gate(mut self, gate: Arc<dyn AccessGate>) -> Self {
        self.acl = gate;
        self
    }

    pub fn with_directories(mut self, directories: Arc<dyn DirectoryService>) -> Self {
        self.directories = directories;
        self
    }

    pub fn with_path_resolver(mut self, paths: Arc<dyn PathResolver>) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_linked_data(mut self, linked: Arc<dyn LinkedData>) -> Self {
        self.linked = linked;
        self
    }

    pub fn config(&self) -> &CaskConfig {
        &self.config
    }

    pub fn db(&self) -> &MetadataDb {
        &self.db
    }

    pub fn cas(&self) -> &CasEngine {
        &self.cas
    }

    /// Store content at `ctx.path`.
    pub async fn write(
        &self,
        ctx: &RequestContext,
        input: InputSpec,
        opts: WriteOptions,
    ) -> CaskResult<WriteOutcome> {
        if ctx.filename().is_empty() {
            return Err(CaskError::config(format!("not a file path: {}", ctx.path)));
        }

        let mut conn = self.db.pool().acquire().await?;
        acl::require(self.acl.as_ref(), &mut conn, ctx, Permission::Write).await?;

        let prior = db::get_file_by_path(&mut conn, ctx.directory(), ctx.filename()).await?;
        if prior.is_some() && !opts.replace {
            return Err(CaskError::DuplicateFile {
                path: ctx.path.clone(),
            });
        }

        let staged = self.cas.stage_write(input).await?;
        tracing::debug!(
            trace_id = %ctx.trace_id,
            path = %ctx.path,
            address = %staged.content_address,
            "Content staged"
        );

        let classification = classify(
            &self.config.ingest,
            &ctx.path,
            opts.mime_type.as_deref(),
            opts.source_path.as_deref(),
        );

        let mut tx = match conn.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                self.cas.abort_write(&staged).await;
                return Err(e.into());
            }
        };
        let persisted = self
            .persist(&mut tx, ctx, &staged, &classification, &opts, prior.as_ref())
            .await;
        let committed = match persisted {
            Ok(record) => tx.commit().await.map(|_| record).map_err(CaskError::from),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(trace_id = %ctx.trace_id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        };
        let record = match committed {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    trace_id = %ctx.trace_id,
                    actor = %ctx.actor,
                    path = %ctx.path,
                    error = %e,
                    "Write rolled back"
                );
                self.cas.abort_write(&staged).await;
                return Err(e);
            }
        };

        let copied = match self.cas.finalize_write(&staged).await {
            Ok(copied) => copied,
            Err(e) => {
                tracing::error!(
                    trace_id = %ctx.trace_id,
                    path = %ctx.path,
                    address = %staged.content_address,
                    error = %e,
                    "Finalize failed after commit"
                );
                self.cas.abort_write(&staged).await;
                return Err(e);
            }
        };

        tracing::info!(
            trace_id = %ctx.trace_id,
            actor = %ctx.actor,
            path = %ctx.path,
            address = %record.content_address,
            copied,
            replaced = prior.is_some(),
            "Write committed"
        );

        self.after_commit(&mut conn, ctx, &record, prior.as_ref()).await;

        Ok(WriteOutcome {
            file_id: record.file_id.clone(),
            copied,
            metadata: record,
        })
    }

    // Directory, partitions, record and linked data; runs inside `conn`'s
    // open transaction.
    async fn persist(
        &self,
        conn: &mut SqliteConnection,
        ctx: &RequestContext,
        staged: &StagedWrite,
        classification: &Classification,
        opts: &WriteOptions,
        prior: Option<&FileRecord>,
    ) -> CaskResult<FileRecord> {
        let directory_id = self.directories.ensure_path(conn, ctx.directory()).await?;

        let resolution = self.paths.resolve(ctx.directory())?;
        let mut partition_keys: Vec<String> = Vec::new();
        for key in opts.partition_keys.iter().cloned().chain(resolution.partition_keys) {
            if !partition_keys.contains(&key) {
                partition_keys.push(key);
            }
        }

        let now = Utc::now();
        let record = FileRecord {
            file_id: prior
                .map(|p| p.file_id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            directory_id,
            directory: ctx.directory().to_string(),
            filename: ctx.filename().to_string(),
            content_address: staged.content_address.clone(),
            digests: staged.digests.clone(),
            size_bytes: staged.size_bytes,
            mime_type: classification.mime_type.clone(),
            resource_type: classification.resource_type,
            partition_keys,
            bucket: resolution.bucket,
            metadata: opts
                .metadata
                .clone()
                .or_else(|| prior.map(|p| p.metadata.clone()))
                .unwrap_or_else(|| serde_json::json!({})),
            created_at: prior.map(|p| p.created_at).unwrap_or(now),
            modified_at: now,
        };

        match prior {
            Some(prior) => {
                if prior.resource_type == ResourceType::Rdf {
                    self.linked.delete(conn, prior).await?;
                }
                db::update_file_record(conn, &record).await?;
            }
            None => db::insert_file(conn, &record).await?,
        }

        if record.resource_type == ResourceType::Rdf {
            let summary = self
                .linked
                .insert(
                    conn,
                    self.cas.workers(),
                    &record.file_id,
                    staged.temp_path.as_deref(),
                )
                .await?;
            tracing::debug!(
                trace_id = %ctx.trace_id,
                file_id = %record.file_id,
                triples = summary.triples,
                "Linked data indexed"
            );
        }

        Ok(record)
    }

    // Best effort: the write is already durable, so nothing here is surfaced.
    async fn after_commit(
        &self,
        conn: &mut SqliteConnection,
        ctx: &RequestContext,
        record: &FileRecord,
        prior: Option<&FileRecord>,
    ) {
        if let Err(e) = self.cas.refresh_sidecar(conn, &record.content_address).await {
            tracing::warn!(
                trace_id = %ctx.trace_id,
                address = %record.content_address,
                error = %e,
                "Sidecar refresh failed"
            );
        }

        let Some(prior) = prior else { return };
        if prior.content_address == record.content_address {
            return;
        }
        match self
            .cas
            .delete(conn, &prior.content_address, CasDeleteOptions::default())
            .await
        {
            Ok(outcome) => tracing::debug!(
                trace_id = %ctx.trace_id,
                address = %prior.content_address,
                blob_deleted = outcome.blob_deleted,
                remaining = outcome.references_remaining,
                "Replaced content released"
            ),
            Err(e) => tracing::warn!(
                trace_id = %ctx.trace_id,
                address = %prior.content_address,
                error = %e,
                "Orphan cleanup failed"
            ),
        }
    }

    /// Remove the file at `ctx.path`, releasing its blob when unreferenced.
    pub async fn delete(&self, ctx: &RequestContext, opts: DeleteOptions) -> CaskResult<DeleteReport> {
        let mut conn = self.db.pool().acquire().await?;
        acl::require(self.acl.as_ref(), &mut conn, ctx, Permission::Write).await?;

        let record = self.load(&mut conn, ctx).await?;

        let mut tx = conn.begin().await?;
        let removed = self.remove_record(&mut tx, &record).await;
        match removed {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(trace_id = %ctx.trace_id, error = %rollback, "Rollback failed");
                }
                return Err(e);
            }
        }

        let outcome = self
            .cas
            .delete(
                &mut conn,
                &record.content_address,
                CasDeleteOptions {
                    soft_delete: opts.soft_delete,
                },
            )
            .await?;

        tracing::info!(
            trace_id = %ctx.trace_id,
            actor = %ctx.actor,
            path = %ctx.path,
            address = %record.content_address,
            blob_deleted = outcome.blob_deleted,
            remaining = outcome.references_remaining,
            soft = opts.soft_delete,
            "File deleted"
        );

        Ok(DeleteReport {
            metadata: record,
            blob_deleted: outcome.blob_deleted,
            references_remaining: outcome.references_remaining,
        })
    }

    async fn remove_record(&self, conn: &mut SqliteConnection, record: &FileRecord) -> CaskResult<()> {
        self.linked.delete(conn, record).await?;
        if !db::delete_file(conn, &record.file_id).await? {
            return Err(CaskError::missing(record.path()));
        }
        Ok(())
    }

    /// Content of the file at `ctx.path`.
    ///
    /// A record whose blob is missing yields [`CaskError::BlobUnavailable`],
    /// which callers should retry.
    pub async fn read(&self, ctx: &RequestContext, opts: ReadOptions) -> CaskResult<BlobContent> {
        let record = self.stat(ctx).await?;
        match self.cas.read(&record.content_address, opts.mode).await {
            Err(CaskError::MissingResource { .. }) => {
                tracing::warn!(
                    trace_id = %ctx.trace_id,
                    path = %ctx.path,
                    address = %record.content_address,
                    "Catalog points at a missing blob"
                );
                Err(CaskError::BlobUnavailable {
                    address: record.content_address,
                })
            }
            other => other,
        }
    }

    /// File record at `ctx.path`.
    pub async fn stat(&self, ctx: &RequestContext) -> CaskResult<FileRecord> {
        let mut conn = self.db.pool().acquire().await?;
        acl::require(self.acl.as_ref(), &mut conn, ctx, Permission::Read).await?;
        self.load(&mut conn, ctx).await
    }

    /// Update metadata and/or partition keys of the file at `ctx.path`.
    pub async fn patch(&self, ctx: &RequestContext, patch: FilePatch) -> CaskResult<FileRecord> {
        let mut conn = self.db.pool().acquire().await?;
        acl::require(self.acl.as_ref(), &mut conn, ctx, Permission::Write).await?;

        let record = self.load(&mut conn, ctx).await?;
        let metadata = patch
            .metadata
            .map(|changes| merge_metadata(record.metadata.clone(), changes));

        let mut tx = conn.begin().await?;
        db::patch_file(
            &mut tx,
            &record.file_id,
            metadata.as_ref(),
            patch.partition_keys.as_deref(),
            Utc::now(),
        )
        .await?;
        tx.commit().await?;

        if let Err(e) = self.cas.refresh_sidecar(&mut conn, &record.content_address).await {
            tracing::warn!(trace_id = %ctx.trace_id, error = %e, "Sidecar refresh failed");
        }

        tracing::info!(trace_id = %ctx.trace_id, actor = %ctx.actor, path = %ctx.path, "File patched");
        db::get_file(&mut conn, &record.file_id)
            .await?
            .ok_or_else(|| CaskError::missing(ctx.path.clone()))
    }

    /// Wipe the blob store and the catalog. Object stores refuse.
    pub async fn power_wash(&self, ctx: &RequestContext) -> CaskResult<()> {
        let mut conn = self.db.pool().acquire().await?;
        acl::require(self.acl.as_ref(), &mut conn, ctx, Permission::Write).await?;

        self.cas.power_wash().await?;
        let mut tx = conn.begin().await?;
        db::clear(&mut tx).await?;
        tx.commit().await?;

        tracing::warn!(trace_id = %ctx.trace_id, actor = %ctx.actor, "Store power-washed");
        Ok(())
    }

    async fn load(&self, conn: &mut SqliteConnection, ctx: &RequestContext) -> CaskResult<FileRecord> {
        db::get_file_by_path(conn, ctx.directory(), ctx.filename())
            .await?
            .ok_or_else(|| CaskError::missing(ctx.path.clone()))
    }
}

/// Shallow-merge two JSON objects; a non-object patch replaces the value.
fn merge_metadata(current: serde_json::Value, changes: serde_json::Value) -> serde_json::Value {
    match (current, changes) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(changes)) => {
            for (key, value) in changes {
                if value.is_null() {
                    base.remove(&key);
                } else {
                    base.insert(key, value);
                }
            }
            serde_json::Value::Object(base)
        }
        (_, changes) => changes,
    }
}
