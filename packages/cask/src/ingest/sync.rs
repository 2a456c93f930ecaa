// Batch registration of already-stored content
use super::{Ingestor, WriteOptions};
use crate::cas::InputSpec;
use crate::context::RequestContext;
use crate::error::{CaskError, CaskResult};
use crate::manifest::{SyncDescriptor, SyncFailure, SyncReport, SyncSuccess};

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Repoint paths that already exist.
    pub replace: bool,
}

impl Ingestor {
    /// Register each descriptor's path against its existing blob.
    ///
    /// Items run one at a time as independent writes; a failing item lands
    /// in the report instead of stopping the batch. A well-formed address
    /// with no blob goes to `does_not_exist`; a malformed one is an error.
    /// Only an oversized batch fails the call as a whole.
    pub async fn sync(
        &self,
        ctx: &RequestContext,
        descriptors: &[SyncDescriptor],
        opts: SyncOptions,
    ) -> CaskResult<SyncReport> {
        let limit = self.config().ingest.sync_batch_limit;
        if descriptors.len() > limit {
            return Err(CaskError::config(format!(
                "sync batch of {} exceeds the limit of {}",
                descriptors.len(),
                limit
            )));
        }

        let mut report = SyncReport::default();
        for descriptor in descriptors {
            let item_ctx = ctx.with_path(&descriptor.file_path);
            let options = WriteOptions {
                replace: opts.replace,
                ..WriteOptions::default()
            };

            match self
                .write(&item_ctx, InputSpec::from_hash(&descriptor.content_address), options)
                .await
            {
                Ok(outcome) => report.success.push(SyncSuccess {
                    file_path: item_ctx.path.clone(),
                    file_id: outcome.file_id,
                    content_address: outcome.metadata.content_address,
                }),
                Err(CaskError::HashNotFound { .. }) => report.does_not_exist.push(descriptor.clone()),
                Err(e) => {
                    tracing::debug!(
                        trace_id = %ctx.trace_id,
                        path = %item_ctx.path,
                        error = %e,
                        "Sync item failed"
                    );
                    report.errors.push(SyncFailure {
                        file_path: descriptor.file_path.clone(),
                        content_address: descriptor.content_address.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            trace_id = %ctx.trace_id,
            actor = %ctx.actor,
            success = report.success.len(),
            errors = report.errors.len(),
            does_not_exist = report.does_not_exist.len(),
            "Sync finished"
        );
        Ok(report)
    }
}
