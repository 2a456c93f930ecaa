// Bounded worker pools for CPU-bound work
use crate::config::WorkerConfig;
use crate::error::CaskResult;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Kinds of offloaded work, each with its own pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Digest,
    LinkedData,
}

/// Fixed-size pools, one per task kind.
///
/// Each pool is a fair semaphore: when every worker of a kind is busy,
/// new tasks wait in arrival order.
#[derive(Clone)]
pub struct WorkerPool {
    digest: Arc<Semaphore>,
    linked_data: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            digest: Arc::new(Semaphore::new(config.digest.max(1))),
            linked_data: Arc::new(Semaphore::new(config.linked_data.max(1))),
        }
    }

    fn semaphore(&self, kind: TaskKind) -> &Arc<Semaphore> {
        match kind {
            TaskKind::Digest => &self.digest,
            TaskKind::LinkedData => &self.linked_data,
        }
    }

    /// Workers of `kind` currently free.
    pub fn available(&self, kind: TaskKind) -> usize {
        self.semaphore(kind).available_permits()
    }

    /// Run `task` on a blocking thread once a worker of `kind` is free.
    pub async fn run<T, F>(&self, kind: TaskKind, task: F) -> CaskResult<T>
    where
        F: FnOnce() -> CaskResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(self.semaphore(kind))
            .acquire_owned()
            .await
            .map_err(|_| std::io::Error::other("worker pool closed"))?;

        let handle = tokio::task::spawn_blocking(move || {
            let result = task();
            drop(permit);
            result
        });
        handle.await?
    }
}
