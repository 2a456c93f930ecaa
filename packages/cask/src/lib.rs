// Content-addressed file store with a transactional SQLite catalog
pub mod cas;
pub mod collab;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod hash;
pub mod ingest;
pub mod manifest;
pub mod storage;
pub mod workers;

pub use cas::{BlobContent, CasEngine, InputSpec, ReadMode};
pub use config::CaskConfig;
pub use context::{Permission, RequestContext};
pub use error::{CaskError, CaskResult};
pub use ingest::{
    DeleteOptions, DeleteReport, FilePatch, Ingestor, ReadOptions, SyncOptions, WriteOptions,
    WriteOutcome,
};
pub use manifest::{SyncDescriptor, SyncManifest, SyncReport};
