// Seams to the systems ingestion calls out to, each taking the caller's connection
pub mod acl;
pub mod directory;
pub mod linked;
pub mod paths;

pub use acl::{AccessGate, AllowAll, StaticAcl};
pub use directory::{DirectoryService, SqlDirectories};
pub use linked::{LinkedData, LinkedDataSummary, NoLinkedData};
pub use paths::{PathResolution, PathResolver, PathRule, RuleResolver, RuleTarget, Transform};
