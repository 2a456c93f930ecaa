// Service configuration: file, environment and defaults
use crate::collab::paths::PathRule;
use crate::error::{CaskError, CaskResult};
use crate::hash::{parse_algorithms, Algorithm};
use crate::storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaskConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    /// Digest algorithms; the first one is the canonical content address.
    #[serde(default = "default_digests")]
    pub digests: Vec<Algorithm>,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub path_rules: Vec<PathRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Maximum number of descriptors accepted by one sync call.
    #[serde(default = "default_sync_batch_limit")]
    pub sync_batch_limit: usize,

    /// Media types classified as linked data.
    #[serde(default = "default_rdf_media_types")]
    pub rdf_media_types: Vec<String>,

    /// Filename suffix that forces linked-data classification.
    #[serde(default = "default_rdf_suffix")]
    pub rdf_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Defaults to `{root}/catalog.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub digest: usize,

    #[serde(default = "default_workers")]
    pub linked_data: usize,
}

fn default_digests() -> Vec<Algorithm> {
    vec![Algorithm::Sha256, Algorithm::Blake3]
}

fn default_sync_batch_limit() -> usize {
    1000
}

fn default_rdf_media_types() -> Vec<String> {
    [
        "text/turtle",
        "application/ld+json",
        "application/n-triples",
        "application/n-quads",
        "application/rdf+xml",
        "application/trig",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_rdf_suffix() -> String {
    ".rdf".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sync_batch_limit: default_sync_batch_limit(),
            rdf_media_types: default_rdf_media_types(),
            rdf_suffix: default_rdf_suffix(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_connections: default_max_connections(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            digest: default_workers(),
            linked_data: default_workers(),
        }
    }
}

impl Default for CaskConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            digests: default_digests(),
            ingest: IngestConfig::default(),
            catalog: CatalogConfig::default(),
            workers: WorkerConfig::default(),
            path_rules: Vec::new(),
        }
    }
}

impl CaskConfig {
    /// Local configuration rooted at `root`, everything else default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig::local(root),
            ..Self::default()
        }
    }

    /// Load configuration with the following priority:
    /// 1. CASK_* environment variables
    /// 2. ~/.config/cask/config.toml
    /// 3. Defaults (root at ~/.cache/cask)
    pub async fn load() -> CaskResult<Self> {
        let mut config = match Self::config_file_path() {
            Some(path) if path.exists() => Self::load_from(&path).await?,
            _ => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file.
    pub async fn load_from(path: &Path) -> CaskResult<Self> {
        let content = fs::read_to_string(path).await?;
        let config: CaskConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Get the config file path (~/.config/cask/config.toml)
    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cask").join("config.toml"))
    }

    fn apply_env(&mut self) -> CaskResult<()> {
        self.storage.apply_env()?;

        if let Ok(list) = std::env::var("CASK_DIGESTS") {
            self.digests = parse_algorithms(&list)?;
        }
        if let Ok(limit) = std::env::var("CASK_SYNC_BATCH_LIMIT") {
            self.ingest.sync_batch_limit = limit
                .parse()
                .map_err(|_| CaskError::config(format!("invalid CASK_SYNC_BATCH_LIMIT: {}", limit)))?;
        }
        if let Ok(types) = std::env::var("CASK_RDF_MEDIA_TYPES") {
            self.ingest.rdf_media_types = types
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
        if let Ok(suffix) = std::env::var("CASK_RDF_SUFFIX") {
            self.ingest.rdf_suffix = suffix;
        }
        if let Ok(db) = std::env::var("CASK_DB") {
            self.catalog.db_path = Some(PathBuf::from(db));
        }
        Ok(())
    }

    /// Reject configurations no operation could run with.
    pub fn validate(&self) -> CaskResult<()> {
        if self.digests.is_empty() {
            return Err(CaskError::config("at least one digest algorithm is required"));
        }
        if self.ingest.sync_batch_limit == 0 {
            return Err(CaskError::config("sync_batch_limit must be positive"));
        }
        if self.catalog.max_connections == 0 {
            return Err(CaskError::config("catalog.max_connections must be positive"));
        }
        Ok(())
    }

    /// Canonical algorithm (first configured).
    pub fn canonical_algorithm(&self) -> Algorithm {
        self.digests.first().copied().unwrap_or(Algorithm::Sha256)
    }

    pub fn db_path(&self) -> PathBuf {
        self.catalog
            .db_path
            .clone()
            .unwrap_or_else(|| self.storage.db_path())
    }
}
