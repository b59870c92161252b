//! Retriever configuration, read from `<base>/.sextant/config.toml`.
//!
//! ```toml
//! max_concurrent_files = 4
//!
//! [index]
//! max_elements = 200000
//! metric = "cosine"
//! overfetch_factor = 3
//! max_capacity = 1000000
//! compaction_threshold = 0.25
//!
//! [chunking]
//! max_chunk_size = 1500
//!
//! [embedding]
//! model_name = "jina-embeddings-v2-base-code"
//! max_concurrent_tasks = 2
//! ```
//!
//! Every section and key is optional.

use crate::retrieval::chunker::ChunkOptions;
use crate::retrieval::reconstruction::ReconstructionConfig;
use crate::storage::ann_index::Metric;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sextant_embed::EmbedConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Initial ANN capacity. The index doubles when it fills up.
pub const DEFAULT_MAX_ELEMENTS: usize = 100_000;

/// Search asks the ANN index for this many times `limit` candidates.
pub const DEFAULT_OVERFETCH_FACTOR: usize = 3;

pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 2;

/// Fraction of stale ANN points at which the index is rebuilt.
pub const DEFAULT_COMPACTION_THRESHOLD: f32 = 0.25;

/// Directory under the indexed root holding all sextant state.
pub const DATA_DIR: &str = ".sextant";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub max_elements: usize,
    pub metric: Metric,
    pub overfetch_factor: usize,
    /// Hard ceiling on ANN growth; `None` grows without bound
    pub max_capacity: Option<usize>,
    /// Rebuild the ANN index once this fraction of its points no longer backs a chunk
    pub compaction_threshold: f32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_elements: DEFAULT_MAX_ELEMENTS,
            metric: Metric::Cosine,
            overfetch_factor: DEFAULT_OVERFETCH_FACTOR,
            max_capacity: None,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub index: IndexConfig,
    pub chunking: ChunkOptions,
    pub reconstruction: ReconstructionConfig,
    pub embedding: EmbedConfig,
    /// Files chunked and embedded at the same time by the indexing engine
    pub max_concurrent_files: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            index: IndexConfig::default(),
            chunking: ChunkOptions::default(),
            reconstruction: ReconstructionConfig::default(),
            embedding: EmbedConfig::default(),
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
        }
    }
}

impl RetrieverConfig {
    /// Loads `<base>/.sextant/config.toml`, falling back to defaults when it does not exist.
    pub fn load(base: &Path) -> Result<Self> {
        let path = Self::config_path(base);
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("Invalid config in {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn data_dir(base: &Path) -> PathBuf {
        base.join(DATA_DIR)
    }

    pub fn config_path(base: &Path) -> PathBuf {
        Self::data_dir(base).join("config.toml")
    }

    pub fn database_path(base: &Path) -> PathBuf {
        Self::data_dir(base).join("index.db")
    }

    pub fn ann_index_path(base: &Path) -> PathBuf {
        Self::data_dir(base).join("vectors.usearch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() -> Result<()> {
        let temp_dir = tempdir()?;
        let config = RetrieverConfig::load(temp_dir.path())?;

        assert_eq!(config.index, IndexConfig::default());
        assert_eq!(config.max_concurrent_files, DEFAULT_MAX_CONCURRENT_FILES);
        assert_eq!(config.embedding.model_name, EmbedConfig::default().model_name);
        Ok(())
    }

    #[test]
    fn test_partial_file_overrides() -> Result<()> {
        let temp_dir = tempdir()?;
        std::fs::create_dir_all(RetrieverConfig::data_dir(temp_dir.path()))?;
        std::fs::write(
            RetrieverConfig::config_path(temp_dir.path()),
            r#"
            max_concurrent_files = 4

            [index]
            max_elements = 500
            max_capacity = 2000

            [chunking]
            max_chunk_size = 200

            [embedding]
            model_name = "bge-small-en-v1.5"
            "#,
        )?;

        let config = RetrieverConfig::load(temp_dir.path())?;
        assert_eq!(config.max_concurrent_files, 4);
        assert_eq!(config.index.max_elements, 500);
        assert_eq!(config.index.overfetch_factor, DEFAULT_OVERFETCH_FACTOR);
        assert_eq!(config.index.max_capacity, Some(2000));
        assert_eq!(config.index.compaction_threshold, DEFAULT_COMPACTION_THRESHOLD);
        assert_eq!(config.chunking.max_chunk_size, 200);
        assert_eq!(config.embedding.model_name, "bge-small-en-v1.5");
        Ok(())
    }

    #[test]
    fn test_invalid_file_is_an_error() -> Result<()> {
        let temp_dir = tempdir()?;
        std::fs::create_dir_all(RetrieverConfig::data_dir(temp_dir.path()))?;
        std::fs::write(
            RetrieverConfig::config_path(temp_dir.path()),
            "[index]\nmax_elements = \"lots\"\n",
        )?;

        assert!(RetrieverConfig::load(temp_dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_paths() {
        let base = Path::new("/project");
        assert_eq!(
            RetrieverConfig::database_path(base),
            PathBuf::from("/project/.sextant/index.db")
        );
        assert_eq!(
            RetrieverConfig::ann_index_path(base),
            PathBuf::from("/project/.sextant/vectors.usearch")
        );
    }
}
