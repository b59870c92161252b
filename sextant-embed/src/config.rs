//! Configuration for embedding models

use crate::error::{EmbedError, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound on the derived concurrency when none is configured.
pub const MAX_DEFAULT_CONCURRENCY: usize = 8;

/// Models whose ONNX sessions are large enough that running one per core
/// exhausts memory on ordinary laptops.
const MEMORY_HEAVY_MODELS: &[&str] = &[
    "nomic-embed-text-v1.5",
    "jina-embeddings-v2-base-code",
    "bge-base-en-v1.5",
    "bge-large-en-v1.5",
    "mxbai-embed-large-v1",
];

/// How token vectors are pooled into one sentence vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingStrategy {
    /// Use the `[CLS]` token vector
    Cls,
    /// Average all token vectors
    #[default]
    Mean,
}

/// Tokenizer files for a local ONNX model
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct TokenizerConfig {
    /// Path to the tokenizer.json file
    pub tokenizer_path: PathBuf,
    /// Path to the config.json file
    pub config_path: PathBuf,
    /// Path to the special_tokens_map.json file
    pub special_tokens_map_path: PathBuf,
    /// Path to the tokenizer_config.json file (optional, a minimal one is generated if missing)
    #[builder(default)]
    pub tokenizer_config_path: Option<PathBuf>,
}

impl TokenizerConfig {
    pub fn builder() -> TokenizerConfigBuilder {
        TokenizerConfigBuilder::default()
    }

    /// Standard tokenizer layout inside a model directory
    pub fn standard<P: AsRef<Path>>(model_dir: P) -> Self {
        let model_dir = model_dir.as_ref();
        Self {
            tokenizer_path: model_dir.join("tokenizer.json"),
            config_path: model_dir.join("config.json"),
            special_tokens_map_path: model_dir.join("special_tokens_map.json"),
            tokenizer_config_path: Some(model_dir.join("tokenizer_config.json")),
        }
    }

    /// Validate that all required tokenizer files exist
    pub fn validate(&self) -> Result<()> {
        let paths_to_check = [
            ("tokenizer", &self.tokenizer_path),
            ("config", &self.config_path),
            ("special tokens map", &self.special_tokens_map_path),
        ];

        for (name, path) in &paths_to_check {
            if !path.exists() {
                tracing::error!("Missing {}: {}", name, path.display());
                return Err(EmbedError::ModelFileNotFound {
                    path: path.to_path_buf(),
                });
            }
        }

        if let Some(path) = &self.tokenizer_config_path {
            if !path.exists() {
                tracing::warn!(
                    "tokenizer_config.json not found at {}, will generate minimal config",
                    path.display()
                );
            }
        }

        Ok(())
    }
}

/// Configuration for embedding models.
///
/// A model is either one of fastembed's built-in models (downloaded into
/// `model_base_path` on first use) or a local ONNX export living at
/// `model_base_path/model_name`, in which case `tokenizer_config` must be set.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct EmbedConfig {
    /// Directory holding downloaded and local model files
    #[builder(default = r#"PathBuf::from("models")"#)]
    #[serde(default = "default_model_base_path")]
    pub model_base_path: PathBuf,
    /// Name of the embedding model to use
    pub model_name: String,
    /// Maximum number of tokens fed to the model per text
    #[builder(default = "512")]
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    /// Pooling applied to local ONNX models
    #[builder(default)]
    #[serde(default)]
    pub pooling: PoolingStrategy,
    /// Whether to L2-normalize embeddings
    #[builder(default = "true")]
    #[serde(default = "default_normalize")]
    pub normalize: bool,
    /// Maximum batch size handed to the model in one call
    #[builder(default = "16")]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Cap on concurrent embedding calls; derived from the CPU count when unset
    #[builder(default)]
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
    /// Tokenizer files, only for local ONNX models
    #[builder(default)]
    #[serde(default)]
    pub tokenizer_config: Option<TokenizerConfig>,
}

fn default_model_base_path() -> PathBuf {
    PathBuf::from("models")
}

fn default_context_length() -> usize {
    512
}

fn default_normalize() -> bool {
    true
}

fn default_batch_size() -> usize {
    16
}

impl EmbedConfig {
    pub fn builder() -> EmbedConfigBuilder {
        EmbedConfigBuilder::default()
    }

    /// Configuration for a built-in fastembed model
    pub fn new<P: AsRef<Path>>(model_base_path: P, model_name: impl Into<String>) -> Self {
        Self {
            model_base_path: model_base_path.as_ref().to_path_buf(),
            model_name: model_name.into(),
            context_length: default_context_length(),
            pooling: PoolingStrategy::default(),
            normalize: true,
            batch_size: default_batch_size(),
            max_concurrent_tasks: None,
            tokenizer_config: None,
        }
    }

    /// Configuration for a local ONNX model with the standard tokenizer layout
    pub fn local<P: AsRef<Path>>(model_base_path: P, model_name: impl Into<String>) -> Self {
        let mut config = Self::new(model_base_path, model_name);
        config.tokenizer_config = Some(TokenizerConfig::standard(config.model_path()));
        config
    }

    /// Default model stored under the given path
    pub fn default_with_path<P: AsRef<Path>>(model_base_path: P) -> Self {
        Self::new(model_base_path, "all-minilm-l6-v2")
    }

    pub fn with_context_length(self, context_length: usize) -> Self {
        Self {
            context_length,
            ..self
        }
    }

    pub fn with_pooling(self, pooling: PoolingStrategy) -> Self {
        Self { pooling, ..self }
    }

    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    pub fn with_max_concurrent_tasks(self, tasks: usize) -> Self {
        Self {
            max_concurrent_tasks: Some(tasks),
            ..self
        }
    }

    /// Full path to the model directory
    pub fn model_path(&self) -> PathBuf {
        self.model_base_path.join(&self.model_name)
    }

    /// Path to the ONNX file of a local model
    pub fn onnx_model_path(&self) -> PathBuf {
        let model_dir = self.model_path();

        let quantized = model_dir.join("onnx").join("model_q4.onnx");
        if quantized.exists() {
            return quantized;
        }

        model_dir.join("onnx").join("model.onnx")
    }

    pub fn is_local_model(&self) -> bool {
        self.tokenizer_config.is_some()
    }

    /// Whether this model needs a reduced concurrency cap
    pub fn is_memory_heavy(&self) -> bool {
        let name = self.model_name.to_lowercase();
        MEMORY_HEAVY_MODELS.contains(&name.as_str()) || name.contains("large")
    }

    /// Number of embedding calls allowed in flight at once.
    ///
    /// An explicit `max_concurrent_tasks` wins. Otherwise half the detected
    /// cores are used, a quarter for memory-heavy models, never more than
    /// [`MAX_DEFAULT_CONCURRENCY`] and never less than one.
    pub fn effective_concurrency(&self) -> usize {
        if let Some(tasks) = self.max_concurrent_tasks {
            return tasks.max(1);
        }
        derive_concurrency(num_cpus::get(), self.is_memory_heavy())
    }

    /// Validate the configuration and, for local models, the files on disk
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(EmbedError::invalid_config("model name must not be empty"));
        }
        if self.context_length == 0 {
            return Err(EmbedError::invalid_config(
                "context length must be greater than zero",
            ));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config(
                "batch size must be greater than zero",
            ));
        }

        if let Some(tokenizer_config) = &self.tokenizer_config {
            let onnx_path = self.onnx_model_path();
            if !onnx_path.exists() {
                tracing::error!("Missing ONNX model: {}", onnx_path.display());
                return Err(EmbedError::ModelFileNotFound { path: onnx_path });
            }
            tokenizer_config.validate()?;
        }

        tracing::debug!("Model configuration valid for: {}", self.model_name);
        Ok(())
    }
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self::default_with_path(default_model_base_path())
    }
}

fn derive_concurrency(cpus: usize, memory_heavy: bool) -> usize {
    let divisor = if memory_heavy { 4 } else { 2 };
    (cpus / divisor).clamp(1, MAX_DEFAULT_CONCURRENCY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_creation() {
        let temp_dir = tempdir().unwrap();
        let config = EmbedConfig::new(temp_dir.path(), "bge-small-en-v1.5");

        assert_eq!(config.model_name, "bge-small-en-v1.5");
        assert_eq!(config.context_length, 512);
        assert_eq!(config.pooling, PoolingStrategy::Mean);
        assert!(config.normalize);
        assert!(!config.is_local_model());
        assert_eq!(config.model_path(), temp_dir.path().join("bge-small-en-v1.5"));
    }

    #[test]
    fn test_local_model_paths() {
        let temp_dir = tempdir().unwrap();
        let config = EmbedConfig::local(temp_dir.path(), "my-model");

        let expected_base = temp_dir.path().join("my-model");
        assert!(config.is_local_model());
        assert_eq!(
            config.onnx_model_path(),
            expected_base.join("onnx").join("model.onnx")
        );
        let tokenizer = config.tokenizer_config.as_ref().unwrap();
        assert_eq!(tokenizer.tokenizer_path, expected_base.join("tokenizer.json"));
        assert_eq!(
            tokenizer.special_tokens_map_path,
            expected_base.join("special_tokens_map.json")
        );
    }

    #[test]
    fn test_local_model_validation_reports_missing_onnx() {
        let temp_dir = tempdir().unwrap();
        let config = EmbedConfig::local(temp_dir.path(), "missing-model");

        match config.validate() {
            Err(EmbedError::ModelFileNotFound { path }) => {
                assert!(path.ends_with("model.onnx"));
            }
            other => panic!("expected missing model file, got {other:?}"),
        }
    }

    #[test]
    fn test_derive_builder_pattern() {
        let temp_dir = tempdir().unwrap();

        let config = EmbedConfig::builder()
            .model_base_path(temp_dir.path())
            .model_name("custom-model")
            .context_length(256usize)
            .pooling(PoolingStrategy::Cls)
            .normalize(false)
            .max_concurrent_tasks(3usize)
            .build()
            .unwrap();

        assert_eq!(config.model_name, "custom-model");
        assert_eq!(config.context_length, 256);
        assert_eq!(config.pooling, PoolingStrategy::Cls);
        assert!(!config.normalize);
        assert_eq!(config.effective_concurrency(), 3);
    }

    #[test]
    fn test_builder_defaults() {
        let config = EmbedConfig::builder()
            .model_name("test-model")
            .build()
            .unwrap();

        assert_eq!(config.model_base_path, PathBuf::from("models"));
        assert_eq!(config.batch_size, 16);
        assert!(config.normalize);
        assert!(config.max_concurrent_tasks.is_none());
        assert!(config.tokenizer_config.is_none());
    }

    #[test]
    fn test_concurrency_derivation() {
        assert_eq!(derive_concurrency(8, false), 4);
        assert_eq!(derive_concurrency(8, true), 2);
        assert_eq!(derive_concurrency(1, false), 1);
        assert_eq!(derive_concurrency(1, true), 1);
        assert_eq!(derive_concurrency(64, false), MAX_DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_explicit_concurrency_is_at_least_one() {
        let config = EmbedConfig::default().with_max_concurrent_tasks(0);
        assert_eq!(config.effective_concurrency(), 1);
    }

    #[test]
    fn test_memory_heavy_detection() {
        assert!(EmbedConfig::new("models", "nomic-embed-text-v1.5").is_memory_heavy());
        assert!(EmbedConfig::new("models", "ModernBERT-large").is_memory_heavy());
        assert!(!EmbedConfig::new("models", "all-minilm-l6-v2").is_memory_heavy());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: EmbedConfig =
            serde_json::from_str(r#"{"model_name": "bge-small-en-v1.5", "pooling": "cls"}"#)
                .unwrap();
        assert_eq!(config.model_base_path, PathBuf::from("models"));
        assert_eq!(config.pooling, PoolingStrategy::Cls);
        assert_eq!(config.context_length, 512);
    }
}
