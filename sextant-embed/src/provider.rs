//! Embedding provider implementations

use crate::config::{EmbedConfig, PoolingStrategy};
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use fastembed::{
    EmbeddingModel, InitOptions, InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles,
    UserDefinedEmbeddingModel,
};
use std::sync::{Arc, Mutex};
use tokio::fs;

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f32>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Build a result, inferring the dimension from the first vector (0 when empty).
    pub fn new(embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Trait for embedding providers that can generate embeddings from text
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed_text(text).await?);
        }
        Ok(EmbeddingResult::new(embeddings))
    }

    /// Dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Name/identifier of this provider
    fn provider_name(&self) -> &str;
}

/// Map a configured model name onto one of fastembed's built-in models.
pub fn builtin_model(name: &str) -> Option<EmbeddingModel> {
    let model = match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
        "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        "nomic-embed-text-v1.5" => EmbeddingModel::NomicEmbedTextV15,
        "jina-embeddings-v2-base-code" => EmbeddingModel::JinaEmbeddingsV2BaseCode,
        "snowflake-arctic-embed-xs" => EmbeddingModel::SnowflakeArcticEmbedXS,
        "mxbai-embed-large-v1" => EmbeddingModel::MxbaiEmbedLargeV1,
        _ => return None,
    };
    Some(model)
}

/// FastEmbed-based embedding provider running ONNX models locally.
///
/// The loaded model is owned by the provider; clone the provider (or wrap it
/// in an `Arc`) to share one model between components.
#[derive(Clone)]
pub struct FastEmbedProvider {
    config: EmbedConfig,
    model: Arc<Mutex<TextEmbedding>>,
    dimension: usize,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("config", &self.config)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl FastEmbedProvider {
    /// Load the configured model and measure its output dimension.
    pub async fn create(config: EmbedConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            "Initializing FastEmbed provider for model: {}",
            config.model_name
        );

        let model = if config.is_local_model() {
            Self::load_local_model(&config).await?
        } else {
            Self::load_builtin_model(&config).await?
        };

        let model = Arc::new(Mutex::new(model));
        let model_ref = Arc::clone(&model);
        let dimension = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut guard = model_ref
                .lock()
                .map_err(|_| EmbedError::invalid_config("embedding model lock poisoned"))?;
            let embeddings = guard.embed(vec!["dimension check".to_string()], None)?;
            embeddings
                .first()
                .map(|e| e.len())
                .filter(|len| *len > 0)
                .ok_or_else(|| EmbedError::invalid_config("model produced an empty embedding"))
        })
        .await??;

        tracing::info!(
            "Model {} loaded successfully. Dimension: {}",
            config.model_name,
            dimension
        );

        Ok(Self {
            config,
            model,
            dimension,
        })
    }

    async fn load_builtin_model(config: &EmbedConfig) -> Result<TextEmbedding> {
        let builtin = builtin_model(&config.model_name).ok_or_else(|| {
            EmbedError::invalid_config(format!(
                "unknown built-in model '{}'; configure tokenizer files for a local ONNX model",
                config.model_name
            ))
        })?;

        fs::create_dir_all(&config.model_base_path).await?;

        let options = InitOptions::new(builtin)
            .with_cache_dir(config.model_base_path.clone())
            .with_max_length(config.context_length)
            .with_show_download_progress(false);

        tokio::task::spawn_blocking(move || TextEmbedding::try_new(options).map_err(EmbedError::from))
            .await?
    }

    async fn load_local_model(config: &EmbedConfig) -> Result<TextEmbedding> {
        let tokenizer_config = config
            .tokenizer_config
            .as_ref()
            .ok_or_else(|| EmbedError::invalid_config("local model without tokenizer files"))?;

        let onnx_file = fs::read(config.onnx_model_path()).await?;
        let tokenizer_file = fs::read(&tokenizer_config.tokenizer_path).await?;
        let config_file = fs::read(&tokenizer_config.config_path).await?;
        let special_tokens_map_file = fs::read(&tokenizer_config.special_tokens_map_path).await?;

        let tokenizer_config_file = match &tokenizer_config.tokenizer_config_path {
            Some(path) if path.exists() => fs::read(path).await?,
            _ => {
                let minimal_config = serde_json::json!({
                    "clean_up_tokenization_spaces": true,
                    "do_lower_case": false,
                    "model_max_length": config.context_length,
                    "tokenizer_class": "BertTokenizer"
                });
                serde_json::to_vec_pretty(&minimal_config)
                    .map_err(|e| EmbedError::External { source: e.into() })?
            }
        };

        let tokenizer_files = TokenizerFiles {
            tokenizer_file,
            config_file,
            special_tokens_map_file,
            tokenizer_config_file,
        };

        let pooling = match config.pooling {
            PoolingStrategy::Cls => Pooling::Cls,
            PoolingStrategy::Mean => Pooling::Mean,
        };
        let user_model =
            UserDefinedEmbeddingModel::new(onnx_file, tokenizer_files).with_pooling(pooling);
        let options = InitOptionsUserDefined::new().with_max_length(config.context_length);

        tokio::task::spawn_blocking(move || {
            TextEmbedding::try_new_from_user_defined(user_model, options).map_err(EmbedError::from)
        })
        .await?
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }
}

/// L2-normalize a vector in place; zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let texts = vec![text.to_string()];
        let result = self.embed_texts(&texts).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::invalid_config("No embedding generated for text"))
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        tracing::debug!("Generating embeddings for {} texts", texts.len());

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            let batch = batch.to_vec();
            let model = Arc::clone(&self.model);

            let batch_embeddings = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                let mut guard = model
                    .lock()
                    .map_err(|_| EmbedError::invalid_config("embedding model lock poisoned"))?;
                Ok(guard.embed(batch, None)?)
            })
            .await??;

            for mut embedding in batch_embeddings {
                if embedding.len() != self.dimension {
                    return Err(EmbedError::DimensionMismatch {
                        expected: self.dimension,
                        actual: embedding.len(),
                    });
                }
                if self.config.normalize {
                    normalize(&mut embedding);
                }
                all_embeddings.push(embedding);
            }
        }

        Ok(EmbeddingResult::new(all_embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_result() {
        let result = EmbeddingResult::new(vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]]);

        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 3);
        assert!(!result.is_empty());
        assert_eq!(EmbeddingResult::new(vec![]).dimension, 0);
    }

    #[test]
    fn test_builtin_model_lookup() {
        assert!(matches!(
            builtin_model("all-MiniLM-L6-v2"),
            Some(EmbeddingModel::AllMiniLML6V2)
        ));
        assert!(builtin_model("jina-embeddings-v2-base-code").is_some());
        assert!(builtin_model("not-a-model").is_none());
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_unknown_builtin_model_is_config_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = EmbedConfig::new(temp_dir.path(), "definitely-not-a-model");

        match FastEmbedProvider::create(config).await {
            Err(EmbedError::InvalidConfig { message }) => {
                assert!(message.contains("definitely-not-a-model"));
            }
            other => panic!("expected invalid config, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    #[ignore] // Downloads a real model - run with: cargo test test_builtin_model_embedding -- --ignored
    async fn test_builtin_model_embedding() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let provider =
            FastEmbedProvider::create(EmbedConfig::default_with_path(temp_dir.path())).await?;

        assert_eq!(provider.provider_name(), "fastembed");
        assert_eq!(provider.embedding_dimension(), 384);

        let texts = vec![
            "fn add(a: i32, b: i32) -> i32 { a + b }".to_string(),
            "def add(a, b): return a + b".to_string(),
        ];
        let result = provider.embed_texts(&texts).await?;
        assert_eq!(result.len(), 2);

        let similarity: f32 = result.embeddings[0]
            .iter()
            .zip(result.embeddings[1].iter())
            .map(|(a, b)| a * b)
            .sum();
        assert!(similarity > 0.3, "related code should be similar: {similarity}");
        Ok(())
    }
}
