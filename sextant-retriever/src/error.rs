//! Error types for indexing and the vector store

use crate::storage::ChunkId;
use crate::storage::ann_index::AnnError;
use std::fmt;

/// Phase of the per-file pipeline an error or cancellation happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Chunking,
    Embedding,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Chunking => write!(f, "chunking"),
            Stage::Embedding => write!(f, "embedding"),
        }
    }
}

/// Outcome of a pipeline run that did not produce any usable embeddings.
///
/// `Configuration` is returned as an `Err` from
/// [`IndexingPipeline::process_file`](crate::retrieval::pipeline::IndexingPipeline::process_file);
/// the others are recorded in the per-file
/// [`ProcessingResult`](crate::retrieval::pipeline::ProcessingResult).
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// The pipeline was used before it was initialized, or is misconfigured
    #[error("Indexing pipeline misconfigured: {message}")]
    Configuration { message: String },

    /// The cancellation signal fired
    #[error("{stage} cancelled for {path}")]
    Cancelled { path: String, stage: Stage },

    /// The chunker failed
    #[error("Failed to chunk {path}: {source}")]
    ChunkingFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Every chunk of the file failed to embed
    #[error("Failed to embed {path}: {message}")]
    EmbeddingFailed { path: String, message: String },
}

impl ProcessingError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The pipeline stage this error belongs to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Configuration { .. } => None,
            Self::Cancelled { stage, .. } => Some(*stage),
            Self::ChunkingFailed { .. } => Some(Stage::Chunking),
            Self::EmbeddingFailed { .. } => Some(Stage::Embedding),
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Configuration { .. } => None,
            Self::Cancelled { path, .. }
            | Self::ChunkingFailed { path, .. }
            | Self::EmbeddingFailed { path, .. } => Some(path),
        }
    }
}

/// Errors from [`VectorStore`](crate::storage::vector_store::VectorStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Embeddings were written before `set_dimension`
    #[error("Vector store has no embedding dimension configured")]
    NoDimension,

    #[error("Embedding for chunk {chunk_id:?} has dimension {actual}, index expects {expected}")]
    DimensionMismatch {
        chunk_id: Option<ChunkId>,
        expected: usize,
        actual: usize,
    },

    /// The index is full and could not be grown. Retrying will not help.
    #[error(
        "ANN index is full at {capacity} elements and could not be resized ({message}); \
         raise `index.max_capacity` or `index.max_elements` in .sextant/config.toml and re-index"
    )]
    CapacityExhausted { capacity: usize, message: String },

    #[error(transparent)]
    Ann(#[from] AnnError),

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Relational store failures
    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::CapacityExhausted { .. } | Self::DimensionMismatch { .. } | Self::NoDimension
        )
    }
}
