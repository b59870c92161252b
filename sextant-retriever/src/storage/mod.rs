//! Storage layer for sextant-retriever
//!
//! Two stores back the index and must be kept consistent with each other:
//!
//! - **[`file_index::FileIndex`]**: SQLite tables for files, chunks, the
//!   chunk→label mapping of embeddings, and a small key/value metadata table.
//! - **[`ann_index::AnnIndex`]**: a usearch HNSW graph holding the vectors
//!   themselves, addressed by integer label.
//!
//! [`vector_store::VectorStore`] owns both and is the only place that writes
//! embeddings, so the label invariants hold:
//!
//! ```text
//!   embeddings.label  ──resolves to──▶  AnnIndex point
//!   label == AnnIndex::len() at insertion time, dense in [0, len)
//! ```
//!
//! Whenever the ANN index is discarded the embedding rows are purged with it.

use async_trait::async_trait;
use serde::Serialize;

pub mod ann_index;
pub mod file_index;
pub mod vector_store;

/// Database ID of a file.
pub type FileId = i64;

/// Database ID of a chunk.
pub type ChunkId = i64;

/// Integer handle of one vector inside the ANN index.
pub type Label = u64;

/// A file row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: FileId,
    pub path: String,
    /// blake3 of the file content, hex encoded
    pub content_hash: String,
    /// Unix timestamp (seconds)
    pub modified_at: i64,
    pub language: Option<String>,
    pub is_indexed: bool,
    pub size: i64,
}

/// Data needed to create or update a file row.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub path: String,
    pub content_hash: String,
    pub modified_at: i64,
    pub language: Option<String>,
    pub size: i64,
}

/// A chunk row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub file_id: FileId,
    pub content: String,
    /// Byte offset of the first byte of this chunk in the file
    pub start_offset: usize,
    /// Byte offset one past the last byte of this chunk
    pub end_offset: usize,
    pub token_count: usize,
    /// Shared by all fragments of one oversized structure
    pub parent_structure_id: Option<String>,
    /// Position of this fragment within its structure
    pub structure_order: Option<u32>,
    pub structure_type: Option<String>,
}

/// A chunk to be inserted for a file.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub content: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub token_count: usize,
    pub parent_structure_id: Option<String>,
    pub structure_order: Option<u32>,
    pub structure_type: Option<String>,
}

/// An embeddings row. The vector itself lives in the ANN index under `label`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub chunk_id: ChunkId,
    pub label: Label,
    pub created_at: i64,
}

/// A vector to store for a chunk.
#[derive(Debug, Clone)]
pub struct EmbeddingInput {
    pub chunk_id: ChunkId,
    pub vector: Vec<f32>,
}

/// An embedding row together with its vector.
///
/// `vector` is empty when the ANN index is unavailable or no longer holds the
/// point.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEmbedding {
    pub record: EmbeddingRecord,
    pub vector: Vec<f32>,
}

/// Chunk and file metadata resolved from an ANN label.
#[derive(Debug, Clone)]
pub struct LabelHit {
    pub label: Label,
    pub chunk: ChunkRecord,
    pub file_path: String,
}

/// Options for [`vector_store::VectorStore::find_similar_code`].
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    /// Results scoring below this are dropped
    pub min_score: f32,
    /// Only return chunks from these file paths
    pub file_filter: Option<Vec<String>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0.0,
            file_filter: None,
        }
    }
}

/// One raw similarity hit.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarChunk {
    pub chunk: ChunkRecord,
    pub file_path: String,
    /// Similarity in `[0, 1]`, higher is closer
    pub score: f32,
}

/// Row counts and ANN state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub files_count: usize,
    pub indexed_files_count: usize,
    pub chunks_count: usize,
    pub embeddings_count: usize,
    pub ann_dimension: Option<usize>,
    pub ann_len: usize,
    pub ann_capacity: usize,
    /// ANN points whose chunk has been deleted or re-chunked
    pub ann_stale_points: usize,
}

/// Read access to stored chunks, used to rebuild context around a hit.
#[async_trait]
pub trait ChunkContext: Send + Sync {
    /// All fragments of a split structure within one file, in structure order
    async fn structure_siblings(
        &self,
        file_id: FileId,
        structure_id: &str,
    ) -> anyhow::Result<Vec<ChunkRecord>>;

    /// Up to `window` chunks on each side of `chunk_id` in the same file, by offset
    async fn adjacent_chunks(
        &self,
        file_id: FileId,
        chunk_id: ChunkId,
        window: usize,
    ) -> anyhow::Result<Vec<ChunkRecord>>;
}
