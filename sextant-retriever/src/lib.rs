//! sextant-retriever: semantic code indexing and retrieval
//!
//! Source files are split into chunks, embedded, and stored in a local
//! SQLite database alongside a persistent HNSW index. Queries are embedded
//! the same way, matched against the index, and the hits are expanded back
//! into readable code context by merging structural siblings and neighbouring
//! chunks.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: chunking, the per-file pipeline, the indexing engine and reconstruction
//! - **[`storage`]**: relational file/chunk index, ANN index, and the vector store tying them together
//! - **[`config`]**: on-disk layout and `config.toml` settings
//! - **[`error`]**: pipeline and store error types
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sextant_retriever::retrieval::indexing_engine::{IndexingEngine, IndexingEngineConfig};
//! use sextant_retriever::storage::SearchOptions;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = IndexingEngineConfig::load(".".into())?;
//! let engine = IndexingEngine::open(config).await?;
//! engine.index_directory(&CancellationToken::new()).await?;
//!
//! for context in engine.search("parse the config file", &SearchOptions::default()).await? {
//!     println!("{} ({:.2})", context.file_path, context.score);
//! }
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Files → Chunker → EmbeddingRunner → VectorStore (SQLite + HNSW)
//!                                          ↓
//! Query → EmbeddingProvider → find_similar_code → Reconstructor → CodeContext
//! ```

pub mod config;
pub mod error;
pub mod retrieval;
pub mod storage;
