//! High-level indexing engine that drives files through the pipeline into the store.
//!
//! ## Flow
//!
//! ```text
//! ContentProvider → hash check → IndexingPipeline (chunk → embed) → VectorStore
//!                                                                      ↓
//!             query → EmbeddingProvider → find_similar_code → Reconstructor
//! ```
//!
//! Up to `max_concurrent_files` files are read, chunked and embedded at once;
//! their results are written to the store one at a time. Files whose content
//! hash matches an already indexed row are skipped.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sextant_embed::{EmbeddingProvider, EmbeddingRunner, FastEmbedProvider};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::chunker::{
    Chunker, LineBlockChunker, estimate_tokens, language_for_path, should_index_file,
};
use super::content::{ContentProvider, FileContent, FsContentProvider};
use super::pipeline::{ChunkStatus, FileToProcess, IndexingPipeline, Priority, ProcessingResult};
use super::reconstruction::{CodeContext, Reconstructor};
use crate::config::RetrieverConfig;
use crate::storage::vector_store::VectorStore;
use crate::storage::{EmbeddingInput, FileId, FileRef, IndexStats, NewChunk, SearchOptions};

const META_EMBEDDING_MODEL: &str = "embedding.model";

/// Configuration for the indexing engine
#[derive(Debug, Clone)]
pub struct IndexingEngineConfig {
    /// Root directory whose files are indexed
    pub base_path: PathBuf,
    pub retriever: RetrieverConfig,
}

impl IndexingEngineConfig {
    /// Defaults for `base_path`, ignoring any config file.
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            retriever: RetrieverConfig::default(),
        }
    }

    /// Reads `<base_path>/.sextant/config.toml` when present.
    pub fn load(base_path: PathBuf) -> Result<Self> {
        let retriever = RetrieverConfig::load(&base_path)?;
        Ok(Self {
            base_path,
            retriever,
        })
    }

    pub fn with_retriever_config(mut self, retriever: RetrieverConfig) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_max_concurrent_files(mut self, files: usize) -> Self {
        self.retriever.max_concurrent_files = files.max(1);
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.retriever.chunking.max_chunk_size = size;
        self
    }
}

/// What happened to one file in an indexing pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Indexed {
        chunks: usize,
        embeddings: usize,
        failed_chunks: usize,
    },
    /// Content hash unchanged since the last successful pass
    Unchanged,
    Failed {
        error: String,
    },
    Cancelled,
}

/// Result of processing a single file
#[derive(Debug, Clone, Serialize)]
pub struct FileProcessingResult {
    pub file_path: String,
    pub outcome: FileOutcome,
    pub processing_time: Duration,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ProcessingStats {
    pub files_processed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    pub chunk_failures: usize,
    pub errors: usize,
}

/// A file that went through the pipeline and awaits writing.
enum Prepared {
    Finished(FileProcessingResult),
    Processed {
        file: FileToProcess,
        result: ProcessingResult,
        started: Instant,
    },
}

/// Indexes files into a [`VectorStore`] and answers searches over it.
pub struct IndexingEngine {
    config: IndexingEngineConfig,
    store: Arc<VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    content: Arc<dyn ContentProvider>,
    pipeline: IndexingPipeline,
    reconstructor: Reconstructor,
    stats: RwLock<ProcessingStats>,
}

impl std::fmt::Debug for IndexingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingEngine")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("provider", &self.provider.provider_name())
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl IndexingEngine {
    /// Opens the store under `base_path` and loads the configured embedding model.
    pub async fn open(config: IndexingEngineConfig) -> Result<Self> {
        info!(
            "Opening index for {} with model {}",
            config.base_path.display(),
            config.retriever.embedding.model_name
        );

        let provider: Arc<dyn EmbeddingProvider> =
            Arc::new(FastEmbedProvider::create(config.retriever.embedding.clone()).await?);
        let store = Arc::new(
            VectorStore::open(&config.base_path, config.retriever.index.clone()).await?,
        );
        let content = Arc::new(FsContentProvider::new(&config.base_path));

        Self::new(config, store, provider, Arc::new(LineBlockChunker), content).await
    }

    /// Wires the engine from its parts, initializing the pipeline and the ANN index.
    pub async fn new(
        config: IndexingEngineConfig,
        store: Arc<VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        chunker: Arc<dyn Chunker>,
        content: Arc<dyn ContentProvider>,
    ) -> Result<Self> {
        let runner = EmbeddingRunner::from_config(provider.clone(), &config.retriever.embedding);
        let mut pipeline =
            IndexingPipeline::new(chunker, runner, config.retriever.chunking.clone());
        pipeline.initialize().await?;

        store.set_dimension(provider.embedding_dimension()).await?;

        let model_id = format!(
            "{}:{}",
            provider.provider_name(),
            config.retriever.embedding.model_name
        );
        match store.files().get_metadata(META_EMBEDDING_MODEL).await? {
            Some(previous) if previous != model_id => {
                warn!(
                    "Embedding model changed from {} to {}; existing embeddings dropped and files will be re-indexed",
                    previous, model_id
                );
                store.delete_all_embeddings_and_chunks().await?;
            }
            _ => {}
        }
        store
            .files()
            .set_metadata(META_EMBEDDING_MODEL, &model_id)
            .await?;

        Ok(Self {
            reconstructor: Reconstructor::new(config.retriever.reconstruction.clone()),
            config,
            store,
            provider,
            content,
            pipeline,
            stats: RwLock::new(ProcessingStats::default()),
        })
    }

    /// Indexes one file given relative to the base path.
    pub async fn index_file(
        &self,
        relative_path: &str,
        cancel: &CancellationToken,
    ) -> Result<FileProcessingResult> {
        let prepared = self.prepare(relative_path.to_string(), Priority::High, cancel).await;
        self.write(prepared).await
    }

    /// Indexes the given files, highest priority first.
    ///
    /// Per-file problems are reported in the results. Store failures such as an
    /// exhausted index abort the pass.
    pub async fn index_paths(
        &self,
        paths: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileProcessingResult>> {
        let mut queue: Vec<(String, Priority)> = paths
            .into_iter()
            .map(|path| {
                let priority = priority_for_path(Path::new(&path));
                (path, priority)
            })
            .collect();
        queue.sort_by(|a, b| b.1.cmp(&a.1));

        info!(
            "Indexing {} files, {} at a time",
            queue.len(),
            self.config.retriever.max_concurrent_files
        );

        let mut prepared = stream::iter(queue)
            .map(|(path, priority)| self.prepare(path, priority, cancel))
            .buffer_unordered(self.config.retriever.max_concurrent_files.max(1));

        let mut results = Vec::new();
        while let Some(item) = prepared.next().await {
            results.push(self.write(item).await?);
        }

        if cancel.is_cancelled() {
            info!("Indexing pass cancelled");
        }
        self.store.compact_if_needed().await?;
        Ok(results)
    }

    /// Walks the base path (respecting ignore files), indexes every eligible file and
    /// forgets files that no longer exist.
    pub async fn index_directory(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileProcessingResult>> {
        let base = self.config.base_path.clone();
        let paths = tokio::task::spawn_blocking(move || discover_files(&base)).await??;
        debug!("Discovered {} indexable files", paths.len());

        let present: HashSet<&str> = paths.iter().map(String::as_str).collect();
        let known = self.store.files().list_files().await?;
        for record in known {
            if !present.contains(record.path.as_str()) {
                self.remove_file(&record.path).await?;
            }
        }

        self.index_paths(paths, cancel).await
    }

    /// Forgets a file and its chunks.
    pub async fn remove_file(&self, relative_path: &str) -> Result<bool> {
        let removed = self.store.remove_file(relative_path).await?;
        if removed {
            info!("Removed {} from the index", relative_path);
            self.stats.write().await.files_removed += 1;
        }
        Ok(removed)
    }

    /// Embeds `query` and returns reconstructed code context, best first.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<CodeContext>> {
        let query_vector = self.provider.embed_text(query).await?;
        let hits = self.store.find_similar_code(&query_vector, options).await?;
        debug!("{} raw hits for query", hits.len());
        Ok(self
            .reconstructor
            .reconstruct(&hits, self.store.as_ref())
            .await)
    }

    async fn prepare(&self, path: String, priority: Priority, cancel: &CancellationToken) -> Prepared {
        let started = Instant::now();
        let finished = |outcome| {
            Prepared::Finished(FileProcessingResult {
                file_path: path.clone(),
                outcome,
                processing_time: started.elapsed(),
            })
        };

        if cancel.is_cancelled() {
            return finished(FileOutcome::Cancelled);
        }

        let content = match self.content.read(&path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Skipping {}: {:#}", path, e);
                return finished(FileOutcome::Failed {
                    error: format!("{e:#}"),
                });
            }
        };

        let content_hash = blake3::hash(content.text.as_bytes()).to_hex().to_string();
        let file_id = match self.register_file(&path, &content_hash, &content).await {
            Ok(Some(id)) => id,
            Ok(None) => return finished(FileOutcome::Unchanged),
            Err(e) => {
                error!("Failed to record {}: {:#}", path, e);
                return finished(FileOutcome::Failed {
                    error: format!("{e:#}"),
                });
            }
        };

        let file = FileToProcess::new(file_id, path.clone(), content.text).with_priority(priority);
        match self.pipeline.process_file(&file, cancel).await {
            Ok(result) => Prepared::Processed {
                file,
                result,
                started,
            },
            Err(e) => finished(FileOutcome::Failed {
                error: e.to_string(),
            }),
        }
    }

    /// Upserts the file row, returning `None` when the file is already indexed
    /// with this content.
    async fn register_file(
        &self,
        path: &str,
        content_hash: &str,
        content: &FileContent,
    ) -> Result<Option<FileId>> {
        let files = self.store.files();
        if !files.file_needs_reindex(path, content_hash).await? {
            debug!("{} unchanged", path);
            return Ok(None);
        }

        let id = files
            .upsert_file(&FileRef {
                path: path.to_string(),
                content_hash: content_hash.to_string(),
                modified_at: content.modified_at,
                language: language_for_path(Path::new(path)).map(str::to_string),
                size: content.text.len() as i64,
            })
            .await?;
        Ok(Some(id))
    }

    async fn write(&self, prepared: Prepared) -> Result<FileProcessingResult> {
        let (file, result, started) = match prepared {
            Prepared::Finished(done) => {
                let mut stats = self.stats.write().await;
                match &done.outcome {
                    FileOutcome::Unchanged => stats.files_unchanged += 1,
                    FileOutcome::Failed { .. } => stats.errors += 1,
                    _ => {}
                }
                return Ok(done);
            }
            Prepared::Processed {
                file,
                result,
                started,
            } => (file, result, started),
        };

        let files = self.store.files();

        if !result.success {
            let outcome = match &result.error {
                Some(e) if e.is_cancelled() => FileOutcome::Cancelled,
                Some(e) => {
                    warn!("Indexing {} failed: {}", file.path, e);
                    files.mark_file_indexed(file.id, false).await?;
                    self.stats.write().await.errors += 1;
                    FileOutcome::Failed {
                        error: e.to_string(),
                    }
                }
                None => FileOutcome::Failed {
                    error: "pipeline reported failure without an error".to_string(),
                },
            };
            return Ok(FileProcessingResult {
                file_path: file.path,
                outcome,
                processing_time: started.elapsed(),
            });
        }

        let chunks: Vec<NewChunk> = result
            .chunks
            .iter()
            .zip(&result.chunk_offsets)
            .enumerate()
            .map(|(index, (text, offset))| {
                let structure = result.structure(index);
                NewChunk {
                    content: text.clone(),
                    start_offset: *offset,
                    end_offset: structure
                        .map(|s| s.end_offset)
                        .unwrap_or(offset + text.len()),
                    token_count: structure
                        .map(|s| s.token_count)
                        .unwrap_or_else(|| estimate_tokens(text)),
                    parent_structure_id: structure.and_then(|s| s.parent_structure_id.clone()),
                    structure_order: structure.and_then(|s| s.structure_order),
                    structure_type: structure.and_then(|s| s.structure_type.clone()),
                }
            })
            .collect();

        let chunk_ids = files.replace_chunks(file.id, &chunks).await?;

        let embeddings: Vec<EmbeddingInput> = result
            .chunk_status
            .iter()
            .zip(&chunk_ids)
            .filter_map(|(status, chunk_id)| match status {
                ChunkStatus::Embedded { embedding_index } => Some(EmbeddingInput {
                    chunk_id: *chunk_id,
                    vector: result.embeddings[*embedding_index].clone(),
                }),
                ChunkStatus::Failed { .. } => None,
            })
            .collect();

        self.store.store_embeddings(&embeddings).await?;
        files.mark_file_indexed(file.id, true).await?;

        let failed_chunks = result.metadata.failed_count;
        if failed_chunks > 0 {
            warn!(
                "{}: {} of {} chunks have no embedding",
                file.path,
                failed_chunks,
                chunks.len()
            );
        }

        {
            let mut stats = self.stats.write().await;
            stats.files_processed += 1;
            stats.chunks_created += chunks.len();
            stats.embeddings_generated += embeddings.len();
            stats.chunk_failures += failed_chunks;
        }

        Ok(FileProcessingResult {
            file_path: file.path,
            outcome: FileOutcome::Indexed {
                chunks: chunks.len(),
                embeddings: embeddings.len(),
                failed_chunks,
            },
            processing_time: started.elapsed(),
        })
    }

    /// Statistics for this engine's lifetime.
    pub async fn get_stats(&self) -> ProcessingStats {
        self.stats.read().await.clone()
    }

    /// Row counts and ANN state of the underlying store.
    pub async fn get_index_stats(&self) -> Result<IndexStats> {
        Ok(self.store.stats().await?)
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn config(&self) -> &IndexingEngineConfig {
        &self.config
    }

    /// Persists the ANN index and closes the database.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down indexing engine");
        self.store.dispose().await?;
        Ok(())
    }
}

/// Source files first, then documentation and configuration.
fn priority_for_path(path: &Path) -> Priority {
    if language_for_path(path).is_some() {
        Priority::Normal
    } else {
        Priority::Low
    }
}

/// Indexable files under `base`, as `/`-separated paths relative to it.
fn discover_files(base: &Path) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for entry in ignore::WalkBuilder::new(base).hidden(true).build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to walk {}: {}", base.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) || !should_index_file(entry.path()) {
            continue;
        }
        let relative = entry.path().strip_prefix(base)?;
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        paths.push(relative);
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_priority_for_path() {
        assert_eq!(priority_for_path(Path::new("src/lib.rs")), Priority::Normal);
        assert_eq!(priority_for_path(Path::new("README.md")), Priority::Low);
        assert!(Priority::High > Priority::Normal);
    }

    #[test]
    fn test_discover_files_respects_ignores() -> Result<()> {
        let temp_dir = tempdir()?;
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("src/nested"))?;
        std::fs::create_dir_all(root.join("target"))?;
        std::fs::create_dir_all(root.join(".sextant"))?;
        std::fs::write(root.join("src/lib.rs"), "pub fn a() {}")?;
        std::fs::write(root.join("src/nested/mod.py"), "def a(): pass")?;
        std::fs::write(root.join("target/out.rs"), "fn gen() {}")?;
        std::fs::write(root.join(".sextant/index.db"), "")?;
        std::fs::write(root.join("logo.png"), [0u8; 4])?;
        std::fs::write(root.join(".ignore"), "target/\n")?;

        let files = discover_files(root)?;

        assert_eq!(files, vec!["src/lib.rs", "src/nested/mod.py"]);
        Ok(())
    }

    #[test]
    fn test_config_builders() {
        let config = IndexingEngineConfig::new(PathBuf::from("/repo"))
            .with_max_concurrent_files(0)
            .with_chunk_size(256);
        assert_eq!(config.retriever.max_concurrent_files, 1);
        assert_eq!(config.retriever.chunking.max_chunk_size, 256);
    }
}
