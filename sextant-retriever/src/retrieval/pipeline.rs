//! Per-file chunk → embed pipeline.
//!
//! [`IndexingPipeline::process_file`] turns one file into chunk vectors and
//! reports what happened in a [`ProcessingResult`]. It never touches storage;
//! writing results is the caller's job.
//!
//! Failure classes:
//!
//! - **Configuration**: the pipeline was not initialized. Returned as `Err`.
//! - **Cancelled**: the signal fired during chunking or embedding.
//! - **ChunkingFailed**: the chunker returned an error or inconsistent output.
//! - **EmbeddingFailed**: every chunk failed to embed.
//!
//! If at least one chunk embeds, the file succeeds and the failed chunks are
//! listed in [`ProcessingResult::chunk_status`].

use super::chunker::{ChunkError, ChunkOptions, ChunkStructure, Chunker, StructureMetadata};
use crate::error::{ProcessingError, Stage};
use crate::storage::FileId;
use serde::Serialize;
use sextant_embed::EmbeddingRunner;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Relative importance of a file in an indexing pass; higher runs first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A file handed to the pipeline.
#[derive(Debug, Clone)]
pub struct FileToProcess {
    pub id: FileId,
    pub path: String,
    pub content: String,
    pub priority: Option<Priority>,
}

impl FileToProcess {
    pub fn new(id: FileId, path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            content: content.into(),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// What happened to one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ChunkStatus {
    /// The chunk's vector is `embeddings[embedding_index]`
    Embedded { embedding_index: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingMetadata {
    pub chunk_count: usize,
    pub embedded_count: usize,
    pub failed_count: usize,
    pub elapsed: Duration,
    pub structure: StructureMetadata,
}

/// Outcome of [`IndexingPipeline::process_file`].
///
/// `chunks`, `chunk_offsets` and `chunk_status` are parallel, one entry per
/// chunk. `embeddings` holds only the successful vectors, in chunk order.
#[derive(Debug)]
pub struct ProcessingResult {
    pub file_id: FileId,
    pub file_path: String,
    pub success: bool,
    pub embeddings: Vec<Vec<f32>>,
    pub chunk_offsets: Vec<usize>,
    pub chunks: Vec<String>,
    pub chunk_status: Vec<ChunkStatus>,
    pub metadata: ProcessingMetadata,
    pub error: Option<ProcessingError>,
}

impl ProcessingResult {
    fn empty(file: &FileToProcess) -> Self {
        Self {
            file_id: file.id,
            file_path: file.path.clone(),
            success: true,
            embeddings: Vec::new(),
            chunk_offsets: Vec::new(),
            chunks: Vec::new(),
            chunk_status: Vec::new(),
            metadata: ProcessingMetadata::default(),
            error: None,
        }
    }

    fn failed(file: &FileToProcess, error: ProcessingError, started: Instant) -> Self {
        let mut result = Self::empty(file);
        result.success = false;
        result.error = Some(error);
        result.metadata.elapsed = started.elapsed();
        result
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(ProcessingError::is_cancelled)
    }

    /// Structure metadata for chunk `index`, when the chunker provided it.
    pub fn structure(&self, index: usize) -> Option<&ChunkStructure> {
        self.metadata.structure.chunks.get(index)
    }
}

/// Chunks and embeds single files.
pub struct IndexingPipeline {
    chunker: Arc<dyn Chunker>,
    runner: EmbeddingRunner,
    options: ChunkOptions,
    initialized: bool,
}

impl std::fmt::Debug for IndexingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingPipeline")
            .field("runner", &self.runner)
            .field("options", &self.options)
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl IndexingPipeline {
    pub fn new(chunker: Arc<dyn Chunker>, runner: EmbeddingRunner, options: ChunkOptions) -> Self {
        Self {
            chunker,
            runner,
            options,
            initialized: false,
        }
    }

    /// Starts the chunker and checks the embedding provider. Must succeed before
    /// [`process_file`](Self::process_file).
    pub async fn initialize(&mut self) -> Result<(), ProcessingError> {
        if self.initialized {
            return Ok(());
        }
        if self.runner.provider().embedding_dimension() == 0 {
            return Err(ProcessingError::configuration(format!(
                "embedding provider {} reports no dimension",
                self.runner.provider().provider_name()
            )));
        }
        self.chunker.initialize().await.map_err(|e| {
            ProcessingError::configuration(format!("chunker failed to start: {e}"))
        })?;

        self.initialized = true;
        debug!(
            "Indexing pipeline initialized with {} embedding tasks",
            self.runner.max_concurrency()
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn runner(&self) -> &EmbeddingRunner {
        &self.runner
    }

    /// Chunks and embeds one file.
    ///
    /// Only a missing initialization is returned as `Err`; everything else,
    /// including cancellation, is reported in the result.
    pub async fn process_file(
        &self,
        file: &FileToProcess,
        cancel: &CancellationToken,
    ) -> Result<ProcessingResult, ProcessingError> {
        if !self.initialized {
            return Err(ProcessingError::configuration(
                "process_file called before initialize",
            ));
        }

        let started = Instant::now();
        let signal = cancel.child_token();

        let chunked = tokio::select! {
            biased;
            _ = signal.cancelled() => Err(ChunkError::Cancelled),
            output = self.chunker.chunk(file, &self.options, &signal) => output,
        };

        let output = match chunked {
            Ok(output) => output,
            Err(ChunkError::Cancelled) => {
                debug!("Chunking cancelled for {}", file.path);
                return Ok(ProcessingResult::failed(
                    file,
                    ProcessingError::Cancelled {
                        path: file.path.clone(),
                        stage: Stage::Chunking,
                    },
                    started,
                ));
            }
            Err(ChunkError::Failed(e)) => {
                warn!("Chunking failed for {}: {}", file.path, e);
                return Ok(ProcessingResult::failed(
                    file,
                    ProcessingError::ChunkingFailed {
                        path: file.path.clone(),
                        source: e.into(),
                    },
                    started,
                ));
            }
        };

        if output.chunks.len() != output.offsets.len() {
            let message = format!(
                "chunker returned {} chunks but {} offsets",
                output.chunks.len(),
                output.offsets.len()
            );
            return Ok(ProcessingResult::failed(
                file,
                ProcessingError::ChunkingFailed {
                    path: file.path.clone(),
                    source: message.into(),
                },
                started,
            ));
        }

        let mut structure = output.metadata;
        if structure.chunks.len() != output.chunks.len() {
            structure.chunks = output
                .chunks
                .iter()
                .zip(&output.offsets)
                .map(|(text, offset)| ChunkStructure {
                    end_offset: offset + text.len(),
                    token_count: super::chunker::estimate_tokens(text),
                    ..ChunkStructure::default()
                })
                .collect();
        }

        let mut result = ProcessingResult::empty(file);
        result.metadata.chunk_count = output.chunks.len();
        result.metadata.structure = structure;

        if output.chunks.is_empty() {
            debug!("No chunks for {}", file.path);
            result.metadata.elapsed = started.elapsed();
            return Ok(result);
        }

        let outcomes = match self.runner.run(&output.chunks, &signal).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                debug!("Embedding cancelled for {}", file.path);
                return Ok(ProcessingResult::failed(
                    file,
                    ProcessingError::Cancelled {
                        path: file.path.clone(),
                        stage: Stage::Embedding,
                    },
                    started,
                ));
            }
        };

        let mut failures = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(vector) => {
                    result.chunk_status.push(ChunkStatus::Embedded {
                        embedding_index: result.embeddings.len(),
                    });
                    result.embeddings.push(vector);
                }
                Err(error) => {
                    failures.push(format!("chunk {index}: {error}"));
                    result.chunk_status.push(ChunkStatus::Failed { error });
                }
            }
        }

        result.chunk_offsets = output.offsets;
        result.chunks = output.chunks;
        result.metadata.embedded_count = result.embeddings.len();
        result.metadata.failed_count = failures.len();
        result.metadata.elapsed = started.elapsed();

        if result.embeddings.is_empty() {
            warn!(
                "All {} chunks of {} failed to embed",
                failures.len(),
                file.path
            );
            result.success = false;
            result.error = Some(ProcessingError::EmbeddingFailed {
                path: file.path.clone(),
                message: failures.join("; "),
            });
        } else if !failures.is_empty() {
            warn!(
                "{} of {} chunks of {} failed to embed",
                failures.len(),
                result.chunks.len(),
                file.path
            );
        } else {
            info!(
                "Processed {}: {} chunks in {:?}",
                file.path, result.metadata.chunk_count, result.metadata.elapsed
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::chunker::ChunkerOutput;
    use async_trait::async_trait;
    use sextant_embed::{EmbedError, EmbeddingProvider};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns fixed chunks, optionally after a delay.
    struct FixedChunker {
        chunks: Vec<(&'static str, usize)>,
        delay: Option<Duration>,
    }

    impl FixedChunker {
        fn new(chunks: Vec<(&'static str, usize)>) -> Self {
            Self {
                chunks,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl Chunker for FixedChunker {
        async fn chunk(
            &self,
            _file: &FileToProcess,
            _options: &ChunkOptions,
            _cancel: &CancellationToken,
        ) -> Result<ChunkerOutput, ChunkError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(ChunkerOutput {
                chunks: self.chunks.iter().map(|(t, _)| t.to_string()).collect(),
                offsets: self.chunks.iter().map(|(_, o)| *o).collect(),
                metadata: StructureMetadata::default(),
            })
        }
    }

    struct FailingChunker;

    #[async_trait]
    impl Chunker for FailingChunker {
        async fn chunk(
            &self,
            _file: &FileToProcess,
            _options: &ChunkOptions,
            _cancel: &CancellationToken,
        ) -> Result<ChunkerOutput, ChunkError> {
            Err(anyhow::anyhow!("parser exploded").into())
        }
    }

    /// Maps known texts to vectors; anything else fails with the text as message.
    struct TableProvider {
        table: HashMap<&'static str, Vec<f32>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl TableProvider {
        fn new(entries: &[(&'static str, Vec<f32>)]) -> Self {
            Self {
                table: entries.iter().cloned().collect(),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for TableProvider {
        async fn embed_text(&self, text: &str) -> sextant_embed::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.table
                .get(text)
                .cloned()
                .ok_or_else(|| EmbedError::invalid_config(text))
        }

        fn embedding_dimension(&self) -> usize {
            3
        }

        fn provider_name(&self) -> &str {
            "table"
        }
    }

    async fn pipeline(
        chunker: impl Chunker + 'static,
        provider: Arc<TableProvider>,
    ) -> IndexingPipeline {
        let mut pipeline = IndexingPipeline::new(
            Arc::new(chunker),
            EmbeddingRunner::new(provider, 2),
            ChunkOptions::default(),
        );
        pipeline.initialize().await.unwrap();
        pipeline
    }

    #[tokio::test]
    async fn test_single_chunk_file() {
        let provider = Arc::new(TableProvider::new(&[("console.log(1)", vec![0.1, 0.2, 0.3])]));
        let pipeline = pipeline(FixedChunker::new(vec![("console.log(1)", 0)]), provider).await;

        let file = FileToProcess::new(7, "a.js", "console.log(1)");
        let result = pipeline
            .process_file(&file, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.file_id, 7);
        assert_eq!(result.embeddings, vec![vec![0.1, 0.2, 0.3]]);
        assert_eq!(result.chunk_offsets, vec![0]);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_all_chunks_embedded() {
        let provider = Arc::new(TableProvider::new(&[
            ("a", vec![1.0, 0.0, 0.0]),
            ("b", vec![0.0, 1.0, 0.0]),
            ("c", vec![0.0, 0.0, 1.0]),
        ]));
        let pipeline =
            pipeline(FixedChunker::new(vec![("a", 0), ("b", 2), ("c", 4)]), provider).await;

        let result = pipeline
            .process_file(&FileToProcess::new(1, "x.rs", "a\nb\nc"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.embeddings.len(), 3);
        assert_eq!(result.chunk_offsets.len(), 3);
        assert_eq!(result.embeddings[1], vec![0.0, 1.0, 0.0]);
        assert_eq!(result.metadata.embedded_count, 3);
        assert_eq!(result.metadata.structure.chunks.len(), 3);
    }

    #[tokio::test]
    async fn test_zero_chunks_never_embeds() {
        let provider = Arc::new(TableProvider::new(&[]));
        let pipeline = pipeline(FixedChunker::new(vec![]), provider.clone()).await;

        let result = pipeline
            .process_file(&FileToProcess::new(1, "empty.rs", ""), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.embeddings.is_empty());
        assert!(result.chunk_offsets.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successes() {
        let provider = Arc::new(TableProvider::new(&[("ok", vec![1.0, 2.0, 3.0])]));
        let pipeline = pipeline(FixedChunker::new(vec![("ok", 0), ("boom", 3)]), provider).await;

        let result = pipeline
            .process_file(&FileToProcess::new(1, "p.rs", "ok\nboom"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.error.is_none());
        assert_eq!(result.embeddings, vec![vec![1.0, 2.0, 3.0]]);
        assert_eq!(result.chunk_offsets, vec![0, 3]);
        assert_eq!(
            result.chunk_status[0],
            ChunkStatus::Embedded { embedding_index: 0 }
        );
        match &result.chunk_status[1] {
            ChunkStatus::Failed { error } => assert!(error.contains("boom")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_failures_are_aggregated() {
        let provider = Arc::new(TableProvider::new(&[]));
        let pipeline = pipeline(FixedChunker::new(vec![("x1", 0), ("x2", 3)]), provider).await;

        let result = pipeline
            .process_file(&FileToProcess::new(1, "f.rs", "x1\nx2"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.success);
        match result.error {
            Some(ProcessingError::EmbeddingFailed { path, message }) => {
                assert_eq!(path, "f.rs");
                assert!(message.contains("chunk 0: "));
                assert!(message.contains("x1"));
                assert!(message.contains("chunk 1: "));
                assert!(message.contains("x2"));
            }
            other => panic!("expected embedding failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_during_chunking() {
        let provider = Arc::new(TableProvider::new(&[("a", vec![1.0, 0.0, 0.0])]));
        let chunker = FixedChunker {
            chunks: vec![("a", 0)],
            delay: Some(Duration::from_secs(5)),
        };
        let pipeline = pipeline(chunker, provider.clone()).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = pipeline
            .process_file(&FileToProcess::new(1, "slow.rs", "a"), &cancel)
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.is_cancelled());
        assert_eq!(result.error.unwrap().stage(), Some(Stage::Chunking));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_embedding() {
        let mut provider = TableProvider::new(&[("a", vec![1.0, 0.0, 0.0])]);
        provider.delay = Duration::from_secs(5);
        let pipeline = pipeline(FixedChunker::new(vec![("a", 0)]), Arc::new(provider)).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = pipeline
            .process_file(&FileToProcess::new(1, "slow.rs", "a"), &cancel)
            .await
            .unwrap();

        assert!(result.is_cancelled());
        assert_eq!(result.error.unwrap().stage(), Some(Stage::Embedding));
    }

    #[tokio::test]
    async fn test_chunker_failure() {
        let provider = Arc::new(TableProvider::new(&[]));
        let pipeline = pipeline(FailingChunker, provider).await;

        let result = pipeline
            .process_file(&FileToProcess::new(1, "bad.rs", "x"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(matches!(error, ProcessingError::ChunkingFailed { .. }));
        assert!(error.to_string().contains("parser exploded"));
    }

    #[tokio::test]
    async fn test_uninitialized_is_configuration_error() {
        let pipeline = IndexingPipeline::new(
            Arc::new(FixedChunker::new(vec![("a", 0)])),
            EmbeddingRunner::new(Arc::new(TableProvider::new(&[])), 1),
            ChunkOptions::default(),
        );

        let error = pipeline
            .process_file(&FileToProcess::new(1, "a.rs", "a"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, ProcessingError::Configuration { .. }));
    }
}
