//! The persistent vector store: relational metadata plus the ANN index.
//!
//! The ANN index moves through an explicit state machine:
//!
//! ```text
//!   Uninitialized ──set_dimension(d)──▶ Ready(d)
//!   Ready(d)      ──set_dimension(d)──▶ Ready(d)     (no-op)
//!   Ready(d)      ──set_dimension(e)──▶ Ready(e)     (old index torn down, not saved)
//!   Ready(d)      ──clear_dimension──▶ Uninitialized (index file deleted)
//!   Ready(d)      ──compact─────────▶ Ready(d)     (live points copied under dense labels)
//! ```
//!
//! Deleted and re-chunked files leave stale points behind. Search widens its
//! candidate window until enough live hits resolve, and the index is rebuilt
//! once stale points reach `compaction_threshold` of its size.
//!
//! # Invariants
//!
//! All ANN transitions, and the check-capacity / grow / insert / persist
//! sequence of [`VectorStore::store_embeddings`], run while holding the single
//! `ann` mutex. Whenever an index is discarded or replaced, embedding rows
//! whose label the new index does not hold are purged inside the same
//! critical section, so every stored label resolves to a live point.

use super::ann_index::{AnnIndex, distance_to_score};
use super::file_index::FileIndex;
use super::{
    ChunkContext, ChunkId, ChunkRecord, EmbeddingInput, FileId, IndexStats, Label, SearchOptions,
    SimilarChunk, StoredEmbedding,
};
use crate::config::{IndexConfig, RetrieverConfig};
use crate::error::StoreError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, StoreError>;

const META_DIMENSION: &str = "ann.dimension";
const META_METRIC: &str = "ann.metric";

/// Lifecycle of the ANN index owned by a [`VectorStore`].
#[derive(Debug, Default)]
pub enum AnnState {
    #[default]
    Uninitialized,
    Ready(AnnIndex),
}

impl AnnState {
    fn index(&self) -> Option<&AnnIndex> {
        match self {
            AnnState::Ready(index) => Some(index),
            AnnState::Uninitialized => None,
        }
    }

    /// Moves the current index out, leaving the state uninitialized.
    fn teardown(&mut self) -> Option<AnnIndex> {
        match std::mem::take(self) {
            AnnState::Ready(index) => Some(index),
            AnnState::Uninitialized => None,
        }
    }
}

/// Snapshot of the live ANN index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnInfo {
    pub dimension: usize,
    pub len: usize,
    pub capacity: usize,
    pub generation: u64,
}

/// Files, chunks and embeddings, with similarity search over the embeddings.
///
/// Construct once and share as `Arc<VectorStore>`.
#[derive(Debug)]
pub struct VectorStore {
    files: FileIndex,
    ann: Mutex<AnnState>,
    index_path: PathBuf,
    config: IndexConfig,
}

impl VectorStore {
    /// Opens the store under `<base>/.sextant/`. The ANN index stays
    /// uninitialized until [`set_dimension`](Self::set_dimension).
    pub async fn open(base: &Path, config: IndexConfig) -> Result<Self> {
        let files = FileIndex::open(&RetrieverConfig::database_path(base)).await?;
        Ok(Self::with_file_index(
            files,
            RetrieverConfig::ann_index_path(base),
            config,
        ))
    }

    /// Store over an existing relational index, persisting the ANN index at `index_path`.
    pub fn with_file_index(files: FileIndex, index_path: PathBuf, config: IndexConfig) -> Self {
        Self {
            files,
            ann: Mutex::new(AnnState::Uninitialized),
            index_path,
            config,
        }
    }

    pub fn files(&self) -> &FileIndex {
        &self.files
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Makes the ANN index ready for `dimension`, loading the persisted index when it
    /// matches. A same-dimension call on a ready index does nothing.
    pub async fn set_dimension(&self, dimension: usize) -> Result<()> {
        if dimension == 0 {
            return Err(StoreError::DimensionMismatch {
                chunk_id: None,
                expected: 1,
                actual: 0,
            });
        }

        let mut state = self.ann.lock().await;
        if let Some(index) = state.index() {
            if index.dimension() == dimension {
                debug!("ANN index already initialized at dimension {}", dimension);
                return Ok(());
            }
        }

        let discarded = state.teardown();
        let replacing = discarded.is_some();
        if let Some(old) = discarded {
            info!(
                "Embedding dimension changed from {} to {}, discarding ANN index with {} points",
                old.dimension(),
                dimension,
                old.len()
            );
        }

        let previous = self.files.get_metadata(META_DIMENSION).await?;
        if let Some(previous) = previous.as_deref() {
            if previous != dimension.to_string() {
                info!(
                    "Stored embeddings have dimension {}, now {}",
                    previous, dimension
                );
            }
        }

        let index = if replacing {
            self.create_index(dimension)?
        } else {
            self.load_or_create(dimension)?
        };

        self.reconcile(&index).await?;
        persist(&index, &self.index_path).await?;

        self.files
            .set_metadata(META_DIMENSION, &dimension.to_string())
            .await?;
        self.files
            .set_metadata(META_METRIC, self.config.metric.as_str())
            .await?;

        info!(
            "ANN index ready: dimension {}, {} points, capacity {}",
            dimension,
            index.len(),
            index.capacity()
        );
        *state = AnnState::Ready(index);
        Ok(())
    }

    /// Re-enters the dimension recorded by a previous run, if any.
    pub async fn restore_dimension(&self) -> Result<Option<usize>> {
        let stored = self.files.get_metadata(META_DIMENSION).await?;
        match stored.and_then(|value| value.parse::<usize>().ok()) {
            Some(dimension) => {
                self.set_dimension(dimension).await?;
                Ok(Some(dimension))
            }
            None => Ok(None),
        }
    }

    /// Tears down the ANN index, deletes its file and purges all embedding rows.
    pub async fn clear_dimension(&self) -> Result<()> {
        let mut state = self.ann.lock().await;
        state.teardown();
        self.remove_index_file().await?;

        let lost = self.files.purge_labels_from(0).await?;
        if lost > 0 {
            warn!(
                "Cleared embedding dimension, {} embeddings discarded; affected files will be re-indexed",
                lost
            );
        }
        self.files.delete_metadata(META_DIMENSION).await?;
        Ok(())
    }

    fn create_index(&self, dimension: usize) -> Result<AnnIndex> {
        self.create_index_with_capacity(dimension, self.config.max_elements)
    }

    fn create_index_with_capacity(&self, dimension: usize, capacity: usize) -> Result<AnnIndex> {
        let capacity = match self.config.max_capacity {
            Some(limit) => capacity.min(limit),
            None => capacity,
        };
        Ok(AnnIndex::create(dimension, capacity, self.config.metric)?
            .with_capacity_limit(self.config.max_capacity))
    }

    /// Loads the persisted index; any failure falls back to a fresh empty index.
    fn load_or_create(&self, dimension: usize) -> Result<AnnIndex> {
        if !self.index_path.exists() {
            return self.create_index(dimension);
        }

        match AnnIndex::load(
            &self.index_path,
            dimension,
            self.config.max_elements,
            self.config.metric,
        ) {
            Ok(index) => {
                debug!(
                    "Loaded ANN index from {} with {} points",
                    self.index_path.display(),
                    index.len()
                );
                Ok(index.with_capacity_limit(self.config.max_capacity))
            }
            Err(e) => {
                warn!("Discarding unusable ANN index: {}", e);
                self.create_index(dimension)
            }
        }
    }

    /// Drops embedding rows whose label `index` does not hold.
    async fn reconcile(&self, index: &AnnIndex) -> Result<()> {
        let lost = self.files.purge_labels_from(index.len() as u64).await?;
        if lost > 0 {
            warn!(
                "{} embeddings are no longer backed by the ANN index and were discarded; \
                 affected files will be re-indexed",
                lost
            );
        }
        Ok(())
    }

    async fn remove_index_file(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.index_path).await {
            Ok(()) => {
                debug!("Deleted ANN index file {}", self.index_path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Adds vectors for chunks and records their labels, returning labels in input order.
    ///
    /// The whole batch is validated against the index dimension first. The index is
    /// persisted before returning, including when an insert fails part way.
    pub async fn store_embeddings(&self, batch: &[EmbeddingInput]) -> Result<Vec<Label>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.ann.lock().await;
        let index = state.index().ok_or(StoreError::NoDimension)?;

        if let Some(bad) = batch.iter().find(|e| e.vector.len() != index.dimension()) {
            return Err(StoreError::DimensionMismatch {
                chunk_id: Some(bad.chunk_id),
                expected: index.dimension(),
                actual: bad.vector.len(),
            });
        }

        let mut rows: Vec<(ChunkId, Label)> = Vec::with_capacity(batch.len());
        let mut failure = None;

        for item in batch {
            if !index.has_room() {
                let capacity = index.capacity();
                match index.grow() {
                    Ok(grown) => info!("Grew ANN index capacity from {} to {}", capacity, grown),
                    Err(e) => {
                        failure = Some(StoreError::CapacityExhausted {
                            capacity: index.len(),
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }

            let label = index.len() as Label;
            if let Err(e) = index.add(label, &item.vector) {
                failure = Some(e.into());
                break;
            }
            rows.push((item.chunk_id, label));
        }

        self.files.insert_embedding_records(&rows).await?;
        persist(&index, &self.index_path).await?;
        debug!("Stored {} embeddings", rows.len());

        match failure {
            Some(e) => Err(e),
            None => Ok(rows.into_iter().map(|(_, label)| label).collect()),
        }
    }

    /// Nearest chunks to `query`, best first.
    ///
    /// Asks the ANN index for `limit * overfetch_factor` candidates and doubles
    /// that until `limit` hits survive label resolution and the file filter, the
    /// candidates fall below `min_score`, or the index has nothing more to give.
    pub async fn find_similar_code(
        &self,
        query: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SimilarChunk>> {
        if options.limit == 0 {
            return Ok(Vec::new());
        }

        let mut k = options
            .limit
            .saturating_mul(self.config.overfetch_factor.max(1));
        loop {
            let (candidates, exhausted) = {
                let state = self.ann.lock().await;
                let Some(index) = state.index() else {
                    return Ok(Vec::new());
                };
                if index.is_empty() {
                    return Ok(Vec::new());
                }
                if query.len() != index.dimension() {
                    return Err(StoreError::DimensionMismatch {
                        chunk_id: None,
                        expected: index.dimension(),
                        actual: query.len(),
                    });
                }
                (index.search(query, k)?, k >= index.len())
            };

            let below_min_score = candidates
                .last()
                .is_some_and(|(_, distance)| distance_to_score(*distance) < options.min_score);
            let results = self.resolve_candidates(candidates, options).await?;

            if results.len() >= options.limit || exhausted || below_min_score {
                return Ok(results);
            }
            debug!(
                "{} of {} hits after {} candidates, widening search",
                results.len(),
                options.limit,
                k
            );
            k = k.saturating_mul(2);
        }
    }

    async fn resolve_candidates(
        &self,
        candidates: Vec<(Label, f32)>,
        options: &SearchOptions,
    ) -> Result<Vec<SimilarChunk>> {
        let scored: Vec<(Label, f32)> = candidates
            .into_iter()
            .map(|(label, distance)| (label, distance_to_score(distance)))
            .filter(|(_, score)| *score >= options.min_score)
            .collect();

        let labels: Vec<Label> = scored.iter().map(|(label, _)| *label).collect();
        let mut resolved = self.files.resolve_labels(&labels).await?;

        let mut results: Vec<SimilarChunk> = scored
            .into_iter()
            .filter_map(|(label, score)| {
                let hit = resolved.remove(&label)?;
                Some(SimilarChunk {
                    chunk: hit.chunk,
                    file_path: hit.file_path,
                    score,
                })
            })
            .filter(|hit| match &options.file_filter {
                Some(paths) => paths.iter().any(|path| path == &hit.file_path),
                None => true,
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(options.limit);
        Ok(results)
    }

    /// The embedding row for a chunk with its vector. The vector is empty when the
    /// ANN index is not ready or no longer holds the point.
    pub async fn get_embedding(&self, chunk_id: ChunkId) -> Result<Option<StoredEmbedding>> {
        let Some(record) = self.files.get_embedding_record(chunk_id).await? else {
            return Ok(None);
        };

        let state = self.ann.lock().await;
        let vector = match state.index() {
            Some(index) => index.get(record.label)?.unwrap_or_default(),
            None => Vec::new(),
        };
        Ok(Some(StoredEmbedding { record, vector }))
    }

    /// Empties the index and deletes every chunk and embedding row. File rows are
    /// kept and marked unindexed.
    pub async fn delete_all_embeddings_and_chunks(&self) -> Result<()> {
        let mut state = self.ann.lock().await;
        match state.teardown() {
            Some(old) => {
                let fresh = self.create_index(old.dimension())?;
                persist(&fresh, &self.index_path).await?;
                *state = AnnState::Ready(fresh);
            }
            None => self.remove_index_file().await?,
        }

        let removed = self.files.delete_all_chunks().await?;
        info!("Deleted all embeddings and {} chunks", removed);
        Ok(())
    }

    /// Deletes a file's row, chunks and embedding rows, compacting the ANN index
    /// if that leaves too many stale points.
    pub async fn remove_file(&self, path: &str) -> Result<bool> {
        let removed = self.files.delete_file(path).await?;
        if removed {
            self.compact_if_needed().await?;
        }
        Ok(removed)
    }

    /// Rebuilds the ANN index when the share of stale points reaches
    /// `compaction_threshold`. Returns whether a rebuild happened.
    pub async fn compact_if_needed(&self) -> Result<bool> {
        let mut state = self.ann.lock().await;
        let Some(index) = state.index() else {
            return Ok(false);
        };
        let len = index.len();
        let live = self.files.stats().await?.embeddings_count;
        let stale = len.saturating_sub(live);
        if stale == 0 || (stale as f32) < self.config.compaction_threshold * len as f32 {
            return Ok(false);
        }

        info!("{} of {} ANN points are stale, compacting", stale, len);
        self.rebuild(&mut state).await?;
        Ok(true)
    }

    /// Rebuilds the ANN index from the live embedding rows regardless of staleness.
    pub async fn compact(&self) -> Result<()> {
        let mut state = self.ann.lock().await;
        self.rebuild(&mut state).await
    }

    /// Copies every live point into a fresh index under dense labels, rewrites
    /// the label rows to match and persists the result.
    async fn rebuild(&self, state: &mut AnnState) -> Result<()> {
        let (fresh, relabeled) = {
            let Some(old) = state.index() else {
                return Ok(());
            };
            let pairs = self.files.list_embedding_labels().await?;
            let fresh = self.create_index_with_capacity(
                old.dimension(),
                self.config.max_elements.max(pairs.len()),
            )?;

            let mut relabeled = Vec::with_capacity(pairs.len());
            for (chunk_id, label) in pairs {
                let Some(vector) = old.get(label)? else {
                    continue;
                };
                if !fresh.has_room() {
                    fresh.grow()?;
                }
                let new_label = fresh.len() as Label;
                fresh.add(new_label, &vector)?;
                relabeled.push((chunk_id, new_label));
            }
            (fresh, relabeled)
        };

        let lost = self.files.relabel_embeddings(&relabeled).await?;
        if lost > 0 {
            warn!(
                "{} embeddings had no vector in the ANN index and were discarded; \
                 affected files will be re-indexed",
                lost
            );
        }
        persist(&fresh, &self.index_path).await?;
        info!("Compacted ANN index to {} points", fresh.len());
        *state = AnnState::Ready(fresh);
        Ok(())
    }

    pub async fn ann_info(&self) -> Option<AnnInfo> {
        let state = self.ann.lock().await;
        state.index().map(|index| AnnInfo {
            dimension: index.dimension(),
            len: index.len(),
            capacity: index.capacity(),
            generation: index.generation(),
        })
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let mut stats = self.files.stats().await?;
        if let Some(info) = self.ann_info().await {
            stats.ann_dimension = Some(info.dimension);
            stats.ann_len = info.len;
            stats.ann_capacity = info.capacity;
            stats.ann_stale_points = info.len.saturating_sub(stats.embeddings_count);
        }
        Ok(stats)
    }

    /// Persists the index and closes the relational store.
    pub async fn dispose(&self) -> Result<()> {
        let mut state = self.ann.lock().await;
        if let Some(index) = state.teardown() {
            persist(&index, &self.index_path).await?;
            debug!("Persisted ANN index with {} points", index.len());
        }
        self.files.close().await;
        Ok(())
    }
}

/// Saves `index` to `path`, creating its parent directory first.
async fn persist(index: &AnnIndex, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(index.save(path)?)
}

#[async_trait]
impl ChunkContext for VectorStore {
    async fn structure_siblings(
        &self,
        file_id: FileId,
        structure_id: &str,
    ) -> anyhow::Result<Vec<ChunkRecord>> {
        self.files.get_structure_siblings(file_id, structure_id).await
    }

    async fn adjacent_chunks(
        &self,
        file_id: FileId,
        chunk_id: ChunkId,
        window: usize,
    ) -> anyhow::Result<Vec<ChunkRecord>> {
        self.files.get_adjacent_chunks(file_id, chunk_id, window).await
    }
}
