//! usearch HNSW index holding the embedding vectors.

use super::Label;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

const CONNECTIVITY: usize = 16;
const EXPANSION_ADD: usize = 128;
const EXPANSION_SEARCH: usize = 64;

static GENERATION: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum AnnError {
    #[error("failed to create ANN index: {0}")]
    Create(String),

    #[error("failed to load ANN index from {path}: {message}")]
    Load { path: String, message: String },

    #[error("failed to save ANN index to {path}: {message}")]
    Save { path: String, message: String },

    #[error("ANN index at {path} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        path: String,
        expected: usize,
        actual: usize,
    },

    #[error("failed to reserve {requested} slots: {message}")]
    Reserve { requested: usize, message: String },

    #[error("ANN operation failed: {0}")]
    Operation(String),
}

/// Distance metric of the index. Scores are reported as `1 - distance`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Cosine,
    InnerProduct,
}

impl Metric {
    fn kind(self) -> MetricKind {
        match self {
            Metric::Cosine => MetricKind::Cos,
            Metric::InnerProduct => MetricKind::IP,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::InnerProduct => "inner_product",
        }
    }
}

/// An HNSW graph of fixed dimension. Labels are assigned by the caller.
pub struct AnnIndex {
    index: usearch::Index,
    dimension: usize,
    metric: Metric,
    generation: u64,
    capacity_limit: Option<usize>,
}

impl std::fmt::Debug for AnnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnIndex")
            .field("dimension", &self.dimension)
            .field("metric", &self.metric)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("generation", &self.generation)
            .field("capacity_limit", &self.capacity_limit)
            .finish()
    }
}

impl AnnIndex {
    fn options(dimension: usize, metric: Metric) -> IndexOptions {
        IndexOptions {
            dimensions: dimension,
            metric: metric.kind(),
            quantization: ScalarKind::F32,
            connectivity: CONNECTIVITY,
            expansion_add: EXPANSION_ADD,
            expansion_search: EXPANSION_SEARCH,
            multi: false,
        }
    }

    /// A fresh, empty index with room for `capacity` points.
    pub fn create(dimension: usize, capacity: usize, metric: Metric) -> Result<Self, AnnError> {
        let index = usearch::Index::new(&Self::options(dimension, metric))
            .map_err(|e| AnnError::Create(e.to_string()))?;
        let ann = Self {
            index,
            dimension,
            metric,
            generation: GENERATION.fetch_add(1, Ordering::Relaxed),
            capacity_limit: None,
        };
        ann.reserve(capacity.max(1))?;
        Ok(ann)
    }

    /// Loads a persisted index, checking it matches `dimension`.
    pub fn load(
        path: &Path,
        dimension: usize,
        capacity: usize,
        metric: Metric,
    ) -> Result<Self, AnnError> {
        let path_str = path.to_string_lossy();
        let index = usearch::Index::new(&Self::options(dimension, metric))
            .map_err(|e| AnnError::Create(e.to_string()))?;
        index.load(path_str.as_ref()).map_err(|e| AnnError::Load {
            path: path_str.to_string(),
            message: e.to_string(),
        })?;

        if index.dimensions() != dimension {
            return Err(AnnError::DimensionMismatch {
                path: path_str.to_string(),
                expected: dimension,
                actual: index.dimensions(),
            });
        }

        let ann = Self {
            index,
            dimension,
            metric,
            generation: GENERATION.fetch_add(1, Ordering::Relaxed),
            capacity_limit: None,
        };
        ann.reserve(capacity.max(ann.len()).max(1))?;
        Ok(ann)
    }

    pub fn save(&self, path: &Path) -> Result<(), AnnError> {
        let path_str = path.to_string_lossy();
        self.index.save(path_str.as_ref()).map_err(|e| AnnError::Save {
            path: path_str.to_string(),
            message: e.to_string(),
        })
    }

    pub fn reserve(&self, capacity: usize) -> Result<(), AnnError> {
        self.index.reserve(capacity).map_err(|e| AnnError::Reserve {
            requested: capacity,
            message: e.to_string(),
        })
    }

    /// Caps how far [`grow`](Self::grow) may take the capacity.
    pub fn with_capacity_limit(mut self, limit: Option<usize>) -> Self {
        self.capacity_limit = limit;
        self
    }

    pub fn capacity_limit(&self) -> Option<usize> {
        self.capacity_limit
    }

    /// Whether another point fits without growing.
    pub fn has_room(&self) -> bool {
        let len = self.len();
        len < self.capacity() && self.capacity_limit.is_none_or(|limit| len < limit)
    }

    /// Doubles the capacity, bounded by the capacity limit. Returns the new capacity.
    pub fn grow(&self) -> Result<usize, AnnError> {
        let doubled = self.capacity().saturating_mul(2).max(1);
        let target = match self.capacity_limit {
            Some(limit) => doubled.min(limit),
            None => doubled,
        };
        if target <= self.len() {
            return Err(AnnError::Reserve {
                requested: doubled,
                message: format!(
                    "capacity limit of {} points reached",
                    self.capacity_limit.unwrap_or(target)
                ),
            });
        }
        self.reserve(target)?;
        Ok(target)
    }

    pub fn add(&self, label: Label, vector: &[f32]) -> Result<(), AnnError> {
        self.index
            .add(label, vector)
            .map_err(|e| AnnError::Operation(e.to_string()))
    }

    /// Up to `k` nearest points as `(label, distance)`, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(Label, f32)>, AnnError> {
        if k == 0 || self.len() == 0 {
            return Ok(Vec::new());
        }
        let matches = self
            .index
            .search(query, k.min(self.len()))
            .map_err(|e| AnnError::Operation(e.to_string()))?;
        Ok(matches
            .keys
            .into_iter()
            .zip(matches.distances)
            .collect())
    }

    /// The stored vector for `label`, if present.
    pub fn get(&self, label: Label) -> Result<Option<Vec<f32>>, AnnError> {
        if !self.index.contains(label) {
            return Ok(None);
        }
        let mut vector = vec![0.0f32; self.dimension];
        let found = self
            .index
            .get(label, &mut vector)
            .map_err(|e| AnnError::Operation(e.to_string()))?;
        Ok((found > 0).then_some(vector))
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.index.capacity()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Distinguishes index instances; a rebuilt index gets a new generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Similarity score for a distance reported by the index, clamped to `[0, 1]`.
pub fn distance_to_score(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_search_get() {
        let index = AnnIndex::create(3, 8, Metric::Cosine).unwrap();
        index.add(0, &[1.0, 0.0, 0.0]).unwrap();
        index.add(1, &[0.0, 1.0, 0.0]).unwrap();
        index.add(2, &[0.9, 0.1, 0.0]).unwrap();

        assert_eq!(index.len(), 3);
        assert!(index.capacity() >= 8);

        let hits = index.search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].0, 0);
        assert_eq!(hits[1].0, 2);
        assert!(distance_to_score(hits[0].1) > 0.99);

        assert_eq!(index.get(1).unwrap(), Some(vec![0.0, 1.0, 0.0]));
        assert_eq!(index.get(42).unwrap(), None);
    }

    #[test]
    fn test_search_more_than_stored() {
        let index = AnnIndex::create(2, 4, Metric::Cosine).unwrap();
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());

        index.add(0, &[1.0, 0.0]).unwrap();
        assert_eq!(index.search(&[1.0, 0.0], 5).unwrap().len(), 1);
        assert!(index.search(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("vectors.usearch");

        let index = AnnIndex::create(3, 4, Metric::Cosine).unwrap();
        index.add(0, &[0.1, 0.2, 0.3]).unwrap();
        index.save(&path).unwrap();

        let loaded = AnnIndex::load(&path, 3, 4, Metric::Cosine).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_ne!(loaded.generation(), index.generation());
        assert_eq!(loaded.get(0).unwrap(), Some(vec![0.1, 0.2, 0.3]));
    }

    #[test]
    fn test_load_garbage_fails() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("vectors.usearch");
        std::fs::write(&path, b"not an index").unwrap();

        assert!(AnnIndex::load(&path, 3, 4, Metric::Cosine).is_err());
    }

    #[test]
    fn test_grow_stops_at_capacity_limit() {
        let index = AnnIndex::create(2, 1, Metric::Cosine)
            .unwrap()
            .with_capacity_limit(Some(3));

        let mut label = 0;
        while label < 3 {
            if !index.has_room() {
                index.grow().unwrap();
            }
            index.add(label, &[1.0, label as f32]).unwrap();
            label += 1;
        }

        assert_eq!(index.len(), 3);
        assert!(!index.has_room());
        assert!(matches!(index.grow(), Err(AnnError::Reserve { .. })));
    }

    #[test]
    fn test_distance_to_score_is_clamped() {
        assert_eq!(distance_to_score(0.0), 1.0);
        assert_eq!(distance_to_score(1.5), 0.0);
        assert_eq!(distance_to_score(-0.2), 1.0);
        assert!((distance_to_score(0.25) - 0.75).abs() < 1e-6);
    }
}
