//! Turns raw chunk hits into readable code context.
//!
//! For each hit, in order of preference:
//!
//! 1. If the chunk is a fragment of a split structure, the whole structure is
//!    rebuilt from its siblings and the score gets a small boost.
//! 2. Otherwise neighbouring chunks of the same file are merged around it,
//!    with an elision marker over any gap, at a small score penalty.
//! 3. Otherwise the hit is kept as is.
//!
//! A hit whose lookups fail is kept as is. Results are then deduplicated by
//! file path and content hash and sorted by score.

use crate::storage::{ChunkContext, ChunkId, ChunkRecord, FileId, SimilarChunk};
use fnv::{FnvHashSet, FnvHasher};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Added to the score of a rebuilt structure, capped at 1.0
    pub structure_boost: f32,
    /// Subtracted from the score of a merged neighbourhood, floored at 0.0
    pub adjacency_penalty: f32,
    /// Chunks taken on each side of a hit
    pub adjacency_window: usize,
    pub elision_marker: String,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            structure_boost: 0.05,
            adjacency_penalty: 0.02,
            adjacency_window: 1,
            elision_marker: "\n// ...\n".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// The hit chunk alone
    Chunk,
    /// All fragments of a split structure
    Structure,
    /// The hit merged with neighbouring chunks
    Adjacent,
}

/// One search result after reconstruction.
#[derive(Debug, Clone, Serialize)]
pub struct CodeContext {
    pub file_id: FileId,
    pub file_path: String,
    pub content: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub score: f32,
    /// The hit chunk first, then any merged chunks
    pub chunk_ids: Vec<ChunkId>,
    pub kind: ContextKind,
    pub structure_type: Option<String>,
}

impl CodeContext {
    fn from_hit(hit: &SimilarChunk) -> Self {
        Self {
            file_id: hit.chunk.file_id,
            file_path: hit.file_path.clone(),
            content: hit.chunk.content.clone(),
            start_offset: hit.chunk.start_offset,
            end_offset: hit.chunk.end_offset,
            score: hit.score,
            chunk_ids: vec![hit.chunk.id],
            kind: ContextKind::Chunk,
            structure_type: hit.chunk.structure_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconstructor {
    config: ReconstructionConfig,
}

impl Reconstructor {
    pub fn new(config: ReconstructionConfig) -> Self {
        Self { config }
    }

    pub async fn reconstruct(
        &self,
        hits: &[SimilarChunk],
        source: &dyn ChunkContext,
    ) -> Vec<CodeContext> {
        let enhanced = join_all(hits.iter().map(|hit| async move {
            match self.enhance(hit, source).await {
                Ok(context) => context,
                Err(e) => {
                    warn!(
                        "Could not rebuild context for chunk {} in {}: {}",
                        hit.chunk.id, hit.file_path, e
                    );
                    CodeContext::from_hit(hit)
                }
            }
        }))
        .await;

        let mut contexts = dedupe(enhanced);
        contexts.sort_by(|a, b| b.score.total_cmp(&a.score));
        contexts
    }

    async fn enhance(
        &self,
        hit: &SimilarChunk,
        source: &dyn ChunkContext,
    ) -> anyhow::Result<CodeContext> {
        let chunk = &hit.chunk;

        if let Some(structure_id) = &chunk.parent_structure_id {
            let siblings = source.structure_siblings(chunk.file_id, structure_id).await?;
            if siblings.len() > 1 {
                return Ok(self.merge_structure(hit, siblings));
            }
        }

        let adjacent = source
            .adjacent_chunks(chunk.file_id, chunk.id, self.config.adjacency_window)
            .await?;
        if !adjacent.is_empty() {
            return Ok(self.merge_adjacent(hit, adjacent));
        }

        Ok(CodeContext::from_hit(hit))
    }

    fn merge_structure(&self, hit: &SimilarChunk, mut siblings: Vec<ChunkRecord>) -> CodeContext {
        siblings.sort_by_key(|c| (c.structure_order, c.start_offset));
        debug!(
            "Rebuilt structure {:?} from {} fragments",
            hit.chunk.parent_structure_id,
            siblings.len()
        );

        let mut context = CodeContext::from_hit(hit);
        context.content = siblings.iter().map(|c| c.content.as_str()).collect();
        context.start_offset = siblings.iter().map(|c| c.start_offset).min().unwrap_or(0);
        context.end_offset = siblings.iter().map(|c| c.end_offset).max().unwrap_or(0);
        context.score = (hit.score + self.config.structure_boost).min(1.0);
        context.chunk_ids.extend(
            siblings
                .iter()
                .map(|c| c.id)
                .filter(|id| *id != hit.chunk.id),
        );
        context.kind = ContextKind::Structure;
        context
    }

    fn merge_adjacent(&self, hit: &SimilarChunk, adjacent: Vec<ChunkRecord>) -> CodeContext {
        let mut chunks: Vec<&ChunkRecord> = adjacent
            .iter()
            .filter(|c| c.id != hit.chunk.id)
            .chain(std::iter::once(&hit.chunk))
            .collect();
        chunks.sort_by_key(|c| c.start_offset);

        let mut context = CodeContext::from_hit(hit);
        let (content, start, end) = merge_spans(&chunks, &self.config.elision_marker);
        context.content = content;
        context.start_offset = start;
        context.end_offset = end;
        context.score = (hit.score - self.config.adjacency_penalty).max(0.0);
        context.chunk_ids.extend(
            chunks
                .iter()
                .map(|c| c.id)
                .filter(|id| *id != hit.chunk.id),
        );
        context.kind = ContextKind::Adjacent;
        context
    }
}

/// Joins chunks sorted by offset into one text, inserting `marker` over gaps
/// and trimming overlaps.
fn merge_spans(chunks: &[&ChunkRecord], marker: &str) -> (String, usize, usize) {
    let Some(first) = chunks.first() else {
        return (String::new(), 0, 0);
    };

    let mut content = first.content.clone();
    let start = first.start_offset;
    let mut end = first.end_offset;

    for chunk in &chunks[1..] {
        if chunk.start_offset > end {
            content.push_str(marker);
            content.push_str(&chunk.content);
        } else if chunk.end_offset > end {
            let mut overlap = end - chunk.start_offset;
            while overlap < chunk.content.len() && !chunk.content.is_char_boundary(overlap) {
                overlap += 1;
            }
            content.push_str(chunk.content.get(overlap..).unwrap_or_default());
        } else {
            continue;
        }
        end = end.max(chunk.end_offset);
    }

    (content, start, end)
}

/// Keeps the first context for each (file path, content) pair.
fn dedupe(contexts: Vec<CodeContext>) -> Vec<CodeContext> {
    let mut seen: FnvHashSet<(String, u64)> = FnvHashSet::default();
    contexts
        .into_iter()
        .filter(|context| {
            let mut hasher = FnvHasher::default();
            hasher.write(context.content.as_bytes());
            seen.insert((context.file_path.clone(), hasher.finish()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeContext {
        chunks: Vec<ChunkRecord>,
        fail_for: Option<ChunkId>,
    }

    #[async_trait]
    impl ChunkContext for FakeContext {
        async fn structure_siblings(
            &self,
            file_id: FileId,
            structure_id: &str,
        ) -> anyhow::Result<Vec<ChunkRecord>> {
            Ok(self
                .chunks
                .iter()
                .filter(|c| {
                    c.file_id == file_id && c.parent_structure_id.as_deref() == Some(structure_id)
                })
                .cloned()
                .collect())
        }

        async fn adjacent_chunks(
            &self,
            file_id: FileId,
            chunk_id: ChunkId,
            window: usize,
        ) -> anyhow::Result<Vec<ChunkRecord>> {
            if self.fail_for == Some(chunk_id) {
                anyhow::bail!("database is locked");
            }
            let mut same_file: Vec<_> = self
                .chunks
                .iter()
                .filter(|c| c.file_id == file_id)
                .cloned()
                .collect();
            same_file.sort_by_key(|c| c.start_offset);
            let Some(pos) = same_file.iter().position(|c| c.id == chunk_id) else {
                return Ok(Vec::new());
            };
            let lo = pos.saturating_sub(window);
            let hi = (pos + window + 1).min(same_file.len());
            Ok(same_file[lo..hi]
                .iter()
                .filter(|c| c.id != chunk_id)
                .cloned()
                .collect())
        }
    }

    fn record(id: ChunkId, file_id: FileId, content: &str, start: usize) -> ChunkRecord {
        ChunkRecord {
            id,
            file_id,
            content: content.to_string(),
            start_offset: start,
            end_offset: start + content.len(),
            token_count: 1,
            parent_structure_id: None,
            structure_order: None,
            structure_type: Some("block".to_string()),
        }
    }

    fn fragment(id: ChunkId, content: &str, start: usize, order: u32) -> ChunkRecord {
        ChunkRecord {
            parent_structure_id: Some("block-0".to_string()),
            structure_order: Some(order),
            structure_type: Some("block_fragment".to_string()),
            ..record(id, 1, content, start)
        }
    }

    fn hit(chunk: &ChunkRecord, path: &str, score: f32) -> SimilarChunk {
        SimilarChunk {
            chunk: chunk.clone(),
            file_path: path.to_string(),
            score,
        }
    }

    #[tokio::test]
    async fn test_structure_is_rebuilt_with_bounded_boost() {
        let parts = vec![
            fragment(1, "fn big() {\n", 0, 0),
            fragment(2, "    body();\n", 11, 1),
            fragment(3, "}\n", 23, 2),
        ];
        let source = FakeContext {
            chunks: parts.clone(),
            ..FakeContext::default()
        };

        let contexts = Reconstructor::default()
            .reconstruct(&[hit(&parts[1], "a.rs", 0.98)], &source)
            .await;

        assert_eq!(contexts.len(), 1);
        let context = &contexts[0];
        assert_eq!(context.kind, ContextKind::Structure);
        assert_eq!(context.content, "fn big() {\n    body();\n}\n");
        assert_eq!((context.start_offset, context.end_offset), (0, 25));
        assert_eq!(context.score, 1.0);
        assert_eq!(context.chunk_ids, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn test_neighbours_are_merged_with_elision() {
        let chunks = vec![
            record(1, 1, "use std::io;\n", 0),
            record(2, 1, "fn a() {}\n", 40),
            record(3, 1, "fn b() {}\n", 50),
            record(4, 1, "fn far() {}\n", 200),
        ];
        let source = FakeContext {
            chunks: chunks.clone(),
            ..FakeContext::default()
        };

        let contexts = Reconstructor::default()
            .reconstruct(&[hit(&chunks[1], "a.rs", 0.5)], &source)
            .await;

        let context = &contexts[0];
        assert_eq!(context.kind, ContextKind::Adjacent);
        assert_eq!(context.content, "use std::io;\n\n// ...\nfn a() {}\nfn b() {}\n");
        assert_eq!((context.start_offset, context.end_offset), (0, 60));
        assert!((context.score - 0.48).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_lone_chunk_is_unchanged() {
        let only = record(1, 1, "fn main() {}\n", 0);
        let source = FakeContext {
            chunks: vec![only.clone()],
            ..FakeContext::default()
        };

        let contexts = Reconstructor::default()
            .reconstruct(&[hit(&only, "main.rs", 0.7)], &source)
            .await;

        assert_eq!(contexts[0].kind, ContextKind::Chunk);
        assert_eq!(contexts[0].content, "fn main() {}\n");
        assert_eq!(contexts[0].score, 0.7);
    }

    #[tokio::test]
    async fn test_lookup_failure_falls_back_to_hit() {
        let chunks = vec![record(1, 1, "a", 0), record(2, 1, "b", 1)];
        let source = FakeContext {
            chunks: chunks.clone(),
            fail_for: Some(1),
        };

        let contexts = Reconstructor::default()
            .reconstruct(&[hit(&chunks[0], "x.rs", 0.9), hit(&chunks[1], "x.rs", 0.4)], &source)
            .await;

        assert_eq!(contexts[0].kind, ContextKind::Chunk);
        assert_eq!(contexts[0].content, "a");
        assert_eq!(contexts[0].score, 0.9);
        assert_eq!(contexts[1].kind, ContextKind::Adjacent);
    }

    #[tokio::test]
    async fn test_duplicates_removed_and_sorted() {
        let parts = vec![fragment(1, "part one ", 0, 0), fragment(2, "part two", 9, 1)];
        let other = record(10, 2, "other file", 0);
        let mut chunks = parts.clone();
        chunks.push(other.clone());
        let source = FakeContext {
            chunks,
            ..FakeContext::default()
        };

        let contexts = Reconstructor::default()
            .reconstruct(
                &[
                    hit(&parts[0], "a.rs", 0.3),
                    hit(&other, "b.rs", 0.6),
                    hit(&parts[1], "a.rs", 0.5),
                ],
                &source,
            )
            .await;

        // Both fragments rebuild the same structure; the first occurrence wins
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].file_path, "b.rs");
        assert_eq!(contexts[1].file_path, "a.rs");
        assert!((contexts[1].score - 0.35).abs() < 1e-6);
        assert!(contexts.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_merge_spans_trims_overlap() {
        let a = record(1, 1, "abcdef", 0);
        let b = record(2, 1, "defghi", 3);
        let (content, start, end) = merge_spans(&[&a, &b], "|");
        assert_eq!(content, "abcdefghi");
        assert_eq!((start, end), (0, 9));
    }

    #[test]
    fn test_merge_spans_overlap_inside_multibyte_char() {
        // One byte of overlap ends inside 'é'
        let a = record(1, 1, "ab", 0);
        let b = record(2, 1, "éc", 1);
        let (content, start, end) = merge_spans(&[&a, &b], "|");
        assert_eq!(content, "abc");
        assert_eq!((start, end), (0, 4));
    }
}
