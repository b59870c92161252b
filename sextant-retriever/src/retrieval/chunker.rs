//! The chunker interface and the default line-block chunker.

use super::pipeline::FileToProcess;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkOptions {
    /// Upper bound on a chunk's length in bytes
    pub max_chunk_size: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

impl ChunkOptions {
    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }
}

/// Structural facts about one chunk, parallel to [`ChunkerOutput::chunks`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChunkStructure {
    pub end_offset: usize,
    pub token_count: usize,
    pub parent_structure_id: Option<String>,
    pub structure_order: Option<u32>,
    pub structure_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StructureMetadata {
    pub language: Option<String>,
    pub chunks: Vec<ChunkStructure>,
}

/// Chunk texts with their start byte offsets, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkerOutput {
    pub chunks: Vec<String>,
    pub offsets: Vec<usize>,
    pub metadata: StructureMetadata,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("chunking cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Splits a file into chunks for embedding.
#[async_trait]
pub trait Chunker: Send + Sync {
    /// Prepares the chunker; called once by the pipeline before any file.
    async fn initialize(&self) -> Result<(), ChunkError> {
        Ok(())
    }

    async fn chunk(
        &self,
        file: &FileToProcess,
        options: &ChunkOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkerOutput, ChunkError>;
}

/// Packs blank-line separated blocks into chunks up to `max_chunk_size`.
///
/// A block that alone exceeds the limit is cut at line boundaries (or inside a
/// line when one line is too long) into fragments sharing a
/// `parent_structure_id` of `block-<start offset>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineBlockChunker;

#[async_trait]
impl Chunker for LineBlockChunker {
    async fn chunk(
        &self,
        file: &FileToProcess,
        options: &ChunkOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkerOutput, ChunkError> {
        chunk_blocks(&file.path, &file.content, options, cancel)
    }
}

fn chunk_blocks(
    path: &str,
    content: &str,
    options: &ChunkOptions,
    cancel: &CancellationToken,
) -> Result<ChunkerOutput, ChunkError> {
    let max = options.max_chunk_size.max(1);
    let mut pieces: Vec<(Range<usize>, Option<(String, u32)>)> = Vec::new();
    let mut current: Option<Range<usize>> = None;

    for block in split_blocks(content) {
        if cancel.is_cancelled() {
            return Err(ChunkError::Cancelled);
        }

        if block.len() > max {
            if let Some(range) = current.take() {
                pieces.push((range, None));
            }
            let structure_id = format!("block-{}", block.start);
            for (order, range) in split_oversized(content, block, max).into_iter().enumerate() {
                pieces.push((range, Some((structure_id.clone(), order as u32))));
            }
            continue;
        }

        match current.as_mut() {
            Some(range) if block.end - range.start <= max => range.end = block.end,
            _ => {
                if let Some(range) = current.replace(block) {
                    pieces.push((range, None));
                }
            }
        }
    }
    if let Some(range) = current {
        pieces.push((range, None));
    }

    let mut output = ChunkerOutput {
        metadata: StructureMetadata {
            language: language_for_path(Path::new(path)).map(str::to_string),
            chunks: Vec::new(),
        },
        ..ChunkerOutput::default()
    };

    for (range, structure) in pieces {
        let text = &content[range.clone()];
        if text.trim().is_empty() {
            continue;
        }
        let (parent_structure_id, structure_order, structure_type) = match structure {
            Some((id, order)) => (Some(id), Some(order), "block_fragment"),
            None => (None, None, "block"),
        };
        output.chunks.push(text.to_string());
        output.offsets.push(range.start);
        output.metadata.chunks.push(ChunkStructure {
            end_offset: range.end,
            token_count: estimate_tokens(text),
            parent_structure_id,
            structure_order,
            structure_type: Some(structure_type.to_string()),
        });
    }

    Ok(output)
}

/// Byte ranges of blank-line terminated blocks. Together they cover `content`.
fn split_blocks(content: &str) -> Vec<Range<usize>> {
    let mut blocks = Vec::new();
    let mut start = 0;
    let mut pos = 0;
    let mut has_text = false;

    for line in content.split_inclusive('\n') {
        let end = pos + line.len();
        if line.trim().is_empty() {
            if has_text {
                blocks.push(start..end);
                start = end;
                has_text = false;
            }
        } else {
            has_text = true;
        }
        pos = end;
    }
    if start < content.len() {
        blocks.push(start..content.len());
    }
    blocks
}

/// Cuts `block` into consecutive ranges no longer than `max` bytes, preferring line ends.
fn split_oversized(content: &str, block: Range<usize>, max: usize) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut start = block.start;
    let mut pos = block.start;

    for line in content[block.clone()].split_inclusive('\n') {
        let line_start = pos;
        let line_end = pos + line.len();
        pos = line_end;

        if line.len() > max {
            if start < line_start {
                out.push(start..line_start);
            }
            let mut cut = line_start;
            while cut < line_end {
                let end = char_boundary_at_or_before(content, (cut + max).min(line_end), cut);
                out.push(cut..end);
                cut = end;
            }
            start = line_end;
            continue;
        }

        if line_end - start > max {
            out.push(start..line_start);
            start = line_start;
        }
    }
    if start < block.end {
        out.push(start..block.end);
    }
    out
}

/// Largest char boundary `<= index` that is still past `floor`; steps forward
/// when a single character is wider than the space available.
fn char_boundary_at_or_before(content: &str, index: usize, floor: usize) -> usize {
    let mut end = index;
    while end > floor && !content.is_char_boundary(end) {
        end -= 1;
    }
    if end == floor {
        end = floor + 1;
        while end < content.len() && !content.is_char_boundary(end) {
            end += 1;
        }
    }
    end
}

/// Whitespace-separated word count.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Whether a path looks like a source or text file worth indexing.
pub fn should_index_file(file_path: &Path) -> bool {
    if let Some(filename) = file_path.file_name().and_then(|n| n.to_str()) {
        if filename.starts_with('.') {
            return false;
        }
    }

    match file_path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if language_for_extension(ext).is_some() => true,

        Some("md") | Some("markdown") | Some("txt") | Some("toml") | Some("yaml")
        | Some("yml") | Some("json") => true,

        Some("exe") | Some("dll") | Some("so") | Some("dylib") | Some("bin") | Some("png")
        | Some("jpg") | Some("jpeg") | Some("gif") | Some("ico") | Some("wasm")
        | Some("lock") | Some("pdf") | Some("zip") | Some("gz") | Some("usearch")
        | Some("db") => false,

        None => file_path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| {
                matches!(
                    name,
                    "README" | "CHANGELOG" | "LICENSE" | "Makefile" | "Dockerfile"
                )
            }),

        Some(_) => true,
    }
}

/// Programming language of a file, from its extension.
pub fn language_for_path(path: &Path) -> Option<&'static str> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(language_for_extension)
}

fn language_for_extension(ext: &str) -> Option<&'static str> {
    let language = match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "scala" => "scala",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        _ => return None,
    };
    Some(language)
}
