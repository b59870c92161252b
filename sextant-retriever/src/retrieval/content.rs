//! Where file contents come from.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Text and modification time of a file.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub text: String,
    /// Unix timestamp (seconds)
    pub modified_at: i64,
}

/// Supplies file contents to the indexing engine, keyed by path relative to its root.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn read(&self, relative_path: &str) -> Result<FileContent>;
}

/// Reads files from disk under `root`.
#[derive(Debug, Clone)]
pub struct FsContentProvider {
    root: PathBuf,
}

impl FsContentProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ContentProvider for FsContentProvider {
    async fn read(&self, relative_path: &str) -> Result<FileContent> {
        let path = self.root.join(relative_path);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let text = String::from_utf8(bytes)
            .with_context(|| format!("{} is not valid UTF-8", path.display()))?;

        let modified_at = tokio::fs::metadata(&path)
            .await?
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)?
            .as_secs() as i64;

        Ok(FileContent { text, modified_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_reads_relative_to_root() -> Result<()> {
        let temp_dir = tempdir()?;
        std::fs::create_dir_all(temp_dir.path().join("src"))?;
        std::fs::write(temp_dir.path().join("src/lib.rs"), "pub fn x() {}\n")?;

        let provider = FsContentProvider::new(temp_dir.path());
        let content = provider.read("src/lib.rs").await?;

        assert_eq!(content.text, "pub fn x() {}\n");
        assert!(content.modified_at > 0);
        assert!(provider.read("missing.rs").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_binary() -> Result<()> {
        let temp_dir = tempdir()?;
        std::fs::write(temp_dir.path().join("blob.rs"), [0xff, 0xfe, 0x00])?;

        let provider = FsContentProvider::new(temp_dir.path());
        assert!(provider.read("blob.rs").await.is_err());
        Ok(())
    }
}
