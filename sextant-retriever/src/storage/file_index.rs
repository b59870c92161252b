//! Relational half of the index: files, chunks, embedding labels, metadata.
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE files (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     path TEXT UNIQUE NOT NULL,       -- path relative to the indexed root
//!     content_hash TEXT NOT NULL,      -- blake3, hex
//!     modified_at INTEGER NOT NULL,    -- unix seconds
//!     language TEXT,
//!     is_indexed INTEGER NOT NULL DEFAULT 0,
//!     size INTEGER NOT NULL,
//!     indexed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
//! );
//!
//! CREATE TABLE chunks (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
//!     content TEXT NOT NULL,
//!     start_offset INTEGER NOT NULL,   -- byte offsets into the file
//!     end_offset INTEGER NOT NULL,
//!     token_count INTEGER NOT NULL,
//!     parent_structure_id TEXT,        -- shared by fragments of one structure
//!     structure_order INTEGER,
//!     structure_type TEXT
//! );
//!
//! CREATE TABLE embeddings (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     chunk_id INTEGER UNIQUE NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
//!     label INTEGER UNIQUE NOT NULL,   -- point in the ANN index
//!     created_at INTEGER NOT NULL
//! );
//!
//! CREATE TABLE metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//! ```
//!
//! Deleting or re-hashing a file cascades to its chunks and their embedding
//! rows. The ANN points those rows referenced stay behind as stale labels:
//! search skips them, and the vector store rebuilds the index once too many
//! accumulate (see [`FileIndex::relabel_embeddings`]).

use super::{
    ChunkContext, ChunkId, ChunkRecord, EmbeddingRecord, FileId, FileRecord, FileRef, IndexStats,
    Label, LabelHit, NewChunk,
};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const CHUNK_COLUMNS: &str = "id, file_id, content, start_offset, end_offset, token_count, \
     parent_structure_id, structure_order, structure_type";

const FILE_COLUMNS: &str = "id, path, content_hash, modified_at, language, is_indexed, size";

/// SQLite-backed store for files, chunks and embedding rows.
#[derive(Clone, Debug)]
pub struct FileIndex {
    pool: SqlitePool,
}

impl FileIndex {
    /// Opens (creating if needed) the database at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(db_path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
                .create_if_missing(true)
                .optimize_on_close(true, 1 << 10),
        )
        .await?;
        Self::new_with_pool(pool).await
    }

    /// In-memory database for tests. One connection, so every query sees the same data.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true))
            .await?;
        Self::new_with_pool(pool).await
    }

    async fn new_with_pool(pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT UNIQUE NOT NULL,
                content_hash TEXT NOT NULL,
                modified_at INTEGER NOT NULL,
                language TEXT,
                is_indexed INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL,
                indexed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                token_count INTEGER NOT NULL,
                parent_structure_id TEXT,
                structure_order INTEGER,
                structure_type TEXT,
                FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chunk_id INTEGER UNIQUE NOT NULL,
                label INTEGER UNIQUE NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id, start_offset)")
            .execute(pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunks_structure ON chunks(file_id, parent_structure_id)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Creates or updates the row for `file.path` and returns its id.
    ///
    /// If the stored hash differs, the file's chunks (and their embedding rows)
    /// are deleted and the file is marked unindexed.
    pub async fn upsert_file(&self, file: &FileRef) -> Result<FileId> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT id, content_hash FROM files WHERE path = ?1")
            .bind(&file.path)
            .fetch_optional(&mut *tx)
            .await?;

        let id = match existing {
            Some(row) => {
                let id: i64 = row.get("id");
                let stored_hash: String = row.get("content_hash");
                let changed = stored_hash != file.content_hash;
                if changed {
                    let removed = sqlx::query("DELETE FROM chunks WHERE file_id = ?1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                    debug!(
                        "Content of {} changed, dropped {} stale chunks",
                        file.path,
                        removed.rows_affected()
                    );
                }
                sqlx::query(
                    r#"
                    UPDATE files SET
                        content_hash = ?1,
                        modified_at = ?2,
                        language = ?3,
                        size = ?4,
                        is_indexed = CASE WHEN ?5 THEN 0 ELSE is_indexed END,
                        indexed_at = datetime('now')
                    WHERE id = ?6
                    "#,
                )
                .bind(&file.content_hash)
                .bind(file.modified_at)
                .bind(&file.language)
                .bind(file.size)
                .bind(changed)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                id
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO files (path, content_hash, modified_at, language, size)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                )
                .bind(&file.path)
                .bind(&file.content_hash)
                .bind(file.modified_at)
                .bind(&file.language)
                .bind(file.size)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid()
            }
        };

        tx.commit().await?;
        Ok(id)
    }

    /// True when `path` is unknown, was never fully indexed, or its content hash changed.
    pub async fn file_needs_reindex(&self, path: &str, content_hash: &str) -> Result<bool> {
        let row = sqlx::query("SELECT content_hash, is_indexed FROM files WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => {
                let stored: String = row.get("content_hash");
                let indexed: bool = row.get("is_indexed");
                stored != content_hash || !indexed
            }
            None => true,
        })
    }

    pub async fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files WHERE path = ?1"))
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| file_from_row(&row)))
    }

    pub async fn list_files(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files ORDER BY path"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(file_from_row).collect())
    }

    pub async fn mark_file_indexed(&self, file_id: FileId, indexed: bool) -> Result<()> {
        sqlx::query("UPDATE files SET is_indexed = ?1 WHERE id = ?2")
            .bind(indexed)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks every file unindexed so the next pass re-embeds it. Returns rows touched.
    pub async fn mark_all_unindexed(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE files SET is_indexed = 0 WHERE is_indexed != 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes a file with its chunks and embedding rows. Returns whether it existed.
    pub async fn delete_file(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replaces all chunks of a file in one transaction, returning the new ids in input order.
    pub async fn replace_chunks(&self, file_id: FileId, chunks: &[NewChunk]) -> Result<Vec<ChunkId>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE file_id = ?1")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let id = sqlx::query(
                r#"
                INSERT INTO chunks (file_id, content, start_offset, end_offset, token_count,
                                    parent_structure_id, structure_order, structure_type)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(file_id)
            .bind(&chunk.content)
            .bind(chunk.start_offset as i64)
            .bind(chunk.end_offset as i64)
            .bind(chunk.token_count as i64)
            .bind(&chunk.parent_structure_id)
            .bind(chunk.structure_order.map(i64::from))
            .bind(&chunk.structure_type)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    pub async fn get_chunk(&self, id: ChunkId) -> Result<Option<ChunkRecord>> {
        let row = sqlx::query(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| chunk_from_row(&row)))
    }

    pub async fn get_file_chunks(&self, file_id: FileId) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE file_id = ?1 ORDER BY start_offset"
        ))
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    /// Fragments of one split structure, ordered by `structure_order`.
    pub async fn get_structure_siblings(
        &self,
        file_id: FileId,
        structure_id: &str,
    ) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE file_id = ?1 AND parent_structure_id = ?2
             ORDER BY structure_order, start_offset"
        ))
        .bind(file_id)
        .bind(structure_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    /// Up to `window` chunks before and after `chunk_id` in its file, ordered by offset.
    /// The chunk itself is not included.
    pub async fn get_adjacent_chunks(
        &self,
        file_id: FileId,
        chunk_id: ChunkId,
        window: usize,
    ) -> Result<Vec<ChunkRecord>> {
        if window == 0 {
            return Ok(Vec::new());
        }
        let Some(anchor) = self.get_chunk(chunk_id).await? else {
            return Ok(Vec::new());
        };

        let before = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE file_id = ?1 AND id != ?2 AND start_offset < ?3
             ORDER BY start_offset DESC LIMIT ?4"
        ))
        .bind(file_id)
        .bind(chunk_id)
        .bind(anchor.start_offset as i64)
        .bind(window as i64)
        .fetch_all(&self.pool)
        .await?;

        let after = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE file_id = ?1 AND id != ?2 AND start_offset > ?3
             ORDER BY start_offset ASC LIMIT ?4"
        ))
        .bind(file_id)
        .bind(chunk_id)
        .bind(anchor.start_offset as i64)
        .bind(window as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut chunks: Vec<ChunkRecord> = before.iter().rev().map(chunk_from_row).collect();
        chunks.extend(after.iter().map(chunk_from_row));
        Ok(chunks)
    }

    /// Records (chunk, label) pairs in one transaction. A chunk that already had a
    /// label is pointed at the new one.
    pub async fn insert_embedding_records(&self, pairs: &[(ChunkId, Label)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for (chunk_id, label) in pairs {
            sqlx::query(
                r#"
                INSERT INTO embeddings (chunk_id, label, created_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    label = excluded.label,
                    created_at = excluded.created_at
                "#,
            )
            .bind(chunk_id)
            .bind(*label as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_embedding_record(&self, chunk_id: ChunkId) -> Result<Option<EmbeddingRecord>> {
        let row = sqlx::query(
            "SELECT id, chunk_id, label, created_at FROM embeddings WHERE chunk_id = ?1",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| EmbeddingRecord {
            id: row.get("id"),
            chunk_id: row.get("chunk_id"),
            label: row.get::<i64, _>("label") as Label,
            created_at: row.get("created_at"),
        }))
    }

    /// Resolves ANN labels to their chunk and file path. Unknown labels are absent
    /// from the returned map.
    pub async fn resolve_labels(&self, labels: &[Label]) -> Result<HashMap<Label, LabelHit>> {
        if labels.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = labels
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");

        let query = format!(
            "SELECT e.label, f.path AS file_path,
                    c.id, c.file_id, c.content, c.start_offset, c.end_offset, c.token_count,
                    c.parent_structure_id, c.structure_order, c.structure_type
             FROM embeddings e
             JOIN chunks c ON c.id = e.chunk_id
             JOIN files f ON f.id = c.file_id
             WHERE e.label IN ({placeholders})"
        );
        let mut query_builder = sqlx::query(&query);
        for label in labels {
            query_builder = query_builder.bind(*label as i64);
        }

        let rows = query_builder.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let label = row.get::<i64, _>("label") as Label;
                let hit = LabelHit {
                    label,
                    chunk: chunk_from_row(row),
                    file_path: row.get("file_path"),
                };
                (label, hit)
            })
            .collect())
    }

    /// Deletes embedding rows whose label is `>= len` and marks their files unindexed.
    /// Returns how many rows were removed.
    pub async fn purge_labels_from(&self, len: u64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE files SET is_indexed = 0
            WHERE id IN (
                SELECT c.file_id FROM embeddings e JOIN chunks c ON c.id = e.chunk_id
                WHERE e.label >= ?1
            )
            "#,
        )
        .bind(len as i64)
        .execute(&mut *tx)
        .await?;

        let removed = sqlx::query("DELETE FROM embeddings WHERE label >= ?1")
            .bind(len as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed)
    }

    /// Every (chunk, label) pair, ordered by label.
    pub async fn list_embedding_labels(&self) -> Result<Vec<(ChunkId, Label)>> {
        let rows = sqlx::query("SELECT chunk_id, label FROM embeddings ORDER BY label")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<ChunkId, _>("chunk_id"),
                    row.get::<i64, _>("label") as Label,
                )
            })
            .collect())
    }

    /// Moves every embedding row to the label given in `pairs`, in one transaction.
    /// Rows for chunks absent from `pairs` are deleted and their files marked unindexed.
    /// Returns how many rows were deleted.
    pub async fn relabel_embeddings(&self, pairs: &[(ChunkId, Label)]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        // Park current labels below zero so the new ones never collide with them
        sqlx::query("UPDATE embeddings SET label = -1 - label")
            .execute(&mut *tx)
            .await?;

        for (chunk_id, label) in pairs {
            sqlx::query("UPDATE embeddings SET label = ?1 WHERE chunk_id = ?2")
                .bind(*label as i64)
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            UPDATE files SET is_indexed = 0
            WHERE id IN (
                SELECT c.file_id FROM embeddings e JOIN chunks c ON c.id = e.chunk_id
                WHERE e.label < 0
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let removed = sqlx::query("DELETE FROM embeddings WHERE label < 0")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed)
    }

    /// Deletes every embedding row and chunk, keeping file rows (marked unindexed).
    pub async fn delete_all_chunks(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM embeddings").execute(&mut *tx).await?;
        let removed = sqlx::query("DELETE FROM chunks")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("UPDATE files SET is_indexed = 0")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar::<_, String>("SELECT value FROM metadata WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn delete_metadata(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM metadata WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Row counts. ANN fields are left for the caller to fill in.
    pub async fn stats(&self) -> Result<IndexStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM files) AS files_count,
                (SELECT COUNT(*) FROM files WHERE is_indexed != 0) AS indexed_files_count,
                (SELECT COUNT(*) FROM chunks) AS chunks_count,
                (SELECT COUNT(*) FROM embeddings) AS embeddings_count
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(IndexStats {
            files_count: row.get::<i64, _>("files_count") as usize,
            indexed_files_count: row.get::<i64, _>("indexed_files_count") as usize,
            chunks_count: row.get::<i64, _>("chunks_count") as usize,
            embeddings_count: row.get::<i64, _>("embeddings_count") as usize,
            ..IndexStats::default()
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ChunkContext for FileIndex {
    async fn structure_siblings(
        &self,
        file_id: FileId,
        structure_id: &str,
    ) -> Result<Vec<ChunkRecord>> {
        self.get_structure_siblings(file_id, structure_id).await
    }

    async fn adjacent_chunks(
        &self,
        file_id: FileId,
        chunk_id: ChunkId,
        window: usize,
    ) -> Result<Vec<ChunkRecord>> {
        self.get_adjacent_chunks(file_id, chunk_id, window).await
    }
}

fn file_from_row(row: &SqliteRow) -> FileRecord {
    FileRecord {
        id: row.get("id"),
        path: row.get("path"),
        content_hash: row.get("content_hash"),
        modified_at: row.get("modified_at"),
        language: row.get("language"),
        is_indexed: row.get("is_indexed"),
        size: row.get("size"),
    }
}

fn chunk_from_row(row: &SqliteRow) -> ChunkRecord {
    ChunkRecord {
        id: row.get("id"),
        file_id: row.get("file_id"),
        content: row.get("content"),
        start_offset: row.get::<i64, _>("start_offset") as usize,
        end_offset: row.get::<i64, _>("end_offset") as usize,
        token_count: row.get::<i64, _>("token_count") as usize,
        parent_structure_id: row.get("parent_structure_id"),
        structure_order: row
            .get::<Option<i64>, _>("structure_order")
            .map(|order| order as u32),
        structure_type: row.get("structure_type"),
    }
}
