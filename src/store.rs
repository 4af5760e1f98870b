//! Durable storage for the vector index.
//!
//! Vectors, the chunk map (chunk id → document and text span), and
//! document records live in one SQLite file, so every write commits them
//! together in a single transaction:
//!
//! ```text
//! index_meta(key, value)             dims, model, format_version
//! documents(id, session_id, ...)     one row per ingested document
//! chunks(seq, id, ..., vector BLOB)  one row per index entry, seq = insertion order
//! ```
//!
//! Loading is forgiving. A missing file, a file SQLite cannot read, rows
//! that fail validation, or vectors from a different model or dimension
//! all produce an empty index and a [`LoadStatus::Reset`] carrying the
//! reason. An unreadable file is first moved aside to
//! `<name>.corrupt-<timestamp>` so nothing is overwritten.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info, warn};

use local_rag_core::embedding::{blob_to_vec, vec_to_blob};
use local_rag_core::error::RagError;
use local_rag_core::index::{IndexEntry, VectorIndex};
use local_rag_core::models::Chunk;

const FORMAT_VERSION: &str = "1";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata for one ingested document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub session_id: String,
    pub filename: String,
    /// `"pdf"` or `"text"`.
    pub kind: String,
    /// SHA-256 of the uploaded bytes.
    pub content_hash: String,
    pub pages: usize,
    pub chunk_count: usize,
    /// Unix seconds.
    pub ingested_at: i64,
}

/// How [`IndexStore::open_and_load`] obtained its index.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Loaded { entries: usize, documents: usize },
    /// The persisted index was missing or unusable and an empty one was
    /// started instead.
    Reset { reason: String },
}

impl LoadStatus {
    pub fn is_reset(&self) -> bool {
        matches!(self, LoadStatus::Reset { .. })
    }
}

#[derive(Debug)]
pub struct LoadedIndex {
    pub index: VectorIndex,
    pub documents: Vec<DocumentRecord>,
    pub status: LoadStatus,
}

/// Handle on the SQLite file backing one index.
#[derive(Debug, Clone)]
pub struct IndexStore {
    path: PathBuf,
    pool: SqlitePool,
}

impl IndexStore {
    /// Open the store at `path` and load its index.
    ///
    /// Only fails when a fresh store cannot be created at `path`; every
    /// problem with existing contents is reported through
    /// [`LoadStatus::Reset`].
    pub async fn open_and_load(
        path: &Path,
        dims: usize,
        model: &str,
    ) -> Result<(IndexStore, LoadedIndex), RagError> {
        if !path.exists() {
            let store = Self::create(path, dims, model).await?;
            let reason = format!("no persisted index at {}", path.display());
            info!(path = %path.display(), "starting with an empty index");
            return Ok((store, reset(dims, model, reason)));
        }

        let pool = match connect(path).await {
            Ok(pool) => pool,
            Err(e) => return Self::recover(path, dims, model, e.to_string()).await,
        };
        match load_from(&pool, dims, model).await {
            Ok(loaded) => {
                debug!(
                    entries = loaded.index.len(),
                    documents = loaded.documents.len(),
                    "loaded persisted index"
                );
                Ok((
                    IndexStore {
                        path: path.to_path_buf(),
                        pool,
                    },
                    loaded,
                ))
            }
            Err(e) => {
                pool.close().await;
                Self::recover(path, dims, model, e.to_string()).await
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a full snapshot of `index` and `documents`, replacing whatever
    /// was stored. Used after a rebuild.
    pub async fn persist(
        &self,
        index: &VectorIndex,
        documents: &[DocumentRecord],
    ) -> Result<(), RagError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query("DELETE FROM chunks")
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM documents")
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        write_meta(&mut tx, index.dims(), index.model()).await?;
        for doc in documents {
            insert_document(&mut tx, doc).await?;
        }
        for (seq, entry) in index.entries().iter().enumerate() {
            insert_chunk(&mut tx, seq, &entry.chunk, &entry.vector).await?;
        }

        tx.commit().await.map_err(storage)?;
        debug!(
            entries = index.len(),
            documents = documents.len(),
            "persisted index snapshot"
        );
        Ok(())
    }

    /// Append one document and its entries. `first_seq` is the index
    /// length before the entries were added.
    pub async fn append(
        &self,
        document: &DocumentRecord,
        first_seq: usize,
        entries: &[IndexEntry],
    ) -> Result<(), RagError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        insert_document(&mut tx, document).await?;
        for (i, entry) in entries.iter().enumerate() {
            insert_chunk(&mut tx, first_seq + i, &entry.chunk, &entry.vector).await?;
        }
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    /// File size in bytes, 0 if unknown.
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create(path: &Path, dims: usize, model: &str) -> Result<IndexStore, RagError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RagError::Storage(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        let pool = connect(path).await.map_err(storage)?;
        migrate(&pool).await?;
        let mut tx = pool.begin().await.map_err(storage)?;
        write_meta(&mut tx, dims, model).await?;
        tx.commit().await.map_err(storage)?;
        Ok(IndexStore {
            path: path.to_path_buf(),
            pool,
        })
    }

    async fn recover(
        path: &Path,
        dims: usize,
        model: &str,
        reason: String,
    ) -> Result<(IndexStore, LoadedIndex), RagError> {
        let moved = quarantine(path)?;
        warn!(
            path = %path.display(),
            moved_to = %moved.display(),
            reason = %reason,
            "persisted index unusable, moved aside"
        );
        let store = Self::create(path, dims, model).await?;
        let reason = format!("{} (previous store moved to {})", reason, moved.display());
        Ok((store, reset(dims, model, reason)))
    }
}

fn reset(dims: usize, model: &str, reason: String) -> LoadedIndex {
    LoadedIndex {
        index: VectorIndex::new(dims, model),
        documents: Vec::new(),
        status: LoadStatus::Reset { reason },
    }
}

async fn connect(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
}

async fn migrate(pool: &SqlitePool) -> Result<(), RagError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(storage)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            kind TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            pages INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(storage)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            seq INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,
            document_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_byte INTEGER NOT NULL,
            end_byte INTEGER NOT NULL,
            token_count INTEGER NOT NULL,
            overlap_tokens INTEGER NOT NULL,
            overlap_bytes INTEGER NOT NULL,
            page_start INTEGER NOT NULL,
            page_end INTEGER NOT NULL,
            hash TEXT NOT NULL,
            vector BLOB NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(storage)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await
        .map_err(storage)?;

    Ok(())
}

async fn load_from(pool: &SqlitePool, dims: usize, model: &str) -> Result<LoadedIndex, RagError> {
    let check: String = sqlx::query_scalar("PRAGMA quick_check")
        .fetch_one(pool)
        .await
        .map_err(corruption)?;
    if check != "ok" {
        return Err(RagError::IndexCorruption(format!(
            "integrity check failed: {}",
            check
        )));
    }

    migrate(pool).await.map_err(|e| RagError::IndexCorruption(e.to_string()))?;

    let mut meta: HashMap<String, String> = HashMap::new();
    for row in sqlx::query("SELECT key, value FROM index_meta")
        .fetch_all(pool)
        .await
        .map_err(corruption)?
    {
        let key: String = row.try_get("key").map_err(corruption)?;
        let value: String = row.try_get("value").map_err(corruption)?;
        meta.insert(key, value);
    }

    let documents = load_documents(pool).await?;
    let rows = sqlx::query(
        r#"
        SELECT id, document_id, ordinal, text, start_byte, end_byte, token_count,
               overlap_tokens, overlap_bytes, page_start, page_end, hash, vector
        FROM chunks
        ORDER BY seq
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(corruption)?;

    if meta.is_empty() {
        if !rows.is_empty() || !documents.is_empty() {
            return Err(RagError::IndexCorruption(
                "index metadata missing but entries present".to_string(),
            ));
        }
        let mut tx = pool.begin().await.map_err(storage)?;
        write_meta(&mut tx, dims, model).await?;
        tx.commit().await.map_err(storage)?;
        return Ok(LoadedIndex {
            index: VectorIndex::new(dims, model),
            documents,
            status: LoadStatus::Loaded {
                entries: 0,
                documents: 0,
            },
        });
    }

    if let Some(version) = meta.get("format_version") {
        if version != FORMAT_VERSION {
            return Err(RagError::IndexCorruption(format!(
                "unsupported index format version {}",
                version
            )));
        }
    }
    let stored_dims: usize = meta
        .get("dims")
        .and_then(|d| d.parse().ok())
        .ok_or_else(|| RagError::IndexCorruption("index dims missing".to_string()))?;
    if stored_dims != dims {
        return Err(RagError::IndexCorruption(format!(
            "stored vectors have {} dimensions, the embedder produces {}",
            stored_dims, dims
        )));
    }
    let stored_model = meta.get("model").map(String::as_str).unwrap_or_default();
    if stored_model != model {
        return Err(RagError::IndexCorruption(format!(
            "stored vectors come from model '{}', the embedder is '{}'",
            stored_model, model
        )));
    }

    let mut index = VectorIndex::new(dims, model);
    for row in rows {
        let (chunk, vector) = decode_chunk(&row)?;
        index.add(chunk, vector).map_err(|e| match e {
            RagError::IndexCorruption(_) => e,
            other => RagError::IndexCorruption(other.to_string()),
        })?;
    }

    for doc in &documents {
        let stored = index.count_for_document(&doc.id);
        if stored != doc.chunk_count {
            return Err(RagError::IndexCorruption(format!(
                "document {} records {} chunks but {} are stored",
                doc.id, doc.chunk_count, stored
            )));
        }
    }
    let total: usize = documents.iter().map(|d| d.chunk_count).sum();
    if total != index.len() {
        return Err(RagError::IndexCorruption(format!(
            "{} entries belong to no recorded document",
            index.len().saturating_sub(total)
        )));
    }

    let status = LoadStatus::Loaded {
        entries: index.len(),
        documents: documents.len(),
    };
    Ok(LoadedIndex {
        index,
        documents,
        status,
    })
}

async fn load_documents(pool: &SqlitePool) -> Result<Vec<DocumentRecord>, RagError> {
    let rows = sqlx::query(
        r#"
        SELECT id, session_id, filename, kind, content_hash, pages, chunk_count, ingested_at
        FROM documents
        ORDER BY ingested_at, rowid
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(corruption)?;

    rows.iter()
        .map(|row| {
            Ok(DocumentRecord {
                id: row.try_get("id")?,
                session_id: row.try_get("session_id")?,
                filename: row.try_get("filename")?,
                kind: row.try_get("kind")?,
                content_hash: row.try_get("content_hash")?,
                pages: get_usize(row, "pages")?,
                chunk_count: get_usize(row, "chunk_count")?,
                ingested_at: row.try_get("ingested_at")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(corruption)
}

fn decode_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<(Chunk, Vec<f32>), RagError> {
    let decode = || -> Result<(Chunk, Vec<u8>), sqlx::Error> {
        let chunk = Chunk {
            id: row.try_get("id")?,
            document_id: row.try_get("document_id")?,
            ordinal: get_usize(row, "ordinal")?,
            text: row.try_get("text")?,
            start_byte: get_usize(row, "start_byte")?,
            end_byte: get_usize(row, "end_byte")?,
            token_count: get_usize(row, "token_count")?,
            overlap_tokens: get_usize(row, "overlap_tokens")?,
            overlap_bytes: get_usize(row, "overlap_bytes")?,
            page_start: get_usize(row, "page_start")?,
            page_end: get_usize(row, "page_end")?,
            hash: row.try_get("hash")?,
        };
        let blob: Vec<u8> = row.try_get("vector")?;
        Ok((chunk, blob))
    };
    let (chunk, blob) = decode().map_err(corruption)?;
    let vector = blob_to_vec(&blob).ok_or_else(|| {
        RagError::IndexCorruption(format!("vector for chunk {} is truncated", chunk.id))
    })?;
    if chunk.overlap_bytes > chunk.text.len() || !chunk.text.is_char_boundary(chunk.overlap_bytes) {
        return Err(RagError::IndexCorruption(format!(
            "chunk {} has an invalid overlap span",
            chunk.id
        )));
    }
    Ok((chunk, vector))
}

fn get_usize(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<usize, sqlx::Error> {
    let value: i64 = row.try_get(column)?;
    usize::try_from(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

async fn write_meta(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    dims: usize,
    model: &str,
) -> Result<(), RagError> {
    for (key, value) in [
        ("format_version", FORMAT_VERSION.to_string()),
        ("dims", dims.to_string()),
        ("model", model.to_string()),
    ] {
        sqlx::query(
            "INSERT INTO index_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await
        .map_err(storage)?;
    }
    Ok(())
}

async fn insert_document(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    doc: &DocumentRecord,
) -> Result<(), RagError> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, session_id, filename, kind, content_hash, pages, chunk_count, ingested_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.session_id)
    .bind(&doc.filename)
    .bind(&doc.kind)
    .bind(&doc.content_hash)
    .bind(doc.pages as i64)
    .bind(doc.chunk_count as i64)
    .bind(doc.ingested_at)
    .execute(&mut **tx)
    .await
    .map_err(storage)?;
    Ok(())
}

async fn insert_chunk(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    seq: usize,
    chunk: &Chunk,
    vector: &[f32],
) -> Result<(), RagError> {
    sqlx::query(
        r#"
        INSERT INTO chunks (seq, id, document_id, ordinal, text, start_byte, end_byte,
                            token_count, overlap_tokens, overlap_bytes, page_start, page_end,
                            hash, vector)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(seq as i64)
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(chunk.ordinal as i64)
    .bind(&chunk.text)
    .bind(chunk.start_byte as i64)
    .bind(chunk.end_byte as i64)
    .bind(chunk.token_count as i64)
    .bind(chunk.overlap_tokens as i64)
    .bind(chunk.overlap_bytes as i64)
    .bind(chunk.page_start as i64)
    .bind(chunk.page_end as i64)
    .bind(&chunk.hash)
    .bind(vec_to_blob(vector))
    .execute(&mut **tx)
    .await
    .map_err(storage)?;
    Ok(())
}

/// Move `path` and its WAL sidecars to `<path>.corrupt-<timestamp>`.
fn quarantine(path: &Path) -> Result<PathBuf, RagError> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let target = PathBuf::from(format!("{}.corrupt-{}", path.display(), stamp));
    std::fs::rename(path, &target).map_err(|e| {
        RagError::Storage(format!("cannot move {} aside: {}", path.display(), e))
    })?;
    for suffix in ["-wal", "-shm"] {
        let sidecar = PathBuf::from(format!("{}{}", path.display(), suffix));
        if sidecar.exists() {
            let _ = std::fs::rename(&sidecar, format!("{}{}", target.display(), suffix));
        }
    }
    Ok(target)
}

fn storage(e: sqlx::Error) -> RagError {
    RagError::Storage(e.to_string())
}

fn corruption(e: sqlx::Error) -> RagError {
    RagError::IndexCorruption(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use local_rag_core::chunk::chunk_pages;
    use local_rag_core::embedding::HashEmbedder;
    use tempfile::TempDir;

    const DIMS: usize = 64;

    fn record(id: &str, chunk_count: usize) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            session_id: "s1".to_string(),
            filename: format!("{}.txt", id),
            kind: "text".to_string(),
            content_hash: "00".to_string(),
            pages: 1,
            chunk_count,
            ingested_at: 1_700_000_000,
        }
    }

    fn entries(doc: &str, text: &str) -> Vec<IndexEntry> {
        let embedder = HashEmbedder::new(DIMS);
        chunk_pages(doc, &[text.to_string()], 5, 1)
            .unwrap()
            .chunks
            .into_iter()
            .map(|chunk| {
                let vector = embedder.embed_sync(&chunk.text);
                IndexEntry { chunk, vector }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_missing_store_is_reported_as_reset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data").join("index.sqlite");
        let (_store, loaded) = IndexStore::open_and_load(&path, DIMS, "m").await.unwrap();
        assert!(loaded.status.is_reset());
        assert!(loaded.index.is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_append_then_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        let (store, mut loaded) = IndexStore::open_and_load(&path, DIMS, "m").await.unwrap();

        let new = entries("doc-a", "alpha beta gamma delta epsilon zeta eta theta iota kappa");
        let first_seq = loaded.index.len();
        loaded.index.add_all(new.clone()).unwrap();
        store
            .append(&record("doc-a", new.len()), first_seq, &new)
            .await
            .unwrap();
        store.close().await;

        let (_store, reloaded) = IndexStore::open_and_load(&path, DIMS, "m").await.unwrap();
        assert_eq!(
            reloaded.status,
            LoadStatus::Loaded {
                entries: new.len(),
                documents: 1
            }
        );
        assert_eq!(reloaded.index.entries(), loaded.index.entries());
        assert_eq!(reloaded.documents[0].id, "doc-a");
    }

    #[tokio::test]
    async fn test_garbage_file_is_moved_aside() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        std::fs::write(&path, b"this is definitely not a sqlite database, just junk bytes")
            .unwrap();

        let (_store, loaded) = IndexStore::open_and_load(&path, DIMS, "m").await.unwrap();
        assert!(loaded.status.is_reset());
        assert!(loaded.index.is_empty());

        let quarantined = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(quarantined);
    }

    #[tokio::test]
    async fn test_dimension_change_resets() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        let (store, mut loaded) = IndexStore::open_and_load(&path, DIMS, "m").await.unwrap();
        let new = entries("doc-a", "one two three four five six");
        loaded.index.add_all(new.clone()).unwrap();
        store
            .persist(&loaded.index, &[record("doc-a", new.len())])
            .await
            .unwrap();
        store.close().await;

        let (_store, reloaded) = IndexStore::open_and_load(&path, 32, "m").await.unwrap();
        match reloaded.status {
            LoadStatus::Reset { reason } => assert!(reason.contains("dimensions")),
            other => panic!("expected reset, got {other:?}"),
        }
        assert_eq!(reloaded.index.dims(), 32);
    }

    #[tokio::test]
    async fn test_snapshot_replaces_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        let (store, mut loaded) = IndexStore::open_and_load(&path, DIMS, "m").await.unwrap();
        let a = entries("doc-a", "red green blue cyan magenta yellow");
        let b = entries("doc-b", "north south east west up down");
        loaded.index.add_all(a.clone()).unwrap();
        loaded.index.add_all(b.clone()).unwrap();
        store
            .persist(
                &loaded.index,
                &[record("doc-a", a.len()), record("doc-b", b.len())],
            )
            .await
            .unwrap();

        let rebuilt = loaded.index.without_document("doc-a");
        store
            .persist(&rebuilt, &[record("doc-b", b.len())])
            .await
            .unwrap();
        store.close().await;

        let (_store, reloaded) = IndexStore::open_and_load(&path, DIMS, "m").await.unwrap();
        assert_eq!(reloaded.index.len(), b.len());
        assert_eq!(reloaded.index.count_for_document("doc-a"), 0);
        assert_eq!(reloaded.documents.len(), 1);
    }
}
