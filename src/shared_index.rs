//! The process-wide vector index and its lock discipline.
//!
//! One [`SharedIndex`] owns the in-memory [`VectorIndex`], the document
//! records, and the [`IndexStore`] behind a single `tokio::sync::RwLock`:
//!
//! - Mutations (insert, delete) take the write lock and hold it across the
//!   in-memory change *and* the durable write, so no reader ever sees an
//!   entry that is not yet persisted or a half-applied rebuild.
//! - Searches take the read lock and run concurrently with each other.
//!
//! Readers that find a write in progress back off exponentially and retry
//! a bounded number of times before failing with [`RagError::IndexBusy`].
//! Writers wait for the same total budget.

use std::time::Duration;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use local_rag_core::error::RagError;
use local_rag_core::index::{IndexEntry, SearchHit, VectorIndex};

use crate::config::LockingConfig;
use crate::store::{DocumentRecord, IndexStore, LoadStatus};

const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded retry schedule for lock acquisition.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl LockPolicy {
    /// Delay before retry `attempt` (0-based): `backoff * 2^attempt`,
    /// capped at one second.
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(MAX_BACKOFF)
    }

    /// Sum of every retry delay.
    pub fn total_wait(&self) -> Duration {
        (0..self.max_retries).map(|a| self.delay(a)).sum()
    }
}

impl From<&LockingConfig> for LockPolicy {
    fn from(config: &LockingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// Everything guarded by the index lock.
#[derive(Debug)]
pub struct IndexState {
    pub index: VectorIndex,
    pub documents: Vec<DocumentRecord>,
}

/// Point-in-time summary for `stats` and `/api/config`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub entries: usize,
    pub documents: usize,
    pub dims: usize,
    pub model: String,
    pub path: String,
    pub size_bytes: u64,
}

pub struct SharedIndex {
    state: RwLock<IndexState>,
    store: IndexStore,
    policy: LockPolicy,
    load_status: LoadStatus,
}

impl SharedIndex {
    /// Open (or create) the persisted index at `path`.
    ///
    /// A missing or unusable store yields an empty index; the condition is
    /// logged at `warn` and kept in [`SharedIndex::load_status`].
    pub async fn open(
        path: &std::path::Path,
        dims: usize,
        model: &str,
        policy: LockPolicy,
    ) -> Result<Self, RagError> {
        let (store, loaded) = IndexStore::open_and_load(path, dims, model).await?;
        match &loaded.status {
            LoadStatus::Loaded { entries, documents } => {
                info!(entries, documents, path = %path.display(), "index loaded");
            }
            LoadStatus::Reset { reason } => {
                warn!(reason = %reason, path = %path.display(), "index reset to empty");
            }
        }
        Ok(Self {
            state: RwLock::new(IndexState {
                index: loaded.index,
                documents: loaded.documents,
            }),
            store,
            policy,
            load_status: loaded.status,
        })
    }

    pub fn load_status(&self) -> &LoadStatus {
        &self.load_status
    }

    /// Acquire the read lock, retrying with backoff while a write holds it.
    pub async fn read(&self) -> Result<RwLockReadGuard<'_, IndexState>, RagError> {
        let attempts = self.policy.max_retries + 1;
        for attempt in 0..attempts {
            if let Ok(guard) = self.state.try_read() {
                return Ok(guard);
            }
            if attempt + 1 < attempts {
                let delay = self.policy.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "index locked, retrying read");
                tokio::time::sleep(delay).await;
            }
        }
        warn!(attempts, "index read lock not acquired");
        Err(RagError::IndexBusy { attempts })
    }

    async fn write(&self) -> Result<RwLockWriteGuard<'_, IndexState>, RagError> {
        let budget = self.policy.total_wait();
        match tokio::time::timeout(budget, self.state.write()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                warn!(wait_ms = budget.as_millis() as u64, "index write lock not acquired");
                Err(RagError::IndexBusy {
                    attempts: self.policy.max_retries + 1,
                })
            }
        }
    }

    /// Nearest `k` entries to `query`.
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, RagError> {
        let state = self.read().await?;
        state.index.search(query, k)
    }

    /// Add a document's entries and persist them as one unit.
    ///
    /// Either every entry becomes searchable and durable, or none does:
    /// a failed durable write rolls the in-memory index back before the
    /// lock is released.
    pub async fn insert_document(
        &self,
        record: DocumentRecord,
        entries: Vec<IndexEntry>,
    ) -> Result<usize, RagError> {
        let mut state = self.write().await?;
        let before = state.index.len();
        let count = entries.len();

        state.index.add_all(entries)?;
        let appended = &state.index.entries()[before..];
        if let Err(e) = self.store.append(&record, before, appended).await {
            state.index.truncate(before);
            warn!(document_id = %record.id, error = %e, "persist failed, insert rolled back");
            return Err(e);
        }
        state.documents.push(record);
        Ok(count)
    }

    /// Remove a document by rebuilding the index without it.
    ///
    /// The rebuilt index is persisted first and swapped in only after the
    /// write succeeds. Returns the number of entries removed.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize, RagError> {
        let mut state = self.write().await?;
        if !state.documents.iter().any(|d| d.id == document_id) {
            return Err(RagError::DocumentNotFound(document_id.to_string()));
        }

        let rebuilt = state.index.without_document(document_id);
        let documents: Vec<DocumentRecord> = state
            .documents
            .iter()
            .filter(|d| d.id != document_id)
            .cloned()
            .collect();
        self.store.persist(&rebuilt, &documents).await?;

        let removed = state.index.len() - rebuilt.len();
        state.index = rebuilt;
        state.documents = documents;
        Ok(removed)
    }

    pub async fn documents(&self) -> Result<Vec<DocumentRecord>, RagError> {
        Ok(self.read().await?.documents.clone())
    }

    pub async fn stats(&self) -> Result<IndexStats, RagError> {
        let state = self.read().await?;
        Ok(IndexStats {
            entries: state.index.len(),
            documents: state.documents.len(),
            dims: state.index.dims(),
            model: state.index.model().to_string(),
            path: self.store.path().display().to_string(),
            size_bytes: self.store.size_bytes(),
        })
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = LockPolicy {
            max_retries: 8,
            backoff: Duration::from_millis(25),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(25));
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(3), Duration::from_millis(200));
        assert_eq!(policy.delay(10), MAX_BACKOFF);
        assert_eq!(policy.total_wait(), Duration::from_millis(25 + 50 + 100 + 200 + 400 + 800 + 1000 + 1000));
    }

    #[tokio::test]
    async fn test_read_reports_busy_when_write_held() {
        let tmp = tempfile::TempDir::new().unwrap();
        let index = SharedIndex::open(
            &tmp.path().join("index.sqlite"),
            8,
            "m",
            LockPolicy {
                max_retries: 2,
                backoff: Duration::from_millis(1),
            },
        )
        .await
        .unwrap();

        let _writer = index.state.write().await;
        let err = index.read().await.unwrap_err();
        assert_eq!(err, RagError::IndexBusy { attempts: 3 });
    }

    #[tokio::test]
    async fn test_delete_unknown_document() {
        let tmp = tempfile::TempDir::new().unwrap();
        let index = SharedIndex::open(
            &tmp.path().join("index.sqlite"),
            8,
            "m",
            LockPolicy {
                max_retries: 2,
                backoff: Duration::from_millis(1),
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            index.delete_document("nope").await,
            Err(RagError::DocumentNotFound(_))
        ));
    }
}
