//! In-memory vector index.
//!
//! A flat list of `(chunk, vector)` entries searched by brute-force cosine
//! distance. All vectors share one dimensionality fixed at construction.
//! Entries are only appended; removing a document rebuilds the index from
//! the surviving entries ([`VectorIndex::without_document`]).
//!
//! The index itself is not synchronized. The app crate wraps it in a
//! read-write lock together with its durable store.

use std::collections::{HashMap, HashSet};

use crate::embedding::cosine_distance;
use crate::error::RagError;
use crate::models::{Chunk, Passage};

/// A chunk and its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: Chunk,
    /// Cosine distance to the query, `1 - similarity`.
    pub distance: f32,
}

impl SearchHit {
    /// Similarity score, higher is closer.
    pub fn score(&self) -> f32 {
        1.0 - self.distance
    }

    pub fn into_passage(self) -> Passage {
        let score = self.score();
        Passage {
            chunk_id: self.chunk.id,
            document_id: self.chunk.document_id,
            text: self.chunk.text,
            score,
            page_start: self.chunk.page_start,
            page_end: self.chunk.page_end,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    dims: usize,
    model: String,
    entries: Vec<IndexEntry>,
    /// Chunk id to position in `entries`.
    positions: HashMap<String, usize>,
}

impl VectorIndex {
    pub fn new(dims: usize, model: impl Into<String>) -> Self {
        Self {
            dims,
            model: model.into(),
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embedding model the vectors came from.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Append one entry.
    ///
    /// # Errors
    ///
    /// [`RagError::DimensionMismatch`] if `vector.len() != dims`, and
    /// [`RagError::InvalidInput`] for a non-finite component or a duplicate
    /// chunk id.
    pub fn add(&mut self, chunk: Chunk, vector: Vec<f32>) -> Result<(), RagError> {
        self.check_vector(&vector)?;
        if self.contains(&chunk.id) {
            return Err(RagError::InvalidInput(format!(
                "chunk '{}' is already indexed",
                chunk.id
            )));
        }
        self.positions.insert(chunk.id.clone(), self.entries.len());
        self.entries.push(IndexEntry { chunk, vector });
        Ok(())
    }

    /// Append a batch of entries, or none of them if any is invalid.
    pub fn add_all(&mut self, entries: Vec<IndexEntry>) -> Result<(), RagError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            self.check_vector(&entry.vector)?;
            if self.contains(&entry.chunk.id) || !seen.insert(entry.chunk.id.as_str()) {
                return Err(RagError::InvalidInput(format!(
                    "chunk '{}' is already indexed",
                    entry.chunk.id
                )));
            }
        }
        for entry in entries {
            self.positions
                .insert(entry.chunk.id.clone(), self.entries.len());
            self.entries.push(entry);
        }
        Ok(())
    }

    /// Drop every entry past the first `len`. Used to roll back a failed
    /// insert.
    pub fn truncate(&mut self, len: usize) {
        for entry in self.entries.iter().skip(len) {
            self.positions.remove(&entry.chunk.id);
        }
        self.entries.truncate(len);
    }

    /// Up to `k` nearest entries, ascending by distance. Equal distances
    /// keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, RagError> {
        if query.len() != self.dims {
            return Err(RagError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, cosine_distance(query, &e.vector)))
            .collect();
        // Stable sort: ties stay in insertion order.
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, distance)| SearchHit {
                chunk: self.entries[i].chunk.clone(),
                distance,
            })
            .collect())
    }

    /// A new index holding every entry except those of `document_id`, in
    /// their original order.
    pub fn without_document(&self, document_id: &str) -> VectorIndex {
        let mut rebuilt = VectorIndex::new(self.dims, self.model.clone());
        for entry in self
            .entries
            .iter()
            .filter(|e| e.chunk.document_id != document_id)
        {
            rebuilt
                .positions
                .insert(entry.chunk.id.clone(), rebuilt.entries.len());
            rebuilt.entries.push(entry.clone());
        }
        rebuilt
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.positions.contains_key(chunk_id)
    }

    pub fn chunk(&self, chunk_id: &str) -> Option<&Chunk> {
        self.positions
            .get(chunk_id)
            .map(|&i| &self.entries[i].chunk)
    }

    /// Number of entries belonging to `document_id`.
    pub fn count_for_document(&self, document_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.chunk.document_id == document_id)
            .count()
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), RagError> {
        if vector.len() != self.dims {
            return Err(RagError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(RagError::InvalidInput(
                "vector contains a non-finite component".to_string(),
            ));
        }
        Ok(())
    }
}
