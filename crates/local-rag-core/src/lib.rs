//! # Local RAG Core
//!
//! Pure logic for the local retrieval-augmented generation pipeline:
//! tokenizing, chunking, the embedder trait, the in-memory vector index,
//! prompt composition, and session history.
//!
//! This crate does no filesystem, network, or database I/O. Persistence,
//! model backends, and the HTTP surface live in the `local-rag` crate.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`tokenize`] | Deterministic word-boundary tokenizer |
//! | [`models`] | `Chunk`, `ExtractedText`, `Turn`, `Passage` |
//! | [`chunk`] | Sliding-window chunker |
//! | [`embedding`] | `Embedder` trait, hash embedder, vector helpers |
//! | [`index`] | Brute-force cosine vector index |
//! | [`prompt`] | Budgeted prompt composer |
//! | [`session`] | Bounded per-session history |
//! | [`error`] | `RagError` taxonomy |

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod prompt;
pub mod session;
pub mod tokenize;
