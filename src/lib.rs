//! # Local RAG
//!
//! A local retrieval-augmented generation service: upload documents, then
//! ask questions answered by a local language model grounded in the most
//! relevant passages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────┐   ┌──────────────┐
//! │  Loader  │──▶│ Chunker │──▶│ Embedder │──▶│ Vector Index │◀─┐
//! │ PDF/text │   └─────────┘   └──────────┘   │  + SQLite    │  │
//! └──────────┘                                └──────┬───────┘  │
//!                                                    │ top-k    │ query
//!                     ┌──────────┐   ┌──────────┐    ▼          │ vector
//!   session history ─▶│ Composer │──▶│Generator │◀── passages ──┘
//!                     └──────────┘   └──────────┘
//! ```
//!
//! Pure logic (tokenizer, chunker, in-memory index, prompt composer,
//! sessions, errors) lives in the `local-rag-core` crate. This crate adds
//! I/O: document extraction, SQLite persistence, model backends, locking,
//! the HTTP server, and the CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! rag init                           # create the index store
//! rag ingest ./handbook.pdf          # chunk, embed, and index a document
//! rag ask "What is the refund policy?"
//! rag serve                          # start the HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`loader`] | Document type detection and text extraction |
//! | [`store`] | SQLite persistence of the vector index |
//! | [`shared_index`] | Single-writer/multi-reader lock around index + store |
//! | [`providers`] | Concrete embedders (hash, Ollama, fastembed) |
//! | [`generator`] | Generation model trait and backends |
//! | [`services`] | The embedder/generator pair shared by all requests |
//! | [`pipeline`] | Ingestion, retrieval, and the question-answering path |
//! | [`metrics`] | Prometheus registry |
//! | [`server`] | HTTP server |
//! | [`commands`] | CLI command implementations |

pub mod commands;
pub mod config;
pub mod generator;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod services;
pub mod shared_index;
pub mod store;

pub use local_rag_core::error::RagError;
