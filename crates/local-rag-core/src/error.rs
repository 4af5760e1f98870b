//! Error taxonomy for the retrieval-augmented pipeline.
//!
//! Errors fall into three families:
//! - **ingestion input**: [`RagError::UnsupportedFormat`], [`RagError::CorruptDocument`],
//!   [`RagError::EmptyDocument`]
//! - **index integrity**: [`RagError::DimensionMismatch`], [`RagError::IndexCorruption`],
//!   [`RagError::IndexBusy`], [`RagError::Storage`]
//! - **model backend**: [`RagError::EmbeddingModel`], [`RagError::ModelUnavailable`],
//!   [`RagError::GenerationTimeout`]
//!
//! Ingestion errors abort the document with no index mutation. Model backend
//! errors are never retried by the pipeline; they reach the caller as a
//! "try again" condition (see [`RagError::is_retryable`]).

use thiserror::Error;

/// Errors produced anywhere in the ingest and query paths.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RagError {
    /// The uploaded bytes are not a document format we can parse.
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    /// Parsing started but could not complete.
    #[error("corrupt document: {0}")]
    CorruptDocument(String),

    /// The document parsed but produced no extractable tokens.
    #[error("document '{document}' contains no extractable text")]
    EmptyDocument { document: String },

    /// A vector's dimensionality differs from the index dimensionality.
    #[error("dimension mismatch: index expects {expected}D vectors, got {actual}D")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The persisted index could not be decoded.
    #[error("index corruption: {0}")]
    IndexCorruption(String),

    /// Lock acquisition on the shared index exhausted its retries.
    #[error("index busy: lock not acquired after {attempts} attempts")]
    IndexBusy { attempts: u32 },

    /// Durable storage failed (I/O or database error).
    #[error("storage error: {0}")]
    Storage(String),

    /// The embedding model could not produce vectors.
    #[error("embedding model error: {0}")]
    EmbeddingModel(String),

    /// The generation model is not loaded or cannot be reached.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Generation exceeded the configured wall-clock budget.
    #[error("generation timed out after {secs}s")]
    GenerationTimeout { secs: u64 },

    /// System instructions plus the question alone exceed the prompt budget.
    #[error("prompt needs {required} tokens but the budget is {budget}")]
    PromptTooLong { required: usize, budget: usize },

    /// No indexed document has this id.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// Caller-supplied parameters are invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RagError {
    /// Stable machine-readable code for API responses and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            RagError::UnsupportedFormat(_) => "unsupported_format",
            RagError::CorruptDocument(_) => "corrupt_document",
            RagError::EmptyDocument { .. } => "empty_document",
            RagError::DimensionMismatch { .. } => "dimension_mismatch",
            RagError::IndexCorruption(_) => "index_corruption",
            RagError::IndexBusy { .. } => "index_busy",
            RagError::Storage(_) => "storage_error",
            RagError::EmbeddingModel(_) => "embedding_model_error",
            RagError::ModelUnavailable(_) => "model_unavailable",
            RagError::GenerationTimeout { .. } => "generation_timeout",
            RagError::PromptTooLong { .. } => "prompt_too_long",
            RagError::DocumentNotFound(_) => "not_found",
            RagError::InvalidInput(_) => "bad_request",
        }
    }

    /// Whether the caller may reasonably try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::IndexBusy { .. }
                | RagError::EmbeddingModel(_)
                | RagError::ModelUnavailable(_)
                | RagError::GenerationTimeout { .. }
        )
    }

    /// Whether the error was caused by the uploaded document itself.
    pub fn is_ingestion_input(&self) -> bool {
        matches!(
            self,
            RagError::UnsupportedFormat(_)
                | RagError::CorruptDocument(_)
                | RagError::EmptyDocument { .. }
        )
    }
}
