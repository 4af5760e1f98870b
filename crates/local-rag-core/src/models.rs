//! Core data models that flow through ingestion and retrieval.

use serde::{Deserialize, Serialize};

/// Page texts joined into one string, with page boundaries kept as
/// byte offsets rather than as markers inside the text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    /// Pages joined with [`PAGE_JOINER`].
    pub text: String,
    /// Byte offset at which each page starts, one entry per page.
    pub page_starts: Vec<usize>,
}

/// Whitespace placed between consecutive pages so words on either side
/// of a page break stay separate tokens.
pub const PAGE_JOINER: &str = "\n";

impl ExtractedText {
    pub fn from_pages(pages: &[String]) -> Self {
        let mut text = String::new();
        let mut page_starts = Vec::with_capacity(pages.len());
        for (i, page) in pages.iter().enumerate() {
            if i > 0 {
                text.push_str(PAGE_JOINER);
            }
            page_starts.push(text.len());
            text.push_str(page);
        }
        Self { text, page_starts }
    }

    /// 1-based page number containing byte `offset`.
    pub fn page_of(&self, offset: usize) -> usize {
        self.page_starts
            .partition_point(|&start| start <= offset)
            .max(1)
    }

    pub fn page_count(&self) -> usize {
        self.page_starts.len()
    }
}

/// A bounded-length span of a document's extracted text.
///
/// Chunks are immutable once created. Consecutive chunks of one document
/// share `overlap_tokens` tokens; the shared prefix of this chunk is
/// `text[..overlap_bytes]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `"{document_id}-{ordinal:05}"`, stable across runs.
    pub id: String,
    pub document_id: String,
    /// Position within the document, contiguous from 0.
    pub ordinal: usize,
    pub text: String,
    /// Byte span `[start_byte, end_byte)` in the extracted text.
    pub start_byte: usize,
    pub end_byte: usize,
    pub token_count: usize,
    /// Tokens shared with the previous chunk (0 for the first chunk).
    pub overlap_tokens: usize,
    /// Byte length of the shared prefix.
    pub overlap_bytes: usize,
    /// First and last 1-based page the chunk touches.
    pub page_start: usize,
    pub page_end: usize,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message of a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// A retrieved passage with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    /// Cosine similarity, higher is closer.
    pub score: f32,
    pub page_start: usize,
    pub page_end: usize,
}
