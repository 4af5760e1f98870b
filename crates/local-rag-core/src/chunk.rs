//! Sliding-window token chunker.
//!
//! Splits a document's pages into overlapping [`Chunk`]s of at most
//! `chunk_size` tokens, advancing the window by `chunk_size - overlap`
//! tokens each step.
//!
//! # Algorithm
//!
//! 1. Join page texts into one [`ExtractedText`]; page boundaries are kept
//!    as byte offsets, not embedded in the text.
//! 2. Tokenize the joined text with [`tokenize`](crate::tokenize::tokenize).
//! 3. Emit the window `[start, start + chunk_size)`. If the remaining tokens
//!    fit in one window, that window is the final (possibly short) chunk.
//! 4. Otherwise advance `start` by the stride and repeat.
//!
//! Chunk ids are derived from the document id and ordinal, so the same
//! input and parameters always produce an identical sequence.
//!
//! # Example
//!
//! ```rust
//! use local_rag_core::chunk::{chunk_pages, reconstruct};
//!
//! let pages = vec!["one two three four five".to_string()];
//! let chunked = chunk_pages("doc-1", &pages, 3, 1).unwrap();
//! assert_eq!(chunked.chunks.len(), 2);
//! assert_eq!(reconstruct(&chunked.chunks), chunked.extracted.text);
//! ```

use sha2::{Digest, Sha256};

use crate::error::RagError;
use crate::models::{Chunk, ExtractedText};
use crate::tokenize::tokenize;

/// Output of [`chunk_pages`]: the joined text and its chunks.
#[derive(Debug, Clone)]
pub struct ChunkedDocument {
    pub extracted: ExtractedText,
    pub chunks: Vec<Chunk>,
}

/// Check `0 <= overlap < chunk_size`.
pub fn validate_params(chunk_size: usize, overlap: usize) -> Result<(), RagError> {
    if chunk_size == 0 {
        return Err(RagError::InvalidInput("chunk_size must be > 0".to_string()));
    }
    if overlap >= chunk_size {
        return Err(RagError::InvalidInput(format!(
            "overlap ({}) must be smaller than chunk_size ({})",
            overlap, chunk_size
        )));
    }
    Ok(())
}

/// Chunk a document's pages.
///
/// # Errors
///
/// - [`RagError::InvalidInput`] if the parameters violate `0 <= overlap < chunk_size`.
/// - [`RagError::EmptyDocument`] if the pages hold no tokens; callers must
///   report this rather than index nothing.
pub fn chunk_pages(
    document_id: &str,
    pages: &[String],
    chunk_size: usize,
    overlap: usize,
) -> Result<ChunkedDocument, RagError> {
    validate_params(chunk_size, overlap)?;

    let extracted = ExtractedText::from_pages(pages);
    let tokens = tokenize(&extracted.text);
    if tokens.is_empty() {
        return Err(RagError::EmptyDocument {
            document: document_id.to_string(),
        });
    }

    let stride = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    // Token index one past the previous window, for overlap bookkeeping.
    let mut prev_end: Option<usize> = None;

    loop {
        let end = (start + chunk_size).min(tokens.len());
        let start_byte = tokens[start].start;
        let end_byte = tokens[end - 1].end;

        let (overlap_tokens, overlap_bytes) = match prev_end {
            Some(prev) if prev > start => (prev - start, tokens[prev - 1].end - start_byte),
            _ => (0, 0),
        };

        let text = &extracted.text[start_byte..end_byte];
        // Pages are taken from the visible text so absorbed whitespace,
        // such as the joiners of empty pages, does not widen the range.
        let (first_byte, last_byte) = visible_span(text)
            .map(|(first, last)| (start_byte + first, start_byte + last))
            .unwrap_or((start_byte, end_byte - 1));
        chunks.push(Chunk {
            id: chunk_id(document_id, chunks.len()),
            document_id: document_id.to_string(),
            ordinal: chunks.len(),
            text: text.to_string(),
            start_byte,
            end_byte,
            token_count: end - start,
            overlap_tokens,
            overlap_bytes,
            page_start: extracted.page_of(first_byte),
            page_end: extracted.page_of(last_byte),
            hash: content_hash(text),
        });

        if end == tokens.len() {
            break;
        }
        prev_end = Some(end);
        start += stride;
    }

    Ok(ChunkedDocument { extracted, chunks })
}

/// Rebuild the extracted text from a document's chunks by dropping each
/// chunk's declared overlap prefix.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(&chunk.text[chunk.overlap_bytes..]);
    }
    out
}

/// Byte offsets of the first and last non-whitespace characters of `text`.
fn visible_span(text: &str) -> Option<(usize, usize)> {
    let (first, _) = text.char_indices().find(|(_, c)| !c.is_whitespace())?;
    let (last, _) = text.char_indices().rev().find(|(_, c)| !c.is_whitespace())?;
    Some((first, last))
}

fn chunk_id(document_id: &str, ordinal: usize) -> String {
    format!("{}-{:05}", document_id, ordinal)
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenize::count_tokens;

    fn words(prefix: &str, n: usize) -> String {
        (0..n)
            .map(|i| format!("{}{}", prefix, i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_short_text_single_chunk() {
        let pages = vec!["Hello, world!".to_string()];
        let chunked = chunk_pages("doc1", &pages, 200, 20).unwrap();
        assert_eq!(chunked.chunks.len(), 1);
        assert_eq!(chunked.chunks[0].ordinal, 0);
        assert_eq!(chunked.chunks[0].text, "Hello, world!");
        assert_eq!(chunked.chunks[0].overlap_tokens, 0);
    }

    #[test]
    fn test_empty_document_is_reported() {
        let pages = vec![String::new(), "   \n ".to_string()];
        let err = chunk_pages("doc1", &pages, 200, 20).unwrap_err();
        assert!(matches!(err, RagError::EmptyDocument { .. }));
    }

    #[test]
    fn test_invalid_params() {
        let pages = vec!["text".to_string()];
        assert!(matches!(
            chunk_pages("d", &pages, 0, 0),
            Err(RagError::InvalidInput(_))
        ));
        assert!(matches!(
            chunk_pages("d", &pages, 10, 10),
            Err(RagError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_three_pages_yield_ten_chunks() {
        let pages = vec![words("a", 600), words("b", 600), words("c", 600)];
        let chunked = chunk_pages("doc1", &pages, 200, 20).unwrap();
        assert_eq!(chunked.chunks.len(), 10);

        for chunk in &chunked.chunks {
            assert!(chunk.token_count <= 200);
            assert_eq!(count_tokens(&chunk.text), chunk.token_count);
        }
        for chunk in &chunked.chunks[1..] {
            assert_eq!(chunk.overlap_tokens, 20);
        }
        assert_eq!(chunked.chunks.last().unwrap().token_count, 180);
    }

    #[test]
    fn test_reconstruction_is_exact() {
        let pages = vec![
            "  First page, with punctuation; and   odd spacing.\n".to_string(),
            String::new(),
            "Second page — naïve café text.\n\nAnother paragraph here!".to_string(),
        ];
        for (size, overlap) in [(3, 0), (3, 2), (5, 1), (7, 3), (50, 10)] {
            let chunked = chunk_pages("doc1", &pages, size, overlap).unwrap();
            assert_eq!(
                reconstruct(&chunked.chunks),
                chunked.extracted.text,
                "size={} overlap={}",
                size,
                overlap
            );
        }
    }

    #[test]
    fn test_page_metadata() {
        let pages = vec![words("a", 10), words("b", 10), words("c", 10)];
        let chunked = chunk_pages("doc1", &pages, 10, 0).unwrap();
        assert_eq!(chunked.chunks.len(), 3);
        for (i, chunk) in chunked.chunks.iter().enumerate() {
            assert_eq!(chunk.page_start, i + 1);
            assert_eq!(chunk.page_end, i + 1);
            assert!(!chunk.text.contains('\u{c}'));
        }
    }

    #[test]
    fn test_empty_pages_do_not_widen_page_range() {
        let pages = vec![
            "alpha beta".to_string(),
            String::new(),
            String::new(),
            "gamma delta".to_string(),
        ];
        let chunked = chunk_pages("doc1", &pages, 2, 0).unwrap();
        assert_eq!(chunked.chunks.len(), 2);
        assert_eq!(chunked.chunks[0].text, "alpha beta\n\n\n");
        assert_eq!(
            (chunked.chunks[0].page_start, chunked.chunks[0].page_end),
            (1, 1)
        );
        assert_eq!(
            (chunked.chunks[1].page_start, chunked.chunks[1].page_end),
            (4, 4)
        );
        assert_eq!(reconstruct(&chunked.chunks), chunked.extracted.text);
    }

    #[test]
    fn test_leading_whitespace_page_starts_on_next_page() {
        let pages = vec!["   ".to_string(), "one two".to_string()];
        let chunked = chunk_pages("doc1", &pages, 5, 0).unwrap();
        assert_eq!(chunked.chunks.len(), 1);
        assert_eq!(chunked.chunks[0].page_start, 2);
        assert_eq!(chunked.chunks[0].page_end, 2);
    }

    #[test]
    fn test_ordinals_contiguous_and_ids_traceable() {
        let pages = vec![words("w", 95)];
        let chunked = chunk_pages("doc-x", &pages, 10, 3).unwrap();
        for (i, chunk) in chunked.chunks.iter().enumerate() {
            assert_eq!(chunk.ordinal, i);
            assert_eq!(chunk.document_id, "doc-x");
            assert!(chunk.id.starts_with("doc-x-"));
        }
    }

    #[test]
    fn test_deterministic() {
        let pages = vec![words("alpha", 40), words("beta", 40)];
        let c1 = chunk_pages("doc1", &pages, 12, 4).unwrap();
        let c2 = chunk_pages("doc1", &pages, 12, 4).unwrap();
        assert_eq!(c1.chunks, c2.chunks);
    }
}
