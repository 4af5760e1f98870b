//! Deterministic tokenizer used for chunk sizing and prompt budgeting.
//!
//! Text is segmented on Unicode word boundaries (UAX #29). Every
//! non-whitespace segment (a word, a number, a punctuation mark) is one
//! token; whitespace is absorbed into the preceding token, and leading
//! whitespace into the first one. Token spans are therefore contiguous
//! and cover the whole input whenever at least one token exists, which is
//! what lets chunk spans reconstruct the source text exactly.
//!
//! # Example
//!
//! ```rust
//! use local_rag_core::tokenize::{count_tokens, tokenize};
//!
//! let tokens = tokenize("Hello, world!");
//! assert_eq!(tokens.len(), 4); // "Hello" "," "world" "!"
//! assert_eq!(count_tokens("  two words "), 2);
//! ```

use unicode_segmentation::UnicodeSegmentation;

/// A token as a half-open byte span `[start, end)` into the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub start: usize,
    pub end: usize,
}

impl Token {
    /// The token's text, including any absorbed whitespace.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

/// Split `text` into contiguous tokens.
///
/// Text consisting only of whitespace yields no tokens.
pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut pending_start: Option<usize> = None;

    for (idx, segment) in text.split_word_bound_indices() {
        let end = idx + segment.len();
        if segment.chars().all(char::is_whitespace) {
            match tokens.last_mut() {
                Some(last) => last.end = end,
                None => {
                    pending_start.get_or_insert(idx);
                }
            }
            continue;
        }
        tokens.push(Token {
            start: pending_start.take().unwrap_or(idx),
            end,
        });
    }

    tokens
}

/// Number of tokens in `text`.
pub fn count_tokens(text: &str) -> usize {
    tokenize(text).len()
}

/// Longest prefix of `text` holding at most `max_tokens` tokens, with
/// trailing whitespace trimmed.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    let tokens = tokenize(text);
    if tokens.len() <= max_tokens {
        return text;
    }
    if max_tokens == 0 {
        return "";
    }
    text[..tokens[max_tokens - 1].end].trim_end()
}
