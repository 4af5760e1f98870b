//! Document loading: uploaded bytes to ordered page texts.
//!
//! PDFs are recognised by their `%PDF-` header and parsed with
//! `pdf-extract`, one string per page. Plain-text uploads (`.txt`, `.md`)
//! are accepted as well, with form feeds (`\x0c`) as page breaks. Empty
//! pages are kept as empty strings so page numbers stay stable.
//!
//! Loading is a pure transform and never touches the index. It is
//! CPU-bound; async callers should run it on a blocking thread.

use std::panic::{self, AssertUnwindSafe};

use local_rag_core::error::RagError;

/// How far into the upload the `%PDF-` header may appear.
const PDF_HEADER_WINDOW: usize = 1024;
const TEXT_EXTENSIONS: &[&str] = &["txt", "text", "md", "markdown"];
const PAGE_BREAK: char = '\u{c}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Text,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Text => "text",
        }
    }
}

/// Classify an upload by content, falling back to the filename extension
/// for plain text.
pub fn detect(bytes: &[u8], filename: Option<&str>) -> Result<DocumentKind, RagError> {
    let window = &bytes[..bytes.len().min(PDF_HEADER_WINDOW)];
    if window.windows(5).any(|w| w == b"%PDF-") {
        return Ok(DocumentKind::Pdf);
    }
    let extension = filename
        .and_then(|f| f.rsplit_once('.'))
        .map(|(_, ext)| ext.to_lowercase());
    match extension {
        Some(ext) if TEXT_EXTENSIONS.contains(&ext.as_str()) => Ok(DocumentKind::Text),
        Some(ext) if ext == "pdf" => Err(RagError::UnsupportedFormat(
            "file is named .pdf but has no PDF header".to_string(),
        )),
        Some(ext) => Err(RagError::UnsupportedFormat(format!(
            "'.{}' files are not supported; upload a PDF or plain text",
            ext
        ))),
        None => Err(RagError::UnsupportedFormat(
            "content is not a PDF and has no recognised extension".to_string(),
        )),
    }
}

/// Extract page texts from an upload.
///
/// # Errors
///
/// - [`RagError::UnsupportedFormat`] when the bytes are not a PDF or
///   recognised text file.
/// - [`RagError::CorruptDocument`] when parsing starts but fails, including
///   text files that are not valid UTF-8.
pub fn extract(bytes: &[u8], filename: Option<&str>) -> Result<Vec<String>, RagError> {
    match detect(bytes, filename)? {
        DocumentKind::Pdf => extract_pdf(bytes),
        DocumentKind::Text => extract_text(bytes),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<String>, RagError> {
    // pdf-extract panics on some malformed inputs.
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem_by_pages(bytes)
    }));
    match result {
        Ok(Ok(pages)) => Ok(pages
            .into_iter()
            .map(|p| p.replace(PAGE_BREAK, "\n"))
            .collect()),
        Ok(Err(e)) => Err(RagError::CorruptDocument(format!(
            "PDF extraction failed: {}",
            e
        ))),
        Err(_) => Err(RagError::CorruptDocument(
            "PDF parser aborted on malformed input".to_string(),
        )),
    }
}

fn extract_text(bytes: &[u8]) -> Result<Vec<String>, RagError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| RagError::CorruptDocument(format!("text is not valid UTF-8: {}", e)))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    Ok(text.split(PAGE_BREAK).map(str::to_string).collect())
}

/// Reduce an uploaded filename to a safe basename: path components are
/// dropped, anything outside `[A-Za-z0-9._-]` becomes `_`, and leading
/// dots are stripped.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.chars().take(200).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_pdf_by_header() {
        assert_eq!(
            detect(b"%PDF-1.4\n...", Some("report.bin")).unwrap(),
            DocumentKind::Pdf
        );
        assert_eq!(detect(b"\n\n%PDF-1.7", None).unwrap(), DocumentKind::Pdf);
    }

    #[test]
    fn test_unsupported_formats() {
        assert!(matches!(
            extract(b"PK\x03\x04zipdata", Some("doc.docx")),
            Err(RagError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            extract(b"hello", Some("fake.pdf")),
            Err(RagError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            extract(b"hello", None),
            Err(RagError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_truncated_pdf_is_corrupt() {
        let err = extract(b"%PDF-1.4\n1 0 obj << /Type /Catalog", Some("a.pdf")).unwrap_err();
        assert!(matches!(err, RagError::CorruptDocument(_)), "{err:?}");
    }

    #[test]
    fn test_text_pages_keep_empty_pages() {
        let pages = extract(b"first\x0c\x0cthird", Some("notes.txt")).unwrap();
        assert_eq!(pages, vec!["first", "", "third"]);
    }

    #[test]
    fn test_invalid_utf8_text_is_corrupt() {
        assert!(matches!(
            extract(&[0x66, 0xff, 0xfe, 0x67], Some("notes.md")),
            Err(RagError::CorruptDocument(_))
        ));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("My Report (v2).pdf"), "My_Report__v2_.pdf");
        assert_eq!(sanitize_filename("..hidden"), "hidden");
        assert_eq!(sanitize_filename("C:\\docs\\a.pdf"), "a.pdf");
        assert_eq!(sanitize_filename(""), "upload");
    }
}
