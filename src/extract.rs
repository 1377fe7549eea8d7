//! Page-level text extraction for uploaded manuals.
//!
//! Produces the ordered `(page number, text)` sequence the chunker
//! consumes. Two formats are supported:
//!
//! - **PDF**: one page per PDF page, via `pdf-extract`.
//! - **Plain text**: pages separated by form feed (`\x0c`), the page
//!   break emitted by `pdftotext` and most print-to-text tools.
//!
//! Page numbers are 1-based and count blank pages, so citations line up
//! with the printed manual.

use std::path::Path;

use thiserror::Error;

use manual_copilot_core::models::Page;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("text file is not valid UTF-8")]
    NotUtf8,
}

/// Guess the content type from the file name, falling back to the bytes.
pub fn detect_content_type(filename: &str, bytes: &[u8]) -> Option<&'static str> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => Some(MIME_PDF),
        Some("txt") | Some("text") | Some("md") => Some(MIME_TEXT),
        _ if bytes.starts_with(b"%PDF-") => Some(MIME_PDF),
        _ => None,
    }
}

/// File extension used when storing a manual of `content_type`.
pub fn stored_extension(content_type: &str) -> &'static str {
    match content_type {
        MIME_PDF => "pdf",
        _ => "txt",
    }
}

/// Content type of a stored manual, from the extension it was stored under.
pub fn stored_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("pdf") => MIME_PDF,
        _ => MIME_TEXT,
    }
}

/// Extract pages from `bytes`.
pub fn extract_pages(bytes: &[u8], content_type: &str) -> Result<Vec<Page>, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf_pages(bytes),
        MIME_TEXT => extract_text_pages(bytes),
        other => Err(ExtractError::UnsupportedType(other.to_string())),
    }
}

fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<Page>, ExtractError> {
    // pdf-extract panics on some malformed inputs.
    let result = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
        .map_err(|_| ExtractError::Pdf("parser panicked".to_string()))?;
    let texts = result.map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(number_pages(texts))
}

fn extract_text_pages(bytes: &[u8]) -> Result<Vec<Page>, ExtractError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ExtractError::NotUtf8)?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut pages: Vec<String> = text.split('\x0c').map(str::to_string).collect();
    // A trailing form feed closes the last page rather than opening a new one.
    if pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
        pages.pop();
    }
    Ok(number_pages(pages))
}

fn number_pages(texts: Vec<String>) -> Vec<Page> {
    texts
        .into_iter()
        .enumerate()
        .map(|(i, text)| Page::new(i as u32 + 1, text))
        .collect()
}
