//! Fixed-size, overlapping page chunker.
//!
//! Splits one page of extracted manual text into [`Chunk`]s of at most
//! `chunk_chars` fresh characters, each prefixed with the last
//! `overlap_chars` characters of its predecessor so that sentences
//! spanning a split point survive intact in at least one chunk.
//!
//! # Algorithm
//!
//! 1. Blank (empty or whitespace-only) pages yield no chunks.
//! 2. The page is cut into `ceil(len / chunk_chars)` windows of fresh text,
//!    where `len` counts characters, not bytes.
//! 3. Every window after the first is extended backwards by `overlap_chars`.
//! 4. Blank windows are skipped; sequence numbers stay contiguous.
//!
//! A page of exactly `chunk_chars` characters is never split.
//!
//! # Example
//!
//! ```rust
//! use manual_copilot_core::chunk::{chunk_page, ChunkingParams};
//! use manual_copilot_core::models::Page;
//!
//! let params = ChunkingParams { chunk_chars: 10, overlap_chars: 3 };
//! let chunks = chunk_page("102", &Page::new(4, "abcdefghijKLMNOPQRST"), &params);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[1].text, "hijKLMNOPQRST");
//! assert_eq!(chunks[1].id, "unit_102_p4_c1");
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Chunk, Page};

/// Chunk geometry, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    /// Fresh characters per chunk.
    pub chunk_chars: usize,
    /// Characters repeated from the previous chunk.
    pub overlap_chars: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            chunk_chars: 800,
            overlap_chars: 150,
        }
    }
}

/// Deterministic chunk identifier for `(unit, page, seq)`.
pub fn chunk_id(unit: &str, page: u32, seq: u32) -> String {
    format!("unit_{unit}_p{page}_c{seq}")
}

/// Split a single page into ordered chunks.
pub fn chunk_page(unit: &str, page: &Page, params: &ChunkingParams) -> Vec<Chunk> {
    if page.text.trim().is_empty() {
        return Vec::new();
    }

    let size = params.chunk_chars.max(1);

    // Byte offset of every char boundary, including the end of the string.
    let bounds: Vec<usize> = page
        .text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(page.text.len()))
        .collect();
    let char_len = bounds.len() - 1;
    let windows = char_len.div_ceil(size);

    let mut chunks = Vec::with_capacity(windows);
    let mut seq = 0u32;

    for w in 0..windows {
        let fresh_start = w * size;
        let end = (fresh_start + size).min(char_len);
        let start = if w == 0 {
            0
        } else {
            fresh_start.saturating_sub(params.overlap_chars)
        };

        let text = &page.text[bounds[start]..bounds[end]];
        if text.trim().is_empty() {
            continue;
        }

        chunks.push(make_chunk(unit, page.number, seq, start, end, text));
        seq += 1;
    }

    chunks
}

/// Chunk every page of a manual, in page order.
pub fn chunk_pages(unit: &str, pages: &[Page], params: &ChunkingParams) -> Vec<Chunk> {
    pages
        .iter()
        .flat_map(|page| chunk_page(unit, page, params))
        .collect()
}

/// SHA-256 hex digest of chunk text.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Build a [`Chunk`] with its derived id and hash.
pub fn make_chunk(unit: &str, page: u32, seq: u32, start: usize, end: usize, text: &str) -> Chunk {
    Chunk {
        id: chunk_id(unit, page, seq),
        unit: unit.to_string(),
        page,
        seq,
        char_start: start,
        char_end: end,
        text: text.to_string(),
        hash: text_hash(text),
    }
}
