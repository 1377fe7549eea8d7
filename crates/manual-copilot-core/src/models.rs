//! Core data models shared by the ingestion and query paths.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// One page of extracted manual text. Page numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub text: String,
}

impl Page {
    pub fn new(number: u32, text: impl Into<String>) -> Self {
        Self {
            number,
            text: text.into(),
        }
    }
}

/// A contiguous span of one page's text, the atomic unit of retrieval.
///
/// Immutable once created. The `id` is a pure function of
/// `(unit, page, seq)`, so re-ingesting identical content overwrites
/// rather than duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub unit: String,
    pub page: u32,
    /// Position of this chunk within its page, starting at 0.
    pub seq: u32,
    /// Character offset (not byte offset) of the first character.
    pub char_start: usize,
    /// Character offset one past the last character.
    pub char_end: usize,
    pub text: String,
    /// SHA-256 of `text`, used to reuse unchanged embeddings.
    pub hash: String,
}

/// A chunk paired with its embedding vector and the model that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub model: String,
    pub vector: Vec<f32>,
}

/// Indexing lifecycle of a manual in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    /// File stored, indexing not finished.
    Pending,
    /// Latest indexing attempt succeeded.
    Indexed,
    /// Latest indexing attempt failed; retry with a re-index.
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Pending => "pending",
            IndexStatus::Indexed => "indexed",
            IndexStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(IndexStatus::Pending),
            "indexed" => Ok(IndexStatus::Indexed),
            "failed" => Ok(IndexStatus::Failed),
            other => Err(RagError::InvalidInput(format!(
                "unknown index status: {other}"
            ))),
        }
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A manual registered for one equipment unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualRecord {
    pub unit: String,
    pub filename: String,
    pub description: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub page_count: u32,
    pub chunk_count: u32,
    /// Where the original file is stored.
    pub stored_path: String,
    pub status: IndexStatus,
    pub status_detail: Option<String>,
    /// Set after the first successful indexing; kept across failed re-indexes.
    pub indexed_at: Option<DateTime<Utc>>,
}

impl ManualRecord {
    /// A manual is searchable once it has been indexed at least once.
    /// A failed re-index leaves the previous collection in place.
    pub fn is_searchable(&self) -> bool {
        self.indexed_at.is_some()
    }
}

/// A `(unit, page)` reference attached to generated text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Citation {
    pub unit: String,
    pub page: u32,
}

impl fmt::Display for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit {} page {}", self.unit, self.page)
    }
}

/// Point-in-time view of the searchable manuals: unit → original filename.
///
/// The retriever validates detected unit numbers against this snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    units: BTreeMap<String, String>,
}

impl RegistrySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, unit: impl Into<String>, filename: impl Into<String>) {
        self.units.insert(unit.into(), filename.into());
    }

    pub fn with_unit(mut self, unit: impl Into<String>, filename: impl Into<String>) -> Self {
        self.insert(unit, filename);
        self
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.units.contains_key(unit)
    }

    /// Map a detected token to a known unit key: exact match first,
    /// then ASCII case-insensitive.
    pub fn resolve(&self, token: &str) -> Option<&str> {
        if let Some((key, _)) = self.units.get_key_value(token) {
            return Some(key.as_str());
        }
        self.units
            .keys()
            .find(|k| k.eq_ignore_ascii_case(token))
            .map(String::as_str)
    }

    pub fn filename(&self, unit: &str) -> Option<&str> {
        self.units.get(unit).map(String::as_str)
    }

    /// Known units in sorted order.
    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl FromIterator<ManualRecord> for RegistrySnapshot {
    fn from_iter<I: IntoIterator<Item = ManualRecord>>(iter: I) -> Self {
        let mut snapshot = RegistrySnapshot::new();
        for record in iter.into_iter().filter(ManualRecord::is_searchable) {
            snapshot.insert(record.unit, record.filename);
        }
        snapshot
    }
}

/// Regex character class for one character of a unit number. Matches
/// exactly the characters [`is_unit_char`] accepts.
pub const UNIT_CHAR_CLASS: &str = r"[\p{Alphabetic}\p{N}_.\-]";

/// Whether `c` may appear in a normalized unit number.
pub fn is_unit_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Normalize a user-supplied unit number into a registry key.
///
/// Trims surrounding whitespace and replaces path separators and inner
/// whitespace with `_`, so the key is safe to use as a file stem. Any
/// other character outside [`is_unit_char`] is rejected, which keeps
/// every registered unit citable.
pub fn normalize_unit(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RagError::InvalidInput(
            "unit number must not be empty".to_string(),
        ));
    }
    let unit: String = trimmed
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect();
    if let Some(bad) = unit.chars().find(|c| !is_unit_char(*c)) {
        return Err(RagError::InvalidInput(format!(
            "unit number {unit:?} contains {bad:?}; use letters, digits, '.', '-' or '_'"
        )));
    }
    Ok(unit)
}
