//! Unit-number detection and cross-reference trigger detection.
//!
//! The analyzer is deliberately permissive: any token that fits a unit
//! pattern becomes a candidate, and the retriever later discards the ones
//! that do not name a registered manual.
//!
//! Recognized unit mentions:
//!
//! - `unit 102`, `Unit #102`, `unit AB-12` (the id must contain a digit)
//! - `#102`
//! - standalone numbers with at least `min_standalone_digits` digits
//!
//! Candidates keep the order of their first appearance in the message.

use std::collections::HashSet;

use regex::Regex;

use crate::error::{RagError, Result};

/// Default cross-reference vocabulary: part and consumable categories
/// whose answers usually live in more than one manual.
pub const DEFAULT_TRIGGER_TERMS: &[&str] = &[
    "part",
    "parts",
    "hose",
    "hoses",
    "fitting",
    "fittings",
    "filter",
    "filters",
    "compatible",
    "replacement",
    "manual",
    "manuals",
    "diagram",
    "schematics",
    "oil",
    "fluid",
    "belt",
    "belts",
    "seal",
    "seals",
];

/// Signals extracted from one user message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryAnalysis {
    /// Candidate unit numbers, ordered by first appearance, deduplicated.
    pub units: Vec<String>,
    /// Whether the message contains a cross-reference trigger term.
    pub cross_reference: bool,
}

#[derive(Debug, Clone)]
pub struct QueryAnalyzer {
    unit_keyword: Regex,
    hash_number: Regex,
    standalone: Option<Regex>,
    triggers: Option<Regex>,
}

impl QueryAnalyzer {
    /// Build an analyzer from trigger terms (matched as whole words,
    /// case-insensitive) and the minimum digit count for bare numbers.
    /// A `min_standalone_digits` of 0 disables bare-number detection.
    pub fn new<S: AsRef<str>>(trigger_terms: &[S], min_standalone_digits: usize) -> Result<Self> {
        let unit_keyword = Regex::new(r"(?i)\bunit(?:\s*#\s*|\s+)([a-z0-9][\w-]*)")
            .map_err(|e| RagError::InvalidInput(e.to_string()))?;
        let hash_number =
            Regex::new(r"#\s*(\d+)\b").map_err(|e| RagError::InvalidInput(e.to_string()))?;

        let standalone = if min_standalone_digits == 0 {
            None
        } else {
            Some(
                Regex::new(&format!(r"\b(\d{{{min_standalone_digits},}})\b"))
                    .map_err(|e| RagError::InvalidInput(e.to_string()))?,
            )
        };

        let escaped: Vec<String> = trigger_terms
            .iter()
            .map(|t| t.as_ref().trim())
            .filter(|t| !t.is_empty())
            .map(regex::escape)
            .collect();
        let triggers = if escaped.is_empty() {
            None
        } else {
            let pattern = format!(r"(?i)\b(?:{})\b", escaped.join("|"));
            Some(Regex::new(&pattern).map_err(|e| {
                RagError::InvalidInput(format!("invalid trigger terms: {e}"))
            })?)
        };

        Ok(Self {
            unit_keyword,
            hash_number,
            standalone,
            triggers,
        })
    }

    /// Analyzer with [`DEFAULT_TRIGGER_TERMS`] and 3-digit bare numbers.
    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_TRIGGER_TERMS, 3)
    }

    pub fn analyze(&self, message: &str) -> QueryAnalysis {
        QueryAnalysis {
            units: self.detect_units(message),
            cross_reference: self.has_trigger(message),
        }
    }

    pub fn has_trigger(&self, message: &str) -> bool {
        self.triggers
            .as_ref()
            .is_some_and(|re| re.is_match(message))
    }

    pub fn detect_units(&self, message: &str) -> Vec<String> {
        let mut found: Vec<(usize, &str)> = Vec::new();

        for re in [Some(&self.unit_keyword), Some(&self.hash_number), self.standalone.as_ref()]
            .into_iter()
            .flatten()
        {
            for caps in re.captures_iter(message) {
                if let Some(m) = caps.get(1) {
                    let token = m.as_str().trim_end_matches('-');
                    if token.chars().any(|c| c.is_ascii_digit()) {
                        found.push((m.start(), token));
                    }
                }
            }
        }

        found.sort_by_key(|(pos, _)| *pos);

        let mut seen = HashSet::new();
        found
            .into_iter()
            .filter(|(_, token)| seen.insert(*token))
            .map(|(_, token)| token.to_string())
            .collect()
    }
}
