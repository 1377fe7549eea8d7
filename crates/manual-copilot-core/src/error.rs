//! Error kinds for ingestion and query-time failures.
//!
//! Ingestion errors fail the specific upload or re-index and leave the
//! previous index intact. Query-time errors degrade per unit; only a
//! total retrieval failure surfaces as [`RagError::SearchUnavailable`].

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, RagError>;

/// Whether a failed service call may succeed if retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network failure, timeout, rate limit, or server-side error.
    Transient,
    /// Invalid credentials, malformed input, quota exhaustion, policy rejection.
    Terminal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => f.write_str("transient"),
            FailureKind::Terminal => f.write_str("terminal"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RagError {
    /// The document produced no extractable text. Non-fatal: zero chunks.
    #[error("no extractable text in manual for unit {unit}")]
    ExtractionEmpty { unit: String },

    #[error("embedding service error ({kind}): {message}")]
    EmbeddingService { kind: FailureKind, message: String },

    /// The previous collection for `unit` is still intact.
    #[error("index write failed for unit {unit}: {message}")]
    IndexWrite { unit: String, message: String },

    #[error("index read failed for {scope}: {message}")]
    IndexRead { scope: String, message: String },

    #[error("generation service error ({kind}): {message}")]
    GenerationService { kind: FailureKind, message: String },

    #[error("answer cites unit {unit} page {page}, which was not among the supplied passages")]
    UnsupportedCitation { unit: String, page: u32 },

    #[error("manual search unavailable: {failed} of {attempted} index lookups failed")]
    SearchUnavailable { attempted: usize, failed: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RagError {
    /// Returns `true` if repeating the failed operation may succeed.
    ///
    /// Index writes are always retryable because a failed write never
    /// leaves a partially replaced collection behind.
    pub fn is_retryable(&self) -> bool {
        match self {
            RagError::EmbeddingService { kind, .. } | RagError::GenerationService { kind, .. } => {
                *kind == FailureKind::Transient
            }
            RagError::IndexWrite { .. }
            | RagError::IndexRead { .. }
            | RagError::SearchUnavailable { .. } => true,
            RagError::ExtractionEmpty { .. }
            | RagError::UnsupportedCitation { .. }
            | RagError::InvalidInput(_) => false,
        }
    }

    pub fn index_read(scope: impl Into<String>, message: impl fmt::Display) -> Self {
        RagError::IndexRead {
            scope: scope.into(),
            message: message.to_string(),
        }
    }

    pub fn index_write(unit: &str, message: impl fmt::Display) -> Self {
        RagError::IndexWrite {
            unit: unit.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_errors_retryable_only_when_transient() {
        let transient = RagError::EmbeddingService {
            kind: FailureKind::Transient,
            message: "503".into(),
        };
        let terminal = RagError::GenerationService {
            kind: FailureKind::Terminal,
            message: "401".into(),
        };
        assert!(transient.is_retryable());
        assert!(!terminal.is_retryable());
    }

    #[test]
    fn test_display_includes_kind() {
        let err = RagError::EmbeddingService {
            kind: FailureKind::Terminal,
            message: "invalid api key".into(),
        };
        assert_eq!(
            err.to_string(),
            "embedding service error (terminal): invalid api key"
        );
    }
}
