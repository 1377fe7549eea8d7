//! Embedding capability trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that every embedding backend
//! implements, plus pure helpers for vector serialization and distance.
//!
//! Concrete providers (OpenAI, Ollama, offline hashing) live in the
//! `manual-copilot` app crate.

use async_trait::async_trait;

use crate::error::{FailureKind, RagError, Result};

/// Converts text into fixed-length vectors.
///
/// Implementations enforce their own timeout and retry policy and report
/// failures as [`RagError::EmbeddingService`] with a [`FailureKind`].
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts. Vectors are returned in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let vectors = embed_checked(provider, &[text.to_string()]).await?;
    vectors.into_iter().next().ok_or_else(|| RagError::EmbeddingService {
        kind: FailureKind::Terminal,
        message: "empty embedding response".to_string(),
    })
}

/// Embed a batch and verify the provider returned one vector per input.
pub async fn embed_checked(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let vectors = provider.embed(texts).await?;
    if vectors.len() != texts.len() {
        return Err(RagError::EmbeddingService {
            kind: FailureKind::Terminal,
            message: format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            ),
        });
    }
    Ok(vectors)
}

/// Encode a float vector as little-endian `f32` bytes.
///
/// # Example
///
/// ```rust
/// use manual_copilot_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode bytes produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Cosine distance `1 - cos(a, b)`, in `[0.0, 2.0]`. Lower is closer.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}
