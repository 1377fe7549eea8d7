//! Embedding providers.
//!
//! Concrete implementations of the core [`EmbeddingProvider`] trait:
//! - **[`DisabledEmbedder`]**: fails every call; used when embeddings are not configured.
//! - **[`OpenAIEmbedder`]**: `POST /v1/embeddings` on the OpenAI API (or a compatible server).
//! - **[`OllamaEmbedder`]**: `POST /api/embed` on an Ollama instance.
//! - **[`HashedEmbedder`]**: offline, deterministic feature hashing; no network.
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use manual_copilot::config::EmbeddingConfig;
//! # use manual_copilot::embedding::create_provider;
//! # use manual_copilot_core::embedding::EmbeddingProvider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```
//!
//! Networked providers retry as described in [`crate::http`].

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use manual_copilot_core::embedding::EmbeddingProvider;
use manual_copilot_core::{FailureKind, RagError};

use crate::config::EmbeddingConfig;
use crate::http::{build_client, post_json, RetryPolicy, Service};

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";

type CoreResult<T> = manual_copilot_core::Result<T>;

fn terminal(message: impl Into<String>) -> RagError {
    Service::Embedding.error(FailureKind::Terminal, message)
}

fn policy(config: &EmbeddingConfig) -> RetryPolicy {
    RetryPolicy::new(config.max_retries, config.backoff_ms, config.timeout_secs)
}

fn check_dims(vectors: &[Vec<f32>], dims: usize) -> CoreResult<()> {
    if let Some(v) = vectors.iter().find(|v| v.len() != dims) {
        return Err(terminal(format!(
            "expected {dims}-dimensional vectors, got {}",
            v.len()
        )));
    }
    Ok(())
}

// ============ Disabled Provider ============

/// Fails every call with a terminal error.
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        Err(terminal("embedding provider is disabled"))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    api_key: String,
    url: String,
    policy: RetryPolicy,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config.url.as_deref().unwrap_or(OPENAI_DEFAULT_URL);
        let policy = policy(config);

        Ok(Self {
            client: build_client(Service::Embedding, &policy)?,
            model,
            dims,
            api_key,
            url: format!("{}/v1/embeddings", base.trim_end_matches('/')),
            policy,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json(
            &self.client,
            Service::Embedding,
            &self.url,
            Some(&self.api_key),
            &body,
            &self.policy,
        )
        .await?;
        let vectors = parse_openai_response(&json)?;
        check_dims(&vectors, self.dims)?;
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
pub fn parse_openai_response(json: &serde_json::Value) -> CoreResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| terminal("invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| terminal("invalid OpenAI response: missing embedding array"))?;
        indexed.push((index, json_floats(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn json_floats(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

// ============ Ollama Provider ============

/// Embedding provider using an Ollama instance's `POST /api/embed`.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    policy: RetryPolicy,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let base = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("embedding.url required for Ollama provider"))?;
        let policy = policy(config);

        Ok(Self {
            client: build_client(Service::Embedding, &policy)?,
            model,
            dims,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            policy,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json(
            &self.client,
            Service::Embedding,
            &self.url,
            None,
            &body,
            &self.policy,
        )
        .await?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| terminal("invalid Ollama response: missing embeddings array"))?;
        let mut vectors = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            let values = embedding
                .as_array()
                .ok_or_else(|| terminal("invalid Ollama response: embedding is not an array"))?;
            vectors.push(json_floats(values));
        }
        check_dims(&vectors, self.dims)?;
        Ok(vectors)
    }
}

// ============ Hashed Provider ============

/// Offline embedder: SHA-256 feature hashing of lowercase word tokens,
/// L2-normalized. Texts sharing words land close together.
pub struct HashedEmbedder {
    dims: usize,
}

impl HashedEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashedEmbedder {
    fn model_name(&self) -> &str {
        "hashed"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Create the configured embedding provider.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"hashed"` | [`HashedEmbedder`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "hashed" => Ok(Arc::new(HashedEmbedder::new(config.dims.unwrap_or(256)))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manual_copilot_core::embedding::cosine_similarity;

    #[test]
    fn test_hashed_is_deterministic_and_normalized() {
        let e = HashedEmbedder::new(64);
        let a = e.embed_one("Replace the return hose");
        assert_eq!(a, e.embed_one("replace THE return hose"));
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashed_shared_words_are_closer() {
        let e = HashedEmbedder::new(256);
        let q = e.embed_one("hydraulic relief valve pressure");
        let near = e.embed_one("the hydraulic relief valve is set to 3000 psi pressure");
        let far = e.embed_one("grease the loader bucket pins weekly");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_hashed_empty_text_is_zero_vector() {
        let e = HashedEmbedder::new(8);
        assert!(e.embed_one("  ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_missing_data_is_terminal() {
        let err = parse_openai_response(&serde_json::json!({"error": "x"})).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_disabled_fails_terminally() {
        let err = DisabledEmbedder.embed(&["x".to_string()]).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_create_provider_unknown() {
        let config = EmbeddingConfig {
            provider: "local".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }
}
