//! Generation providers.
//!
//! Concrete implementations of the core [`GenerationProvider`] trait:
//! - **[`DisabledGenerator`]**: fails every call.
//! - **[`OpenAIGenerator`]**: `POST /v1/chat/completions`.
//! - **[`OllamaGenerator`]**: `POST /api/chat` with `stream = false`.
//! - **[`ExtractiveGenerator`]**: offline; quotes the supplied passage that
//!   best overlaps the question, with its provenance tag.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use manual_copilot_core::generation::{GenerationProvider, GenerationRequest};
use manual_copilot_core::{FailureKind, RagError};

use crate::config::GenerationConfig;
use crate::http::{build_client, post_json, RetryPolicy, Service};

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";
const EXTRACT_CHARS: usize = 600;

type CoreResult<T> = manual_copilot_core::Result<T>;

fn terminal(message: impl Into<String>) -> RagError {
    Service::Generation.error(FailureKind::Terminal, message)
}

fn policy(config: &GenerationConfig) -> RetryPolicy {
    RetryPolicy::new(config.max_retries, config.backoff_ms, config.timeout_secs)
}

/// System message followed by the conversation, in chat-API shape.
fn chat_messages(request: &GenerationRequest) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    messages.push(serde_json::json!({"role": "system", "content": request.system}));
    for m in &request.messages {
        messages.push(serde_json::json!({"role": m.role.as_str(), "content": m.content}));
    }
    messages
}

// ============ Disabled Provider ============

pub struct DisabledGenerator;

#[async_trait]
impl GenerationProvider for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _request: &GenerationRequest) -> CoreResult<String> {
        Err(terminal("generation provider is disabled"))
    }
}

// ============ OpenAI Provider ============

/// Chat-completions provider. Requires `OPENAI_API_KEY`.
pub struct OpenAIGenerator {
    client: reqwest::Client,
    model: String,
    api_key: String,
    url: String,
    temperature: f32,
    policy: RetryPolicy,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config.url.as_deref().unwrap_or(OPENAI_DEFAULT_URL);
        let policy = policy(config);

        Ok(Self {
            client: build_client(Service::Generation, &policy)?,
            model,
            api_key,
            url: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            temperature: config.temperature,
            policy,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }
    async fn generate(&self, request: &GenerationRequest) -> CoreResult<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": chat_messages(request),
            "temperature": self.temperature,
        });
        let json = post_json(
            &self.client,
            Service::Generation,
            &self.url,
            Some(&self.api_key),
            &body,
            &self.policy,
        )
        .await?;
        parse_openai_completion(&json)
    }
}

/// Extract `choices[0].message.content`; a content-filter stop is terminal.
pub fn parse_openai_completion(json: &serde_json::Value) -> CoreResult<String> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| terminal("invalid OpenAI response: missing choices"))?;
    if choice.get("finish_reason").and_then(|f| f.as_str()) == Some("content_filter") {
        return Err(terminal("response blocked by content policy"));
    }
    Ok(choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string())
}

// ============ Ollama Provider ============

pub struct OllamaGenerator {
    client: reqwest::Client,
    model: String,
    url: String,
    temperature: f32,
    policy: RetryPolicy,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        let base = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("generation.url required for Ollama provider"))?;
        let policy = policy(config);

        Ok(Self {
            client: build_client(Service::Generation, &policy)?,
            model,
            url: format!("{}/api/chat", base.trim_end_matches('/')),
            temperature: config.temperature,
            policy,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }
    async fn generate(&self, request: &GenerationRequest) -> CoreResult<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": chat_messages(request),
            "stream": false,
            "options": {"temperature": self.temperature},
        });
        let json = post_json(
            &self.client,
            Service::Generation,
            &self.url,
            None,
            &body,
            &self.policy,
        )
        .await?;
        json.get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| terminal("invalid Ollama response: missing message content"))
    }
}

// ============ Extractive Provider ============

/// Offline generator that answers by quoting one supplied passage.
pub struct ExtractiveGenerator;

fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl GenerationProvider for ExtractiveGenerator {
    fn model_name(&self) -> &str {
        "extractive"
    }
    async fn generate(&self, request: &GenerationRequest) -> CoreResult<String> {
        let question = words(request.latest_user_message().unwrap_or_default());

        // Highest word overlap wins; ties keep retrieval order.
        let mut best: Option<(usize, usize)> = None;
        for (i, p) in request.passages.iter().enumerate() {
            let overlap = words(&p.text).intersection(&question).count();
            if best.map_or(true, |(_, score)| overlap > score) {
                best = Some((i, overlap));
            }
        }

        let Some((i, _)) = best else {
            return Ok("No relevant manual content found for this question.".to_string());
        };
        let passage = &request.passages[i];
        let excerpt: String = passage.text.trim().chars().take(EXTRACT_CHARS).collect();
        Ok(format!("{}\n{}", passage.tag(), excerpt))
    }
}

/// Create the configured generation provider.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledGenerator`] |
/// | `"openai"` | [`OpenAIGenerator`] |
/// | `"ollama"` | [`OllamaGenerator`] |
/// | `"extractive"` | [`ExtractiveGenerator`] |
pub fn create_provider(config: &GenerationConfig) -> Result<Arc<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "extractive" => Ok(Arc::new(ExtractiveGenerator)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
