use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use manual_copilot_core::answer::AssemblyParams;
use manual_copilot_core::chunk::ChunkingParams;
use manual_copilot_core::pipeline::PipelineSettings;
use manual_copilot_core::query::DEFAULT_TRIGGER_TERMS;
use manual_copilot_core::retrieve::RetrievalParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding the original uploaded manuals.
    pub manuals_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_chunk_chars() -> usize {
    800
}
fn default_overlap_chars() -> usize {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub direct_k: usize,
    #[serde(default = "default_k")]
    pub cross_k_per_unit: usize,
    #[serde(default = "default_max_passages")]
    pub max_passages: usize,
    #[serde(default = "default_trigger_terms")]
    pub trigger_terms: Vec<String>,
    #[serde(default = "default_min_standalone_digits")]
    pub min_standalone_digits: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            direct_k: default_k(),
            cross_k_per_unit: default_k(),
            max_passages: default_max_passages(),
            trigger_terms: default_trigger_terms(),
            min_standalone_digits: default_min_standalone_digits(),
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_max_passages() -> usize {
    10
}
fn default_trigger_terms() -> Vec<String> {
    DEFAULT_TRIGGER_TERMS.iter().map(|t| t.to_string()).collect()
}
fn default_min_standalone_digits() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnswerConfig {
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            max_context_chars: default_max_context_chars(),
            max_history_turns: default_max_history_turns(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

fn default_max_context_chars() -> usize {
    12_000
}
fn default_max_history_turns() -> usize {
    10
}
fn default_snippet_chars() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (required for `ollama`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            backoff_ms: 1000,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_backoff_ms() -> u64 {
    1000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_retries: default_generation_retries(),
            timeout_secs: default_generation_timeout_secs(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_temperature() -> f32 {
    0.2
}
fn default_generation_retries() -> u32 {
    3
}
fn default_generation_timeout_secs() -> u64 {
    60
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8088".to_string()
}
fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

impl Config {
    /// Default settings for every section, rooted at the given paths.
    pub fn with_paths(db_path: impl Into<PathBuf>, manuals_dir: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            storage: StorageConfig {
                manuals_dir: manuals_dir.into(),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            answer: AnswerConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            chunking: ChunkingParams {
                chunk_chars: self.chunking.chunk_chars,
                overlap_chars: self.chunking.overlap_chars,
            },
            retrieval: RetrievalParams {
                direct_k: self.retrieval.direct_k,
                cross_k_per_unit: self.retrieval.cross_k_per_unit,
                max_passages: self.retrieval.max_passages,
            },
            assembly: AssemblyParams {
                max_context_chars: self.answer.max_context_chars,
                max_history_turns: self.answer.max_history_turns,
                snippet_chars: self.answer.snippet_chars,
            },
            embed_batch_size: self.embedding.batch_size,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.chunk_chars == 0 {
        anyhow::bail!("chunking.chunk_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.chunk_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.chunk_chars");
    }

    // Validate retrieval
    if config.retrieval.direct_k == 0 || config.retrieval.cross_k_per_unit == 0 {
        anyhow::bail!("retrieval.direct_k and retrieval.cross_k_per_unit must be >= 1");
    }
    if config.retrieval.max_passages == 0 {
        anyhow::bail!("retrieval.max_passages must be >= 1");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() && config.embedding.provider != "hashed" {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "hashed" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hashed.",
            other
        ),
    }
    if config.embedding.provider == "ollama" && config.embedding.url.is_none() {
        anyhow::bail!("embedding.url must be specified when provider is 'ollama'");
    }

    // Validate generation
    match config.generation.provider.as_str() {
        "disabled" | "extractive" => {}
        "openai" | "ollama" => {
            if config.generation.model.is_none() {
                anyhow::bail!(
                    "generation.model must be specified when provider is '{}'",
                    config.generation.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, ollama, or extractive.",
            other
        ),
    }
    if config.generation.provider == "ollama" && config.generation.url.is_none() {
        anyhow::bail!("generation.url must be specified when provider is 'ollama'");
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }

    Ok(config)
}
