//! Application wiring shared by the CLI and the HTTP server.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use manual_copilot_core::pipeline::RagPipeline;
use manual_copilot_core::query::QueryAnalyzer;

use crate::chat::ChatService;
use crate::config::Config;
use crate::ingest::ManualService;
use crate::registry::ManualRegistry;
use crate::sqlite_store::SqliteStore;
use crate::{db, embedding, generation, migrate};

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub store: Arc<SqliteStore>,
    pub manuals: ManualService,
    pub chat: ChatService,
}

impl App {
    /// Open the database, apply migrations and build the providers.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let store = Arc::new(SqliteStore::new(pool.clone()));
        let embedder = embedding::create_provider(&config.embedding)
            .context("Failed to create embedding provider")?;
        let generator = generation::create_provider(&config.generation)
            .context("Failed to create generation provider")?;
        let analyzer = QueryAnalyzer::new(
            &config.retrieval.trigger_terms,
            config.retrieval.min_standalone_digits,
        )?;

        let pipeline = Arc::new(RagPipeline::new(
            store.clone(),
            embedder,
            generator,
            analyzer,
            config.pipeline_settings(),
        )?);
        let registry = ManualRegistry::new(pool.clone());

        Ok(Self {
            config: config.clone(),
            manuals: ManualService::new(
                registry.clone(),
                pipeline.clone(),
                config.storage.manuals_dir.clone(),
            ),
            chat: ChatService::new(registry, pipeline),
            pool,
            store,
        })
    }
}
