//! One chat turn against the searchable manuals.
//!
//! Each turn takes a fresh registry snapshot, so a manual indexed or
//! deleted between turns is picked up without restarting.

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;

use manual_copilot_core::answer::Answer;
use manual_copilot_core::generation::ChatMessage;
use manual_copilot_core::pipeline::RagPipeline;
use manual_copilot_core::retrieve::RetrievalPlan;

use crate::registry::ManualRegistry;

/// Body of `POST /chat`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

pub struct ChatService {
    registry: ManualRegistry,
    pipeline: Arc<RagPipeline>,
}

impl ChatService {
    pub fn new(registry: ManualRegistry, pipeline: Arc<RagPipeline>) -> Self {
        Self { registry, pipeline }
    }

    pub async fn ask(&self, request: &ChatRequest) -> Result<Answer> {
        let snapshot = self.registry.snapshot().await?;
        let answer = self
            .pipeline
            .answer(&snapshot, &request.message, &request.history)
            .await?;
        Ok(answer)
    }

    /// Lookups `message` would trigger, without embedding or generating.
    pub async fn plan(&self, message: &str) -> Result<RetrievalPlan> {
        let snapshot = self.registry.snapshot().await?;
        Ok(self.pipeline.plan(&snapshot, message))
    }
}
