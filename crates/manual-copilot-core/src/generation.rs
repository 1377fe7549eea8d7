//! Text-generation capability trait.
//!
//! The core never talks to a model directly. It hands a system context
//! and a conversation to a [`GenerationProvider`] and receives text back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One passage supplied in the grounding context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPassage {
    pub unit: String,
    pub filename: String,
    pub page: u32,
    pub text: String,
}

impl ContextPassage {
    /// Provenance tag that prefixes the passage in the context block,
    /// e.g. `[Unit 102 | press.pdf | Page 4]`.
    pub fn tag(&self) -> String {
        format!("[Unit {} | {} | Page {}]", self.unit, self.filename, self.page)
    }
}

/// Everything a generation backend needs for one answer.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// System instructions including the grounding context block.
    pub system: String,
    /// Prior turns followed by the current user message.
    pub messages: Vec<ChatMessage>,
    /// The passages rendered into `system`, in ranked order.
    pub passages: Vec<ContextPassage>,
}

impl GenerationRequest {
    /// The current user message (the last user turn).
    pub fn latest_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// Produces answer text from a system context and a conversation.
///
/// Failures are reported as [`crate::RagError::GenerationService`]:
/// transient for unavailability, terminal for quota exhaustion,
/// credential problems, or content-policy rejection.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"gpt-4o-mini"`).
    fn model_name(&self) -> &str;
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}
