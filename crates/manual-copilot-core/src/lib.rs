//! # Manual Copilot Core
//!
//! Retrieval-augmented answering over per-unit equipment manuals:
//! chunking, the per-unit index store abstraction, query analysis,
//! retrieval orchestration, and answer assembly with citation checks.
//!
//! This crate contains no tokio, sqlx, HTTP clients, or filesystem I/O.
//! Embedding and generation services are reached only through the
//! [`embedding::EmbeddingProvider`] and [`generation::GenerationProvider`]
//! traits, so tests can substitute deterministic fakes.
//!
//! ## Data Flow
//!
//! ```text
//! ingest:  pages ─▶ chunk ─▶ embed ─▶ UnitIndexStore::upsert
//! answer:  message ─▶ QueryAnalyzer ─▶ Retriever ─▶ AnswerAssembler ─▶ Answer
//!                                         │
//!                                         └─ embed(query) + store.query / query_all
//! ```

pub mod answer;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod retrieve;
pub mod store;

pub use error::{FailureKind, RagError, Result};
