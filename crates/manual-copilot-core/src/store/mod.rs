//! Per-unit vector index abstraction.
//!
//! The [`UnitIndexStore`] trait models an arena of independent collections
//! keyed by unit number. Every operation is scoped to one unit, so a query
//! against unit A can never observe chunks owned by unit B.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](UnitIndexStore::upsert) | Replace a unit's whole collection atomically |
//! | [`query`](UnitIndexStore::query) | k nearest chunks within one unit |
//! | [`query_all`](UnitIndexStore::query_all) | Per-unit top-k across every unit |
//! | [`delete`](UnitIndexStore::delete) | Drop a unit's collection (no-op if absent) |
//! | [`units`](UnitIndexStore::units) | Units that currently have a collection |
//! | [`embedding_cache`](UnitIndexStore::embedding_cache) | Stored `(hash, model, vector)` per chunk id |

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{RagError, Result};
use crate::models::{Chunk, EmbeddedChunk};

/// A chunk returned by a nearest-neighbour query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine distance to the query vector. Lower is closer.
    pub distance: f32,
}

/// Outcome of querying one unit during a [`query_all`](UnitIndexStore::query_all) scan.
///
/// A failed unit carries its error instead of aborting the scan.
#[derive(Debug, Clone)]
pub struct UnitHits {
    pub unit: String,
    pub hits: Result<Vec<ScoredChunk>>,
}

/// Previously stored embedding of a chunk, keyed by chunk id in
/// [`UnitIndexStore::embedding_cache`].
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEmbedding {
    pub hash: String,
    /// Embedding model that produced `vector`.
    pub model: String,
    pub vector: Vec<f32>,
}

#[async_trait]
pub trait UnitIndexStore: Send + Sync {
    /// Replace the entire collection of `unit` with `chunks`.
    ///
    /// Readers see either the old or the new collection, never a mix.
    /// On error the previous collection is left intact and queryable.
    /// An empty slice stores an empty collection.
    async fn upsert(&self, unit: &str, chunks: &[EmbeddedChunk]) -> Result<()>;

    /// The `k` nearest chunks of `unit`, ordered by [`rank_hits`].
    ///
    /// An unknown unit yields an empty result.
    async fn query(&self, unit: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>>;

    /// Remove the collection of `unit`. A no-op if it does not exist.
    async fn delete(&self, unit: &str) -> Result<()>;

    /// Units that have a collection, sorted.
    async fn units(&self) -> Result<Vec<String>>;

    /// Chunk ids stored for `unit`, sorted.
    async fn chunk_ids(&self, unit: &str) -> Result<Vec<String>>;

    /// Stored embeddings of `unit`, keyed by chunk id.
    async fn embedding_cache(&self, unit: &str) -> Result<HashMap<String, CachedEmbedding>>;

    /// Query every unit independently and return per-unit results.
    ///
    /// Distances are never compared across units. A failure on one unit
    /// is reported in its [`UnitHits`] and does not stop the scan.
    async fn query_all(&self, vector: &[f32], k_per_unit: usize) -> Result<Vec<UnitHits>> {
        let units = self.units().await?;
        let mut out = Vec::with_capacity(units.len());
        for unit in units {
            let hits = self.query(&unit, vector, k_per_unit).await;
            out.push(UnitHits { unit, hits });
        }
        Ok(out)
    }
}

/// Order hits by ascending distance, then page, then sequence, and keep `k`.
pub fn rank_hits(mut hits: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    hits.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then(a.chunk.page.cmp(&b.chunk.page))
            .then(a.chunk.seq.cmp(&b.chunk.seq))
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    hits.truncate(k);
    hits
}

/// Reject chunks that belong to another unit or whose vectors disagree
/// on dimensionality.
pub fn check_collection(unit: &str, chunks: &[EmbeddedChunk]) -> Result<()> {
    let mut dims: Option<usize> = None;
    for ec in chunks {
        if ec.chunk.unit != unit {
            return Err(RagError::index_write(
                unit,
                format!("chunk {} belongs to unit {}", ec.chunk.id, ec.chunk.unit),
            ));
        }
        if ec.vector.is_empty() {
            return Err(RagError::index_write(
                unit,
                format!("chunk {} has an empty vector", ec.chunk.id),
            ));
        }
        match dims {
            None => dims = Some(ec.vector.len()),
            Some(d) if d != ec.vector.len() => {
                return Err(RagError::index_write(
                    unit,
                    format!(
                        "chunk {} has {} dims, expected {d}",
                        ec.chunk.id,
                        ec.vector.len()
                    ),
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}
