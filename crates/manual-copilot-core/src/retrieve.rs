//! Retrieval orchestration: direct unit lookups plus cross-reference scans.
//!
//! Retrieval is split into a pure planning step and an executing step.
//!
//! # Planning
//!
//! [`plan`] validates detected units against the registry snapshot and
//! decides whether a scan across all units is needed:
//!
//! | Known units detected | Trigger term | Direct lookups | Scan |
//! |----------------------|--------------|----------------|------|
//! | yes | no  | yes | none |
//! | yes | yes | yes | [`RetrievalMode::CrossReference`] |
//! | no  | yes | no  | [`RetrievalMode::Fallback`] |
//! | no  | no  | no  | [`RetrievalMode::Fallback`] |
//!
//! Unknown units are dropped silently.
//!
//! # Ranking
//!
//! Direct results come first, unit by unit in order of mention, each unit
//! in store order (ascending distance). Scan results follow, interleaved
//! round-robin by rank over units in sorted order, so no distance is ever
//! compared across units. Duplicates by chunk id are dropped (first
//! occurrence wins) and the list is capped at `max_passages`.
//!
//! # Failure
//!
//! A failed lookup on one unit is logged and skipped. Only when every
//! attempted lookup fails does retrieval return
//! [`RagError::SearchUnavailable`].

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::error::{RagError, Result};
use crate::models::{Chunk, RegistrySnapshot};
use crate::query::QueryAnalysis;
use crate::store::{ScoredChunk, UnitIndexStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalParams {
    /// Passages per directly mentioned unit.
    pub direct_k: usize,
    /// Passages per unit during a scan.
    pub cross_k_per_unit: usize,
    /// Cap on the merged passage list.
    pub max_passages: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            direct_k: 5,
            cross_k_per_unit: 5,
            max_passages: 10,
        }
    }
}

/// Why a passage was retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// From the index of a unit named in the message.
    Direct,
    /// From a scan triggered by a cross-reference term alongside a named unit.
    CrossReference,
    /// From a scan because no known unit was named.
    Fallback,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Direct => "direct",
            RetrievalMode::CrossReference => "cross_reference",
            RetrievalMode::Fallback => "fallback",
        }
    }
}

/// The lookups one chat turn will perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalPlan {
    /// Registry keys to query directly, in order of mention.
    pub direct_units: Vec<String>,
    /// Detected candidates that matched no searchable manual.
    pub dropped_units: Vec<String>,
    /// Scan across all units, if any, and why.
    pub scan: Option<RetrievalMode>,
}

/// A chunk selected for the grounding context.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedPassage {
    pub chunk: Chunk,
    pub distance: f32,
    pub mode: RetrievalMode,
}

/// Per-turn retrieval result.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryContext {
    /// Candidate units detected in the message, before validation.
    pub units: Vec<String>,
    pub cross_reference: bool,
    pub plan: RetrievalPlan,
    /// Ranked, deduplicated, capped.
    pub passages: Vec<RetrievedPassage>,
}

/// Decide which lookups to run for `analysis` against `snapshot`.
pub fn plan(analysis: &QueryAnalysis, snapshot: &RegistrySnapshot) -> RetrievalPlan {
    let mut direct_units: Vec<String> = Vec::new();
    let mut dropped_units = Vec::new();

    for candidate in &analysis.units {
        match snapshot.resolve(candidate) {
            Some(unit) => {
                if !direct_units.iter().any(|u| u == unit) {
                    direct_units.push(unit.to_string());
                }
            }
            None => dropped_units.push(candidate.clone()),
        }
    }

    // With no known unit the scan is the only source, trigger or not.
    let scan = if direct_units.is_empty() {
        Some(RetrievalMode::Fallback)
    } else if analysis.cross_reference {
        Some(RetrievalMode::CrossReference)
    } else {
        None
    };

    RetrievalPlan {
        direct_units,
        dropped_units,
        scan,
    }
}

pub struct Retriever<'a> {
    store: &'a dyn UnitIndexStore,
    params: RetrievalParams,
}

impl<'a> Retriever<'a> {
    pub fn new(store: &'a dyn UnitIndexStore, params: RetrievalParams) -> Self {
        Self { store, params }
    }

    /// Run the plan for `analysis` with the query `vector`.
    pub async fn retrieve(
        &self,
        analysis: &QueryAnalysis,
        snapshot: &RegistrySnapshot,
        vector: &[f32],
    ) -> Result<QueryContext> {
        let plan = plan(analysis, snapshot);
        tracing::debug!(
            direct = ?plan.direct_units,
            dropped = ?plan.dropped_units,
            scan = ?plan.scan,
            "retrieval plan"
        );

        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut merged = Merger::new(self.params.max_passages);

        for unit in &plan.direct_units {
            attempted += 1;
            match self.store.query(unit, vector, self.params.direct_k).await {
                Ok(hits) => merged.extend(hits, RetrievalMode::Direct),
                Err(e) => {
                    failed += 1;
                    tracing::warn!(unit = %unit, error = %e, "direct lookup failed, skipping unit");
                }
            }
        }

        if let Some(mode) = plan.scan {
            match self.store.query_all(vector, self.params.cross_k_per_unit).await {
                Ok(all) => {
                    let mut per_unit: BTreeMap<String, Vec<ScoredChunk>> = BTreeMap::new();
                    for unit_hits in all {
                        if !snapshot.contains(&unit_hits.unit) {
                            continue;
                        }
                        attempted += 1;
                        match unit_hits.hits {
                            Ok(hits) => {
                                per_unit.insert(unit_hits.unit, hits);
                            }
                            Err(e) => {
                                failed += 1;
                                tracing::warn!(
                                    unit = %unit_hits.unit,
                                    error = %e,
                                    "scan lookup failed, skipping unit"
                                );
                            }
                        }
                    }
                    merged.extend(interleave(per_unit), mode);
                }
                Err(e) => {
                    attempted += 1;
                    failed += 1;
                    tracing::warn!(error = %e, "unit scan failed");
                }
            }
        }

        if attempted > 0 && failed == attempted {
            return Err(RagError::SearchUnavailable { attempted, failed });
        }

        let passages = merged.finish();
        tracing::debug!(passages = passages.len(), attempted, failed, "retrieval complete");

        Ok(QueryContext {
            units: analysis.units.clone(),
            cross_reference: analysis.cross_reference,
            plan,
            passages,
        })
    }
}

/// Round-robin by rank over units in key order.
fn interleave(per_unit: BTreeMap<String, Vec<ScoredChunk>>) -> Vec<ScoredChunk> {
    let mut iters: Vec<_> = per_unit.into_values().map(Vec::into_iter).collect();
    let mut out = Vec::new();
    loop {
        let mut progressed = false;
        for it in iters.iter_mut() {
            if let Some(hit) = it.next() {
                out.push(hit);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    out
}

struct Merger {
    seen: HashSet<String>,
    passages: Vec<RetrievedPassage>,
    cap: usize,
}

impl Merger {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            passages: Vec::new(),
            cap,
        }
    }

    fn extend(&mut self, hits: Vec<ScoredChunk>, mode: RetrievalMode) {
        for hit in hits {
            if self.seen.insert(hit.chunk.id.clone()) {
                self.passages.push(RetrievedPassage {
                    chunk: hit.chunk,
                    distance: hit.distance,
                    mode,
                });
            }
        }
    }

    fn finish(mut self) -> Vec<RetrievedPassage> {
        self.passages.truncate(self.cap);
        self.passages
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::chunk::make_chunk;
    use crate::models::EmbeddedChunk;
    use crate::store::memory::InMemoryStore;
    use crate::store::CachedEmbedding;

    fn embedded(unit: &str, page: u32, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: make_chunk(unit, page, 0, 0, 4, &format!("unit {unit} page {page}")),
            model: "test".to_string(),
            vector,
        }
    }

    async fn two_unit_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .upsert(
                "102",
                &[
                    embedded("102", 1, vec![1.0, 0.0]),
                    embedded("102", 2, vec![0.8, 0.2]),
                    embedded("102", 3, vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        store
            .upsert(
                "205",
                &[embedded("205", 1, vec![0.9, 0.1]), embedded("205", 2, vec![0.1, 0.9])],
            )
            .await
            .unwrap();
        store
    }

    fn snapshot() -> RegistrySnapshot {
        RegistrySnapshot::new()
            .with_unit("102", "press.pdf")
            .with_unit("205", "loader.pdf")
    }

    fn analysis(units: &[&str], cross_reference: bool) -> QueryAnalysis {
        QueryAnalysis {
            units: units.iter().map(|u| u.to_string()).collect(),
            cross_reference,
        }
    }

    fn params(direct_k: usize, cross_k_per_unit: usize, max_passages: usize) -> RetrievalParams {
        RetrievalParams {
            direct_k,
            cross_k_per_unit,
            max_passages,
        }
    }

    /// Fails every query for one unit.
    struct FlakyStore {
        inner: InMemoryStore,
        broken: &'static str,
    }

    #[async_trait]
    impl UnitIndexStore for FlakyStore {
        async fn upsert(&self, unit: &str, chunks: &[EmbeddedChunk]) -> Result<()> {
            self.inner.upsert(unit, chunks).await
        }
        async fn query(&self, unit: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
            if unit == self.broken || self.broken == "*" {
                return Err(RagError::index_read(unit, "disk I/O error"));
            }
            self.inner.query(unit, vector, k).await
        }
        async fn delete(&self, unit: &str) -> Result<()> {
            self.inner.delete(unit).await
        }
        async fn units(&self) -> Result<Vec<String>> {
            self.inner.units().await
        }
        async fn chunk_ids(&self, unit: &str) -> Result<Vec<String>> {
            self.inner.chunk_ids(unit).await
        }
        async fn embedding_cache(&self, unit: &str) -> Result<HashMap<String, CachedEmbedding>> {
            self.inner.embedding_cache(unit).await
        }
    }

    #[test]
    fn test_plan_table() {
        let snap = snapshot();
        assert_eq!(plan(&analysis(&["102"], false), &snap).scan, None);
        assert_eq!(
            plan(&analysis(&["102"], true), &snap).scan,
            Some(RetrievalMode::CrossReference)
        );
        assert_eq!(plan(&analysis(&[], true), &snap).scan, Some(RetrievalMode::Fallback));
        assert_eq!(plan(&analysis(&[], false), &snap).scan, Some(RetrievalMode::Fallback));
    }

    #[test]
    fn test_plan_drops_unknown_units_then_falls_back() {
        let p = plan(&analysis(&["999", "2024"], false), &snapshot());
        assert!(p.direct_units.is_empty());
        assert_eq!(p.dropped_units, vec!["999", "2024"]);
        assert_eq!(p.scan, Some(RetrievalMode::Fallback));
    }

    #[test]
    fn test_plan_resolves_case_and_dedups() {
        let snap = RegistrySnapshot::new().with_unit("AB12", "a.pdf");
        let p = plan(&analysis(&["ab12", "AB12"], false), &snap);
        assert_eq!(p.direct_units, vec!["AB12"]);
    }

    #[tokio::test]
    async fn test_direct_only_queries_named_unit() {
        let store = two_unit_store().await;
        let ctx = Retriever::new(&store, params(5, 5, 10))
            .retrieve(&analysis(&["102"], false), &snapshot(), &[1.0, 0.0])
            .await
            .unwrap();
        assert_eq!(ctx.passages.len(), 3);
        assert!(ctx.passages.iter().all(|p| p.chunk.unit == "102"));
        assert!(ctx.passages.iter().all(|p| p.mode == RetrievalMode::Direct));
        assert_eq!(ctx.passages[0].chunk.page, 1);
    }

    #[tokio::test]
    async fn test_cross_reference_appends_after_direct_without_duplicates() {
        let store = two_unit_store().await;
        let ctx = Retriever::new(&store, params(2, 2, 10))
            .retrieve(&analysis(&["102"], true), &snapshot(), &[1.0, 0.0])
            .await
            .unwrap();

        let ids: Vec<&str> = ctx.passages.iter().map(|p| p.chunk.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["unit_102_p1_c0", "unit_102_p2_c0", "unit_205_p1_c0", "unit_205_p2_c0"]
        );
        assert_eq!(ctx.passages[0].mode, RetrievalMode::Direct);
        assert_eq!(ctx.passages[2].mode, RetrievalMode::CrossReference);
    }

    #[tokio::test]
    async fn test_fallback_interleaves_units_and_caps() {
        let store = two_unit_store().await;
        let ctx = Retriever::new(&store, params(5, 5, 3))
            .retrieve(&analysis(&[], false), &snapshot(), &[1.0, 0.0])
            .await
            .unwrap();
        let ids: Vec<&str> = ctx.passages.iter().map(|p| p.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["unit_102_p1_c0", "unit_205_p1_c0", "unit_102_p2_c0"]);
        assert!(ctx.passages.iter().all(|p| p.mode == RetrievalMode::Fallback));
    }

    #[tokio::test]
    async fn test_scan_skips_units_missing_from_snapshot() {
        let store = two_unit_store().await;
        let snap = RegistrySnapshot::new().with_unit("205", "loader.pdf");
        let ctx = Retriever::new(&store, params(5, 5, 10))
            .retrieve(&analysis(&[], false), &snap, &[1.0, 0.0])
            .await
            .unwrap();
        assert!(ctx.passages.iter().all(|p| p.chunk.unit == "205"));
    }

    #[tokio::test]
    async fn test_one_failing_unit_degrades() {
        let store = FlakyStore {
            inner: two_unit_store().await,
            broken: "205",
        };
        let ctx = Retriever::new(&store, params(5, 5, 10))
            .retrieve(&analysis(&["102"], true), &snapshot(), &[1.0, 0.0])
            .await
            .unwrap();
        assert_eq!(ctx.passages.len(), 3);
        assert!(ctx.passages.iter().all(|p| p.chunk.unit == "102"));
    }

    #[tokio::test]
    async fn test_all_lookups_failing_is_search_unavailable() {
        let store = FlakyStore {
            inner: two_unit_store().await,
            broken: "*",
        };
        let err = Retriever::new(&store, params(5, 5, 10))
            .retrieve(&analysis(&["102"], true), &snapshot(), &[1.0, 0.0])
            .await
            .unwrap_err();
        match err {
            RagError::SearchUnavailable { attempted, failed } => {
                assert_eq!((attempted, failed), (3, 3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_registry_is_not_an_error() {
        let store = InMemoryStore::new();
        let ctx = Retriever::new(&store, RetrievalParams::default())
            .retrieve(&analysis(&[], false), &RegistrySnapshot::new(), &[1.0, 0.0])
            .await
            .unwrap();
        assert!(ctx.passages.is_empty());
        assert_eq!(ctx.plan.scan, Some(RetrievalMode::Fallback));
    }
}
