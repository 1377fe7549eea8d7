//! In-memory [`UnitIndexStore`] for tests and embedded use.
//!
//! Each unit owns an immutable [`UnitIndex`] behind an `Arc`. An upsert
//! builds the new collection off to the side and swaps the `Arc` under a
//! short write lock, so a concurrent reader holds either the old or the
//! new collection. Queries are brute-force cosine distance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::embedding::cosine_distance;
use crate::error::{RagError, Result};
use crate::models::EmbeddedChunk;

use super::{check_collection, rank_hits, CachedEmbedding, ScoredChunk, UnitIndexStore};

struct UnitIndex {
    entries: Vec<EmbeddedChunk>,
}

impl UnitIndex {
    fn dims(&self) -> Option<usize> {
        self.entries.first().map(|e| e.vector.len())
    }
}

/// In-memory arena of per-unit collections.
pub struct InMemoryStore {
    units: RwLock<HashMap<String, Arc<UnitIndex>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            units: RwLock::new(HashMap::new()),
        }
    }

    fn collection(&self, unit: &str) -> Result<Option<Arc<UnitIndex>>> {
        let units = self
            .units
            .read()
            .map_err(|_| RagError::index_read(unit, "index lock poisoned"))?;
        Ok(units.get(unit).cloned())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnitIndexStore for InMemoryStore {
    async fn upsert(&self, unit: &str, chunks: &[EmbeddedChunk]) -> Result<()> {
        check_collection(unit, chunks)?;

        let mut by_id: HashMap<&str, &EmbeddedChunk> = HashMap::with_capacity(chunks.len());
        for ec in chunks {
            if by_id.insert(ec.chunk.id.as_str(), ec).is_some() {
                return Err(RagError::index_write(
                    unit,
                    format!("duplicate chunk id {}", ec.chunk.id),
                ));
            }
        }

        let mut entries: Vec<EmbeddedChunk> = chunks.to_vec();
        entries.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));
        let index = Arc::new(UnitIndex { entries });

        let mut units = self
            .units
            .write()
            .map_err(|_| RagError::index_write(unit, "index lock poisoned"))?;
        units.insert(unit.to_string(), index);
        Ok(())
    }

    async fn query(&self, unit: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let Some(index) = self.collection(unit)? else {
            return Ok(Vec::new());
        };
        if let Some(dims) = index.dims() {
            if dims != vector.len() {
                return Err(RagError::index_read(
                    unit,
                    format!("query has {} dims, collection has {dims}", vector.len()),
                ));
            }
        }

        let hits = index
            .entries
            .iter()
            .map(|e| ScoredChunk {
                chunk: e.chunk.clone(),
                distance: cosine_distance(vector, &e.vector),
            })
            .collect();
        Ok(rank_hits(hits, k))
    }

    async fn delete(&self, unit: &str) -> Result<()> {
        let mut units = self
            .units
            .write()
            .map_err(|_| RagError::index_write(unit, "index lock poisoned"))?;
        units.remove(unit);
        Ok(())
    }

    async fn units(&self) -> Result<Vec<String>> {
        let units = self
            .units
            .read()
            .map_err(|_| RagError::index_read("all units", "index lock poisoned"))?;
        let mut out: Vec<String> = units.keys().cloned().collect();
        out.sort();
        Ok(out)
    }

    async fn chunk_ids(&self, unit: &str) -> Result<Vec<String>> {
        Ok(self
            .collection(unit)?
            .map(|index| index.entries.iter().map(|e| e.chunk.id.clone()).collect())
            .unwrap_or_default())
    }

    async fn embedding_cache(&self, unit: &str) -> Result<HashMap<String, CachedEmbedding>> {
        Ok(self
            .collection(unit)?
            .map(|index| {
                index
                    .entries
                    .iter()
                    .map(|e| {
                        (
                            e.chunk.id.clone(),
                            CachedEmbedding {
                                hash: e.chunk.hash.clone(),
                                model: e.model.clone(),
                                vector: e.vector.clone(),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::make_chunk;

    fn embedded(unit: &str, page: u32, seq: u32, text: &str, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: make_chunk(unit, page, seq, 0, text.chars().count(), text),
            model: "test".to_string(),
            vector,
        }
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .upsert(
                "102",
                &[
                    embedded("102", 1, 0, "hydraulic pressure 3000 psi", vec![1.0, 0.0, 0.0]),
                    embedded("102", 2, 0, "engine oil 15W-40", vec![0.0, 1.0, 0.0]),
                    embedded("102", 3, 0, "drive belt tension", vec![0.7, 0.7, 0.0]),
                ],
            )
            .await
            .unwrap();
        store
            .upsert(
                "205",
                &[embedded("205", 1, 0, "return hose 3/4 inch", vec![1.0, 0.0, 0.0])],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_query_is_scoped_to_unit() {
        let store = seeded().await;
        let hits = store.query("102", &[1.0, 0.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.chunk.unit == "102"));
        assert_eq!(hits[0].chunk.page, 1);
    }

    #[tokio::test]
    async fn test_query_deterministic() {
        let store = seeded().await;
        let a = store.query("102", &[0.5, 0.5, 0.0], 2).await.unwrap();
        let b = store.query("102", &[0.5, 0.5, 0.0], 2).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].chunk.page, 3);
    }

    #[tokio::test]
    async fn test_upsert_replaces_whole_collection() {
        let store = seeded().await;
        store
            .upsert("102", &[embedded("102", 7, 0, "new", vec![0.0, 0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(store.chunk_ids("102").await.unwrap(), vec!["unit_102_p7_c0"]);
    }

    #[tokio::test]
    async fn test_failed_upsert_keeps_previous_collection() {
        let store = seeded().await;
        let dup = embedded("102", 9, 0, "dup", vec![0.0, 0.0, 1.0]);
        let err = store.upsert("102", &[dup.clone(), dup]).await.unwrap_err();
        assert!(matches!(err, RagError::IndexWrite { .. }));
        assert_eq!(store.chunk_ids("102").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_and_unknown_unit() {
        let store = seeded().await;
        store.delete("102").await.unwrap();
        store.delete("102").await.unwrap();
        assert_eq!(store.units().await.unwrap(), vec!["205"]);
        assert!(store.query("102", &[1.0, 0.0, 0.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_all_tags_units() {
        let store = seeded().await;
        let all = store.query_all(&[1.0, 0.0, 0.0], 1).await.unwrap();
        let units: Vec<&str> = all.iter().map(|u| u.unit.as_str()).collect();
        assert_eq!(units, vec!["102", "205"]);
        for unit_hits in &all {
            let hits = unit_hits.hits.as_ref().unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].chunk.unit, unit_hits.unit);
        }
    }

    #[tokio::test]
    async fn test_dims_mismatch_is_read_error() {
        let store = seeded().await;
        let err = store.query("102", &[1.0, 0.0], 5).await.unwrap_err();
        assert!(matches!(err, RagError::IndexRead { .. }));
    }

    #[tokio::test]
    async fn test_embedding_cache_carries_hash() {
        let store = seeded().await;
        let cache = store.embedding_cache("205").await.unwrap();
        let cached = &cache["unit_205_p1_c0"];
        assert_eq!(cached.hash, crate::chunk::text_hash("return hose 3/4 inch"));
        assert_eq!(cached.model, "test");
        assert_eq!(cached.vector, vec![1.0, 0.0, 0.0]);
    }
}
