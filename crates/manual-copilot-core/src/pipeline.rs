//! The two entry points of the core: `ingest` and `answer`.
//!
//! [`RagPipeline`] wires the chunker, the embedding capability, a
//! [`UnitIndexStore`], the query analyzer, the retriever and the answer
//! assembler together. It holds no per-request state and is shared
//! behind an `Arc` by the ingest and chat services.

use std::sync::Arc;

use serde::Serialize;

use crate::answer::{Answer, AnswerAssembler, AssemblyParams, CitationExtractor};
use crate::chunk::{chunk_pages, ChunkingParams};
use crate::embedding::{embed_checked, embed_query, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::generation::{ChatMessage, GenerationProvider};
use crate::models::{EmbeddedChunk, Page, RegistrySnapshot};
use crate::query::{QueryAnalysis, QueryAnalyzer};
use crate::retrieve::{self, QueryContext, RetrievalParams, RetrievalPlan, Retriever};
use crate::store::UnitIndexStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub chunking: ChunkingParams,
    pub retrieval: RetrievalParams,
    pub assembly: AssemblyParams,
    /// Texts per embedding request during ingestion.
    pub embed_batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunking: ChunkingParams::default(),
            retrieval: RetrievalParams::default(),
            assembly: AssemblyParams::default(),
            embed_batch_size: 64,
        }
    }
}

/// Outcome of indexing one manual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub unit: String,
    pub pages: usize,
    pub chunks: usize,
    /// Chunks sent to the embedding capability.
    pub embedded: usize,
    /// Chunks whose stored vector was reused.
    pub reused: usize,
}

pub struct RagPipeline {
    store: Arc<dyn UnitIndexStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
    analyzer: QueryAnalyzer,
    citations: CitationExtractor,
    settings: PipelineSettings,
}

impl RagPipeline {
    pub fn new(
        store: Arc<dyn UnitIndexStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        analyzer: QueryAnalyzer,
        settings: PipelineSettings,
    ) -> Result<Self> {
        if settings.chunking.chunk_chars == 0 {
            return Err(RagError::InvalidInput("chunk_chars must be > 0".to_string()));
        }
        Ok(Self {
            store,
            embedder,
            generator,
            analyzer,
            citations: CitationExtractor::new()?,
            settings,
        })
    }

    pub fn store(&self) -> &Arc<dyn UnitIndexStore> {
        &self.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Chunk, embed and index the pages of one manual, replacing the
    /// unit's collection as a whole.
    ///
    /// Pages without text yield an empty collection, not an error. Any
    /// failure leaves the previous collection untouched.
    pub async fn ingest(&self, unit: &str, pages: &[Page]) -> Result<IngestReport> {
        if unit.trim().is_empty() {
            return Err(RagError::InvalidInput("unit must not be empty".to_string()));
        }

        let chunks = chunk_pages(unit, pages, &self.settings.chunking);
        if chunks.is_empty() {
            let empty = RagError::ExtractionEmpty {
                unit: unit.to_string(),
            };
            tracing::warn!(unit, pages = pages.len(), "{empty}");
        }

        let cache = match self.store.embedding_cache(unit).await {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!(unit, error = %e, "embedding cache unavailable, embedding all chunks");
                Default::default()
            }
        };

        let dims = self.embedder.dims();
        let model = self.embedder.model_name();
        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(chunks.len());
        let mut pending: Vec<usize> = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            match cache.get(&chunk.id) {
                Some(cached)
                    if cached.hash == chunk.hash
                        && cached.model == model
                        && cached.vector.len() == dims =>
                {
                    vectors.push(Some(cached.vector.clone()));
                }
                _ => {
                    vectors.push(None);
                    pending.push(i);
                }
            }
        }
        let reused = chunks.len() - pending.len();

        let batch_size = self.settings.embed_batch_size.max(1);
        for batch in pending.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|&i| chunks[i].text.clone()).collect();
            let embedded = embed_checked(self.embedder.as_ref(), &texts).await?;
            for (&i, vector) in batch.iter().zip(embedded) {
                vectors[i] = Some(vector);
            }
            tracing::debug!(unit, batch = batch.len(), "embedded batch");
        }

        let mut collection = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            let Some(vector) = vector else {
                return Err(RagError::index_write(
                    unit,
                    format!("chunk {} has no embedding", chunk.id),
                ));
            };
            collection.push(EmbeddedChunk {
                chunk,
                model: model.to_string(),
                vector,
            });
        }

        self.store.upsert(unit, &collection).await?;

        let report = IngestReport {
            unit: unit.to_string(),
            pages: pages.len(),
            chunks: collection.len(),
            embedded: pending.len(),
            reused,
        };
        tracing::info!(
            unit,
            pages = report.pages,
            chunks = report.chunks,
            embedded = report.embedded,
            reused = report.reused,
            "indexed manual"
        );
        Ok(report)
    }

    /// Remove the collection of `unit`. A no-op if it does not exist.
    pub async fn remove(&self, unit: &str) -> Result<()> {
        self.store.delete(unit).await
    }

    pub fn analyze(&self, message: &str) -> QueryAnalysis {
        self.analyzer.analyze(message)
    }

    /// The lookups `message` would trigger, without running them.
    pub fn plan(&self, snapshot: &RegistrySnapshot, message: &str) -> RetrievalPlan {
        retrieve::plan(&self.analyze(message), snapshot)
    }

    /// Analyze `message`, embed it, and retrieve passages.
    ///
    /// With no searchable manuals the query is not embedded at all.
    pub async fn retrieve(&self, snapshot: &RegistrySnapshot, message: &str) -> Result<QueryContext> {
        let analysis = self.analyze(message);
        if snapshot.is_empty() {
            return Ok(QueryContext {
                units: analysis.units.clone(),
                cross_reference: analysis.cross_reference,
                plan: retrieve::plan(&analysis, snapshot),
                passages: Vec::new(),
            });
        }

        let vector = embed_query(self.embedder.as_ref(), message).await?;
        Retriever::new(self.store.as_ref(), self.settings.retrieval)
            .retrieve(&analysis, snapshot, &vector)
            .await
    }

    /// Answer one chat turn grounded in the manuals of `snapshot`.
    pub async fn answer(
        &self,
        snapshot: &RegistrySnapshot,
        message: &str,
        history: &[ChatMessage],
    ) -> Result<Answer> {
        if message.trim().is_empty() {
            return Err(RagError::InvalidInput("message must not be empty".to_string()));
        }

        let context = self.retrieve(snapshot, message).await?;
        tracing::info!(
            units = ?context.units,
            cross_reference = context.cross_reference,
            scan = ?context.plan.scan,
            passages = context.passages.len(),
            "retrieved context"
        );

        AnswerAssembler::new(self.generator.as_ref(), &self.citations, self.settings.assembly)
            .assemble(&context.passages, snapshot, message, history)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::generation::GenerationRequest;
    use crate::store::memory::InMemoryStore;

    /// Counts letters a..z; texts about the same thing land close together.
    struct LetterEmbedder {
        model: &'static str,
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    impl LetterEmbedder {
        fn new() -> Self {
            Self::named("letters")
        }

        fn named(model: &'static str) -> Self {
            Self {
                model,
                calls: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LetterEmbedder {
        fn model_name(&self) -> &str {
            self.model
        }
        fn dims(&self) -> usize {
            26
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 26];
                    for c in t.to_ascii_lowercase().bytes() {
                        if c.is_ascii_lowercase() {
                            v[(c - b'a') as usize] += 1.0;
                        }
                    }
                    v[0] += 0.01;
                    v
                })
                .collect())
        }
    }

    struct EchoFirstSource;

    #[async_trait]
    impl GenerationProvider for EchoFirstSource {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            Ok(match request.passages.first() {
                Some(p) => format!("{} {}", p.text, p.tag()),
                None => "nothing found".to_string(),
            })
        }
    }

    fn pipeline(embedder: Arc<LetterEmbedder>, batch: usize) -> RagPipeline {
        pipeline_on(Arc::new(InMemoryStore::new()), embedder, batch)
    }

    fn pipeline_on(
        store: Arc<InMemoryStore>,
        embedder: Arc<LetterEmbedder>,
        batch: usize,
    ) -> RagPipeline {
        RagPipeline::new(
            store,
            embedder,
            Arc::new(EchoFirstSource),
            QueryAnalyzer::with_defaults().unwrap(),
            PipelineSettings {
                embed_batch_size: batch,
                ..PipelineSettings::default()
            },
        )
        .unwrap()
    }

    fn press_pages() -> Vec<Page> {
        vec![
            Page::new(1, "Hydraulic relief valve setting is 3000 psi."),
            Page::new(2, "Replace the return hose every 500 hours."),
            Page::new(3, "   "),
        ]
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent_and_reuses_vectors() {
        let embedder = Arc::new(LetterEmbedder::new());
        let p = pipeline(embedder.clone(), 64);

        let first = p.ingest("102", &press_pages()).await.unwrap();
        let ids_first = p.store().chunk_ids("102").await.unwrap();
        let second = p.ingest("102", &press_pages()).await.unwrap();
        let ids_second = p.store().chunk_ids("102").await.unwrap();

        assert_eq!(first.chunks, 2);
        assert_eq!(ids_first, ids_second);
        assert_eq!(first.embedded, 2);
        assert_eq!(second.embedded, 0);
        assert_eq!(second.reused, 2);
        assert_eq!(embedder.texts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_model_switch_reembeds_every_chunk() {
        let store = Arc::new(InMemoryStore::new());
        let first = pipeline_on(store.clone(), Arc::new(LetterEmbedder::new()), 64);
        first.ingest("102", &press_pages()).await.unwrap();

        let switched = Arc::new(LetterEmbedder::named("other-letters"));
        let second = pipeline_on(store.clone(), switched.clone(), 64);
        let report = second.ingest("102", &press_pages()).await.unwrap();

        assert_eq!(report.embedded, 2);
        assert_eq!(report.reused, 0);
        assert_eq!(switched.texts.load(Ordering::SeqCst), 2);
        let cache = store.embedding_cache("102").await.unwrap();
        assert!(cache.values().all(|c| c.model == "other-letters"));
    }

    #[tokio::test]
    async fn test_ingest_batches_embedding_calls() {
        let embedder = Arc::new(LetterEmbedder::new());
        let p = pipeline(embedder.clone(), 1);
        p.ingest("102", &press_pages()).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_extraction_indexes_empty_collection() {
        let p = pipeline(Arc::new(LetterEmbedder::new()), 64);
        let report = p.ingest("205", &[]).await.unwrap();
        assert_eq!(report.chunks, 0);
        assert_eq!(p.store().units().await.unwrap(), vec!["205"]);
    }

    #[tokio::test]
    async fn test_answer_cites_direct_unit() {
        let p = pipeline(Arc::new(LetterEmbedder::new()), 64);
        p.ingest("102", &press_pages()).await.unwrap();
        p.ingest("205", &[Page::new(1, "Loader bucket pins need grease.")])
            .await
            .unwrap();
        let snapshot = RegistrySnapshot::new()
            .with_unit("102", "press.pdf")
            .with_unit("205", "loader.pdf");

        let answer = p
            .answer(&snapshot, "What is the hydraulic relief valve setting for unit 102?", &[])
            .await
            .unwrap();
        assert!(answer.grounded);
        assert!(answer.verified);
        assert!(answer.sources.iter().all(|s| s.unit == "102"));
        assert_eq!(answer.citations[0].unit, "102");
    }

    #[tokio::test]
    async fn test_answer_with_empty_registry_is_ungrounded() {
        let embedder = Arc::new(LetterEmbedder::new());
        let p = pipeline(embedder.clone(), 64);
        let answer = p.answer(&RegistrySnapshot::new(), "any oil spec?", &[]).await.unwrap();
        assert!(!answer.grounded);
        assert_eq!(answer.text, "nothing found");
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blank_message_rejected() {
        let p = pipeline(Arc::new(LetterEmbedder::new()), 64);
        let err = p.answer(&RegistrySnapshot::new(), "  ", &[]).await.unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }
}
