//! SQLite-backed [`UnitIndexStore`].
//!
//! Every unit's collection lives in `unit_chunks` under its own `unit`
//! key, with a marker row in `unit_collections`. A replace runs as one
//! transaction (delete, insert, marker), so readers on other pool
//! connections observe the old or the new collection and a failed
//! replace rolls back to the old one.
//!
//! Queries are brute-force cosine distance over the unit's vectors.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use manual_copilot_core::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use manual_copilot_core::models::{Chunk, EmbeddedChunk};
use manual_copilot_core::store::{
    check_collection, rank_hits, CachedEmbedding, ScoredChunk, UnitIndexStore,
};
use manual_copilot_core::{RagError, Result};

/// Per-unit chunk and embedding counts, for `copilot stats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    pub unit: String,
    pub chunks: i64,
    pub dims: Option<i64>,
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn collection_stats(&self) -> Result<Vec<CollectionStats>> {
        let rows = sqlx::query(
            "SELECT unit, chunk_count, dims FROM unit_collections ORDER BY unit ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RagError::index_read("all units", e))?;

        Ok(rows
            .iter()
            .map(|row| CollectionStats {
                unit: row.get("unit"),
                chunks: row.get("chunk_count"),
                dims: row.get("dims"),
            })
            .collect())
    }
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let page: i64 = row.get("page");
    let seq: i64 = row.get("seq");
    let char_start: i64 = row.get("char_start");
    let char_end: i64 = row.get("char_end");
    Chunk {
        id: row.get("chunk_id"),
        unit: row.get("unit"),
        page: page as u32,
        seq: seq as u32,
        char_start: char_start as usize,
        char_end: char_end as usize,
        text: row.get("text"),
        hash: row.get("hash"),
    }
}

#[async_trait]
impl UnitIndexStore for SqliteStore {
    async fn upsert(&self, unit: &str, chunks: &[EmbeddedChunk]) -> Result<()> {
        check_collection(unit, chunks)?;
        let write_err = |e: sqlx::Error| RagError::index_write(unit, e);

        let dims = chunks.first().map(|c| c.vector.len() as i64);
        let now = chrono::Utc::now().timestamp();

        // Dropping `tx` on any early return rolls the replace back.
        let mut tx = self.pool.begin().await.map_err(write_err)?;

        sqlx::query("DELETE FROM unit_chunks WHERE unit = ?")
            .bind(unit)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;

        for ec in chunks {
            let chunk = &ec.chunk;
            sqlx::query(
                r#"
                INSERT INTO unit_chunks (unit, chunk_id, page, seq, char_start, char_end,
                                         text, hash, model, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(unit)
            .bind(&chunk.id)
            .bind(chunk.page as i64)
            .bind(chunk.seq as i64)
            .bind(chunk.char_start as i64)
            .bind(chunk.char_end as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(&ec.model)
            .bind(ec.vector.len() as i64)
            .bind(vec_to_blob(&ec.vector))
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
        }

        sqlx::query(
            r#"
            INSERT INTO unit_collections (unit, dims, chunk_count, replaced_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(unit) DO UPDATE SET
                dims = excluded.dims,
                chunk_count = excluded.chunk_count,
                replaced_at = excluded.replaced_at
            "#,
        )
        .bind(unit)
        .bind(dims)
        .bind(chunks.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(write_err)?;

        tx.commit().await.map_err(write_err)?;
        tracing::debug!(unit, chunks = chunks.len(), "replaced unit collection");
        Ok(())
    }

    async fn query(&self, unit: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT unit, chunk_id, page, seq, char_start, char_end, text, hash, dims, embedding
            FROM unit_chunks
            WHERE unit = ?
            "#,
        )
        .bind(unit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RagError::index_read(unit, e))?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let dims: i64 = row.get("dims");
            if dims as usize != vector.len() {
                return Err(RagError::index_read(
                    unit,
                    format!("query has {} dims, collection has {dims}", vector.len()),
                ));
            }
            let blob: Vec<u8> = row.get("embedding");
            let stored = blob_to_vec(&blob);
            hits.push(ScoredChunk {
                chunk: row_to_chunk(row),
                distance: cosine_distance(vector, &stored),
            });
        }

        Ok(rank_hits(hits, k))
    }

    async fn delete(&self, unit: &str) -> Result<()> {
        let write_err = |e: sqlx::Error| RagError::index_write(unit, e);
        let mut tx = self.pool.begin().await.map_err(write_err)?;
        sqlx::query("DELETE FROM unit_chunks WHERE unit = ?")
            .bind(unit)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
        sqlx::query("DELETE FROM unit_collections WHERE unit = ?")
            .bind(unit)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
        tx.commit().await.map_err(write_err)?;
        Ok(())
    }

    async fn units(&self) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>("SELECT unit FROM unit_collections ORDER BY unit ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RagError::index_read("all units", e))
    }

    async fn chunk_ids(&self, unit: &str) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>("SELECT chunk_id FROM unit_chunks WHERE unit = ? ORDER BY chunk_id ASC")
            .bind(unit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RagError::index_read(unit, e))
    }

    async fn embedding_cache(&self, unit: &str) -> Result<HashMap<String, CachedEmbedding>> {
        let rows = sqlx::query("SELECT chunk_id, hash, model, embedding FROM unit_chunks WHERE unit = ?")
            .bind(unit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RagError::index_read(unit, e))?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                (
                    row.get("chunk_id"),
                    CachedEmbedding {
                        hash: row.get("hash"),
                        model: row.get("model"),
                        vector: blob_to_vec(&blob),
                    },
                )
            })
            .collect())
    }
}
