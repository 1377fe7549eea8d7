use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema if it does not exist. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Manual registry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manuals (
            unit TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            description TEXT,
            uploaded_at INTEGER NOT NULL,
            page_count INTEGER NOT NULL DEFAULT 0,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            stored_path TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            status_detail TEXT,
            indexed_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per unit that has an index collection, even an empty one
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS unit_collections (
            unit TEXT PRIMARY KEY,
            dims INTEGER,
            chunk_count INTEGER NOT NULL,
            replaced_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunks and their vectors, scoped by unit
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS unit_chunks (
            unit TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            page INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            char_start INTEGER NOT NULL,
            char_end INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            model TEXT NOT NULL DEFAULT '',
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (unit, chunk_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before vectors were tagged with their model
    ensure_column(pool, "unit_chunks", "model", "TEXT NOT NULL DEFAULT ''").await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_unit_chunks_page ON unit_chunks(unit, page, seq)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_manuals_status ON manuals(status)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn ensure_column(pool: &SqlitePool, table: &str, column: &str, decl: &str) -> Result<()> {
    let exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await?;
    if exists == 0 {
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
            .execute(pool)
            .await?;
    }
    Ok(())
}
