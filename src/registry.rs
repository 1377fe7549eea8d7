//! Manual registry backed by the `manuals` table.
//!
//! One row per unit. The row tracks where the original file is stored and
//! the indexing lifecycle:
//!
//! ```text
//! upload ─▶ pending ─┬─▶ indexed   (indexed_at set, searchable)
//!                    └─▶ failed    (searchable only if indexed before)
//! reindex ─▶ pending ─▶ ...
//! ```
//!
//! [`ManualRegistry::snapshot`] returns the searchable units used to
//! validate unit numbers detected in chat messages.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use manual_copilot_core::models::{IndexStatus, ManualRecord, RegistrySnapshot};

/// Fields supplied when a manual is uploaded.
#[derive(Debug, Clone)]
pub struct NewManual {
    pub unit: String,
    pub filename: String,
    pub description: Option<String>,
    pub stored_path: String,
}

#[derive(Clone)]
pub struct ManualRegistry {
    pool: SqlitePool,
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn row_to_record(row: &SqliteRow) -> Result<ManualRecord> {
    let status: String = row.get("status");
    let page_count: i64 = row.get("page_count");
    let chunk_count: i64 = row.get("chunk_count");
    let uploaded_at: i64 = row.get("uploaded_at");
    let indexed_at: Option<i64> = row.get("indexed_at");
    Ok(ManualRecord {
        unit: row.get("unit"),
        filename: row.get("filename"),
        description: row.get("description"),
        uploaded_at: ts_to_datetime(uploaded_at),
        page_count: page_count as u32,
        chunk_count: chunk_count as u32,
        stored_path: row.get("stored_path"),
        status: IndexStatus::parse(&status)?,
        status_detail: row.get("status_detail"),
        indexed_at: indexed_at.map(ts_to_datetime),
    })
}

const SELECT_MANUAL: &str = r#"
    SELECT unit, filename, description, uploaded_at, page_count, chunk_count,
           stored_path, status, status_detail, indexed_at
    FROM manuals
"#;

impl ManualRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, unit: &str) -> Result<Option<ManualRecord>> {
        let row = sqlx::query(&format!("{SELECT_MANUAL} WHERE unit = ?"))
            .bind(unit)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read manual for unit {unit}"))?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// All manuals, sorted by unit.
    pub async fn list(&self) -> Result<Vec<ManualRecord>> {
        let rows = sqlx::query(&format!("{SELECT_MANUAL} ORDER BY unit ASC"))
            .fetch_all(&self.pool)
            .await
            .context("Failed to list manuals")?;
        rows.iter().map(row_to_record).collect()
    }

    /// Searchable manuals as a unit → filename snapshot.
    pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
        Ok(self.list().await?.into_iter().collect())
    }

    /// Record a freshly stored upload as `pending`.
    ///
    /// Replacing an existing row keeps its `indexed_at`, because the old
    /// collection stays searchable until the new one is indexed.
    pub async fn upsert_pending(&self, manual: &NewManual) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO manuals (unit, filename, description, uploaded_at, stored_path, status)
            VALUES (?, ?, ?, ?, ?, 'pending')
            ON CONFLICT(unit) DO UPDATE SET
                filename = excluded.filename,
                description = excluded.description,
                uploaded_at = excluded.uploaded_at,
                stored_path = excluded.stored_path,
                status = 'pending',
                status_detail = NULL
            "#,
        )
        .bind(&manual.unit)
        .bind(&manual.filename)
        .bind(&manual.description)
        .bind(now)
        .bind(&manual.stored_path)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to register manual for unit {}", manual.unit))?;
        Ok(())
    }

    pub async fn mark_pending(&self, unit: &str) -> Result<()> {
        self.set_status(unit, IndexStatus::Pending, None).await
    }

    pub async fn mark_indexed(&self, unit: &str, page_count: usize, chunk_count: usize) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE manuals
            SET status = 'indexed', status_detail = NULL,
                page_count = ?, chunk_count = ?, indexed_at = ?
            WHERE unit = ?
            "#,
        )
        .bind(page_count as i64)
        .bind(chunk_count as i64)
        .bind(now)
        .bind(unit)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark unit {unit} indexed"))?;
        Ok(())
    }

    pub async fn mark_failed(&self, unit: &str, detail: &str) -> Result<()> {
        self.set_status(unit, IndexStatus::Failed, Some(detail)).await
    }

    async fn set_status(&self, unit: &str, status: IndexStatus, detail: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE manuals SET status = ?, status_detail = ? WHERE unit = ?")
            .bind(status.as_str())
            .bind(detail)
            .bind(unit)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to set status of unit {unit} to {status}"))?;
        Ok(())
    }

    /// Remove the row. Returns `false` if the unit was not registered.
    pub async fn delete(&self, unit: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM manuals WHERE unit = ?")
            .bind(unit)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete manual for unit {unit}"))?;
        Ok(result.rows_affected() > 0)
    }
}
