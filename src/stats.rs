//! Index statistics for `copilot stats`.
//!
//! Per-unit registry status and chunk counts, plus totals and database
//! size, so an operator can see which manuals are searchable.

use anyhow::{Context, Result};

use manual_copilot_core::models::ManualRecord;

use crate::app::App;
use crate::sqlite_store::CollectionStats;

/// One row of the per-unit table.
struct UnitStats {
    unit: String,
    status: String,
    pages: u32,
    chunks: i64,
    dims: Option<i64>,
    indexed_at: Option<i64>,
}

fn unit_rows(manuals: &[ManualRecord], collections: &[CollectionStats]) -> Vec<UnitStats> {
    let mut rows: Vec<UnitStats> = manuals
        .iter()
        .map(|m| {
            let collection = collections.iter().find(|c| c.unit == m.unit);
            UnitStats {
                unit: m.unit.clone(),
                status: m.status.to_string(),
                pages: m.page_count,
                chunks: collection.map(|c| c.chunks).unwrap_or(0),
                dims: collection.and_then(|c| c.dims),
                indexed_at: m.indexed_at.map(|t| t.timestamp()),
            }
        })
        .collect();

    // Collections left behind without a registry row.
    for c in collections {
        if !manuals.iter().any(|m| m.unit == c.unit) {
            rows.push(UnitStats {
                unit: c.unit.clone(),
                status: "orphaned".to_string(),
                pages: 0,
                chunks: c.chunks,
                dims: c.dims,
                indexed_at: None,
            });
        }
    }
    rows.sort_by(|a, b| a.unit.cmp(&b.unit));
    rows
}

/// Query the database and print a summary.
pub async fn run_stats(app: &App) -> Result<()> {
    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM unit_chunks")
        .fetch_one(&app.pool)
        .await
        .context("Failed to count chunks")?;
    let total_embedded: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM unit_chunks WHERE dims > 0")
            .fetch_one(&app.pool)
            .await
            .context("Failed to count embeddings")?;

    let manuals = app.manuals.list().await?;
    let collections = app.store.collection_stats().await?;
    let searchable = manuals.iter().filter(|m| m.is_searchable()).count();

    let db_size = std::fs::metadata(&app.config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Manual Copilot: Index Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", app.config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Manuals:     {} ({} searchable)", manuals.len(), searchable);
    println!("  Chunks:      {}", total_chunks);
    println!("  Embedded:    {} / {}", total_embedded, total_chunks);

    let rows = unit_rows(&manuals, &collections);
    if !rows.is_empty() {
        println!();
        println!("  By unit:");
        println!(
            "  {:<16} {:<9} {:>6} {:>8} {:>6}   {}",
            "UNIT", "STATUS", "PAGES", "CHUNKS", "DIMS", "INDEXED"
        );
        println!("  {}", "-".repeat(70));
        for r in &rows {
            let dims = r.dims.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string());
            let indexed = match r.indexed_at {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<16} {:<9} {:>6} {:>8} {:>6}   {}",
                r.unit, r.status, r.pages, r.chunks, dims, indexed
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
