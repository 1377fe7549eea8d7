//! Manual lifecycle: upload, re-index, delete.
//!
//! Upload is two-phase. The file is stored durably and registered as
//! `pending` first; indexing runs afterwards and records `indexed` or
//! `failed`. A failed index never removes the stored file, so
//! `reindex` can retry from it.
//!
//! Replacing a registered manual stages the new file next to the old one
//! and indexes from the staged copy. The stored file and the registry's
//! filename, description and path switch over only once indexing
//! succeeds; a failed replacement discards the staged file and leaves the
//! previous manual in place with status `failed`.
//!
//! All three operations hold the unit's lock for their full duration.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;

use manual_copilot_core::models::{normalize_unit, ManualRecord, Page};
use manual_copilot_core::pipeline::{IngestReport, RagPipeline};
use manual_copilot_core::RagError;

use crate::extract::{detect_content_type, extract_pages, stored_content_type, stored_extension};
use crate::locks::UnitLocks;
use crate::registry::{ManualRegistry, NewManual};

/// Lifecycle errors the HTTP layer maps to 4xx statuses.
#[derive(Debug, Error)]
pub enum ManualError {
    #[error("no manual registered for unit {0}")]
    NotFound(String),
    #[error("a manual is already registered for unit {0}; pass replace to overwrite it")]
    AlreadyExists(String),
    #[error("unsupported file type for {0}; upload a PDF or plain-text manual")]
    UnsupportedType(String),
    #[error("uploaded file is empty")]
    EmptyUpload,
    #[error("stored file for unit {0} is missing")]
    FileMissing(String),
}

/// A manual upload as received from the CLI or HTTP.
#[derive(Debug, Clone)]
pub struct Upload {
    pub unit: String,
    pub filename: String,
    pub description: Option<String>,
    pub bytes: Vec<u8>,
    pub replace: bool,
}

/// Registry state after an upload or re-index, plus the indexing report
/// when indexing succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub manual: ManualRecord,
    pub report: Option<IngestReport>,
}

/// A stored manual read back for download.
#[derive(Debug, Clone)]
pub struct StoredManual {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

impl IndexOutcome {
    pub fn is_indexed(&self) -> bool {
        self.report.is_some()
    }
}

pub struct ManualService {
    registry: ManualRegistry,
    pipeline: Arc<RagPipeline>,
    locks: UnitLocks,
    manuals_dir: PathBuf,
}

impl ManualService {
    pub fn new(registry: ManualRegistry, pipeline: Arc<RagPipeline>, manuals_dir: PathBuf) -> Self {
        Self {
            registry,
            pipeline,
            locks: UnitLocks::new(),
            manuals_dir,
        }
    }

    pub async fn list(&self) -> Result<Vec<ManualRecord>> {
        self.registry.list().await
    }

    pub async fn get(&self, unit: &str) -> Result<ManualRecord> {
        let unit = normalize_unit(unit)?;
        self.registry
            .get(&unit)
            .await?
            .ok_or_else(|| ManualError::NotFound(unit).into())
    }

    /// Store, register and index a manual.
    pub async fn upload(&self, upload: Upload) -> Result<IndexOutcome> {
        let unit = normalize_unit(&upload.unit)?;
        if upload.bytes.is_empty() {
            return Err(ManualError::EmptyUpload.into());
        }
        let content_type = detect_content_type(&upload.filename, &upload.bytes)
            .ok_or_else(|| ManualError::UnsupportedType(upload.filename.clone()))?;

        let _guard = self.locks.lock(&unit).await;

        let previous = self.registry.get(&unit).await?;
        if previous.is_some() && !upload.replace {
            return Err(ManualError::AlreadyExists(unit).into());
        }

        let path = self
            .manuals_dir
            .join(format!("{}.{}", unit, stored_extension(content_type)));
        let manual = NewManual {
            unit: unit.clone(),
            filename: upload.filename,
            description: upload.description,
            stored_path: path.display().to_string(),
        };

        if let Some(old) = previous {
            return self.replace_locked(&old, manual, &path, upload.bytes).await;
        }

        write_durably(&path, upload.bytes).await?;
        self.registry.upsert_pending(&manual).await?;
        tracing::info!(unit = %unit, path = %path.display(), "stored manual");
        self.index_locked(&unit, &path).await
    }

    /// Index a replacement from a staged copy and switch the stored file
    /// and registry metadata over only if indexing succeeds. Caller holds
    /// the unit lock.
    async fn replace_locked(
        &self,
        old: &ManualRecord,
        manual: NewManual,
        path: &Path,
        bytes: Vec<u8>,
    ) -> Result<IndexOutcome> {
        let unit = manual.unit.as_str();
        let staged = staged_path(path)?;
        write_durably(&staged, bytes).await?;
        self.registry.mark_pending(unit).await?;

        let report = match self.ingest_file(unit, &staged).await {
            Ok(report) => report,
            Err(e) => {
                remove_file_if_exists(&staged).await?;
                self.record_failure(unit, &e).await?;
                return self.outcome(unit, None).await;
            }
        };

        tokio::fs::rename(&staged, path)
            .await
            .with_context(|| format!("Failed to move manual into {}", path.display()))?;
        let old_path = Path::new(&old.stored_path);
        if old_path != path {
            remove_file_if_exists(old_path).await?;
        }
        self.registry.upsert_pending(&manual).await?;
        self.registry
            .mark_indexed(unit, report.pages, report.chunks)
            .await?;

        tracing::info!(unit, path = %path.display(), "replaced manual");
        self.outcome(unit, Some(report)).await
    }

    /// The stored file of a registered manual.
    pub async fn download(&self, unit: &str) -> Result<StoredManual> {
        let unit = normalize_unit(unit)?;
        let _guard = self.locks.lock(&unit).await;

        let record = self
            .registry
            .get(&unit)
            .await?
            .ok_or_else(|| ManualError::NotFound(unit.clone()))?;
        let path = Path::new(&record.stored_path);
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManualError::FileMissing(unit).into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        Ok(StoredManual {
            filename: record.filename,
            content_type: stored_content_type(path),
            bytes,
        })
    }

    /// Re-index a registered manual from its stored file.
    pub async fn reindex(&self, unit: &str) -> Result<IndexOutcome> {
        let unit = normalize_unit(unit)?;
        let _guard = self.locks.lock(&unit).await;

        let record = self
            .registry
            .get(&unit)
            .await?
            .ok_or_else(|| ManualError::NotFound(unit.clone()))?;
        self.registry.mark_pending(&unit).await?;
        self.index_locked(&unit, Path::new(&record.stored_path)).await
    }

    /// Remove the index collection, the stored file and the registry row.
    pub async fn delete(&self, unit: &str) -> Result<()> {
        let unit = normalize_unit(unit)?;
        let _guard = self.locks.lock(&unit).await;

        let record = self
            .registry
            .get(&unit)
            .await?
            .ok_or_else(|| ManualError::NotFound(unit.clone()))?;

        self.pipeline.remove(&unit).await?;
        remove_file_if_exists(Path::new(&record.stored_path)).await?;
        self.registry.delete(&unit).await?;

        tracing::info!(unit = %unit, "deleted manual");
        Ok(())
    }

    /// Extract and index `path`, recording the result. Caller holds the
    /// unit lock.
    async fn index_locked(&self, unit: &str, path: &Path) -> Result<IndexOutcome> {
        let report = match self.ingest_file(unit, path).await {
            Ok(report) => {
                self.registry
                    .mark_indexed(unit, report.pages, report.chunks)
                    .await?;
                Some(report)
            }
            Err(e) => {
                self.record_failure(unit, &e).await?;
                None
            }
        };
        self.outcome(unit, report).await
    }

    async fn ingest_file(&self, unit: &str, path: &Path) -> Result<IngestReport> {
        let pages = self.load_pages(unit, path).await?;
        Ok(self.pipeline.ingest(unit, &pages).await?)
    }

    async fn record_failure(&self, unit: &str, err: &anyhow::Error) -> Result<()> {
        let detail = format!("{err:#}");
        tracing::warn!(unit, error = %detail, "indexing failed");
        self.registry.mark_failed(unit, &detail).await
    }

    async fn outcome(&self, unit: &str, report: Option<IngestReport>) -> Result<IndexOutcome> {
        let manual = self
            .registry
            .get(unit)
            .await?
            .ok_or_else(|| ManualError::NotFound(unit.to_string()))?;
        Ok(IndexOutcome { manual, report })
    }

    /// Read and extract the stored file on a blocking thread.
    ///
    /// Unreadable content yields zero pages; only I/O failures are errors.
    async fn load_pages(&self, unit: &str, path: &Path) -> Result<Vec<Page>> {
        let content_type = stored_content_type(path);
        let owned = path.to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || std::fs::read(&owned))
            .await
            .context("file read task failed")?
            .with_context(|| format!("Failed to read stored manual {}", path.display()))?;

        let extracted = tokio::task::spawn_blocking(move || extract_pages(&bytes, content_type))
            .await
            .context("extraction task failed")?;

        match extracted {
            Ok(pages) => Ok(pages),
            Err(e) => {
                let empty = RagError::ExtractionEmpty {
                    unit: unit.to_string(),
                };
                tracing::warn!(unit, error = %e, "{empty}");
                Ok(Vec::new())
            }
        }
    }
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `path`.
async fn write_durably(path: &Path, bytes: Vec<u8>) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path
            .parent()
            .context("manual path has no parent directory")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("manual path has no file name")?;
        let tmp = dir.join(format!(".{file_name}.tmp"));

        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(&bytes)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp.display()))?;
        drop(file);

        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move manual into {}", path.display()))?;
        Ok(())
    })
    .await
    .context("file write task failed")?
}

/// Sibling of `path` that a replacement is written to before it is indexed.
/// Keeps the extension so the staged copy extracts the same way.
fn staged_path(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("manual path has no file name")?;
    Ok(path.with_file_name(format!(".incoming-{file_name}")))
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manual_copilot_core::generation::GenerationProvider;
    use manual_copilot_core::models::IndexStatus;
    use manual_copilot_core::query::QueryAnalyzer;
    use manual_copilot_core::store::UnitIndexStore;

    use crate::embedding::{DisabledEmbedder, HashedEmbedder};
    use crate::generation::ExtractiveGenerator;
    use crate::sqlite_store::SqliteStore;

    async fn service(
        dir: &tempfile::TempDir,
        embedder: Arc<dyn manual_copilot_core::embedding::EmbeddingProvider>,
    ) -> (ManualService, Arc<SqliteStore>) {
        let config = crate::config::Config::with_paths(
            dir.path().join("copilot.sqlite"),
            dir.path().join("manuals"),
        );
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();

        let store = Arc::new(SqliteStore::new(pool.clone()));
        let generator: Arc<dyn GenerationProvider> = Arc::new(ExtractiveGenerator);
        let pipeline = RagPipeline::new(
            store.clone(),
            embedder,
            generator,
            QueryAnalyzer::with_defaults().unwrap(),
            config.pipeline_settings(),
        )
        .unwrap();
        let service = ManualService::new(
            ManualRegistry::new(pool),
            Arc::new(pipeline),
            config.storage.manuals_dir.clone(),
        );
        (service, store)
    }

    fn upload(unit: &str, text: &str, replace: bool) -> Upload {
        Upload {
            unit: unit.to_string(),
            filename: format!("{unit}.txt"),
            description: None,
            bytes: text.as_bytes().to_vec(),
            replace,
        }
    }

    #[tokio::test]
    async fn upload_stores_and_indexes() {
        let dir = tempfile::TempDir::new().unwrap();
        let (svc, store) = service(&dir, Arc::new(HashedEmbedder::new(32))).await;

        let outcome = svc
            .upload(upload("102", "Relief valve 3000 psi.\x0cReturn hose.", false))
            .await
            .unwrap();
        assert!(outcome.is_indexed());
        assert_eq!(outcome.manual.status, IndexStatus::Indexed);
        assert_eq!(outcome.manual.page_count, 2);
        assert!(Path::new(&outcome.manual.stored_path).exists());
        assert_eq!(store.chunk_ids("102").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_upload_requires_replace() {
        let dir = tempfile::TempDir::new().unwrap();
        let (svc, _) = service(&dir, Arc::new(HashedEmbedder::new(32))).await;
        svc.upload(upload("102", "first", false)).await.unwrap();

        let err = svc.upload(upload("102", "second", false)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ManualError>(),
            Some(ManualError::AlreadyExists(_))
        ));
        assert!(svc.upload(upload("102", "second", true)).await.is_ok());
    }

    #[tokio::test]
    async fn successful_replace_switches_file_and_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let (svc, store) = service(&dir, Arc::new(HashedEmbedder::new(32))).await;
        svc.upload(upload("102", "Relief valve 3000 psi.", false)).await.unwrap();

        let mut rev = upload("102", "Relief valve 3500 psi.\x0cReturn hose.", true);
        rev.filename = "102-rev2.txt".to_string();
        let outcome = svc.upload(rev).await.unwrap();

        assert!(outcome.is_indexed());
        assert_eq!(outcome.manual.filename, "102-rev2.txt");
        assert_eq!(outcome.manual.page_count, 2);
        let stored = Path::new(&outcome.manual.stored_path);
        assert_eq!(
            std::fs::read_to_string(stored).unwrap(),
            "Relief valve 3500 psi.\x0cReturn hose."
        );
        assert!(!stored.with_file_name(".incoming-102.txt").exists());
        assert_eq!(store.chunk_ids("102").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn download_reads_stored_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let (svc, _) = service(&dir, Arc::new(HashedEmbedder::new(32))).await;
        let outcome = svc.upload(upload("102", "Relief valve.", false)).await.unwrap();

        let file = svc.download("102").await.unwrap();
        assert_eq!(file.filename, "102.txt");
        assert_eq!(file.content_type, crate::extract::MIME_TEXT);
        assert_eq!(file.bytes, b"Relief valve.");

        std::fs::remove_file(&outcome.manual.stored_path).unwrap();
        let err = svc.download("102").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ManualError>(),
            Some(ManualError::FileMissing(_))
        ));
    }

    #[tokio::test]
    async fn failed_index_keeps_file_and_marks_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let (svc, _) = service(&dir, Arc::new(DisabledEmbedder)).await;

        let outcome = svc.upload(upload("205", "Lug nut torque.", false)).await.unwrap();
        assert!(!outcome.is_indexed());
        assert_eq!(outcome.manual.status, IndexStatus::Failed);
        assert!(outcome.manual.status_detail.is_some());
        assert!(!outcome.manual.is_searchable());
        assert!(Path::new(&outcome.manual.stored_path).exists());
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let dir = tempfile::TempDir::new().unwrap();
        let (svc, store) = service(&dir, Arc::new(HashedEmbedder::new(32))).await;
        let outcome = svc.upload(upload("102", "Relief valve.", false)).await.unwrap();

        svc.delete("102").await.unwrap();
        assert!(store.units().await.unwrap().is_empty());
        assert!(!Path::new(&outcome.manual.stored_path).exists());
        assert!(svc.list().await.unwrap().is_empty());

        let err = svc.delete("102").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ManualError>(),
            Some(ManualError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reindex_unknown_unit_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let (svc, _) = service(&dir, Arc::new(HashedEmbedder::new(32))).await;
        let err = svc.reindex("999").await.unwrap_err();
        assert!(err.downcast_ref::<ManualError>().is_some());
    }

    #[tokio::test]
    async fn unsupported_upload_is_rejected_before_storing() {
        let dir = tempfile::TempDir::new().unwrap();
        let (svc, _) = service(&dir, Arc::new(HashedEmbedder::new(32))).await;
        let mut u = upload("102", "x", false);
        u.filename = "photo.jpg".to_string();
        let err = svc.upload(u).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ManualError>(),
            Some(ManualError::UnsupportedType(_))
        ));
        assert!(svc.list().await.unwrap().is_empty());
    }
}
