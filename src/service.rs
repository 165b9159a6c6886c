//! End-to-end ingestion operations used by the CLI and the admin API

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    calendar::{default_reference_date, HolidayCalendar},
    config::IngestConfig,
    error::IngestError,
    ingestion::{extract_archive, BulkLoader, Downloader, Job, Parser, WorkerPool},
    models::JobResult,
    observe::SharedObserver,
    storage::SqliteStore,
};

#[derive(Debug, Clone, Serialize)]
pub struct DownloadFailure {
    pub date: NaiveDate,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadSummary {
    pub dates: Vec<NaiveDate>,
    pub files: Vec<PathBuf>,
    pub extracted: Vec<PathBuf>,
    pub failures: Vec<DownloadFailure>,
    pub extract_errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub results: Vec<JobResult>,
    pub total_records: u64,
    pub total_rejected: u64,
    pub failed_files: usize,
    pub aggregations_refreshed: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Clone)]
pub struct IngestionService {
    config: IngestConfig,
    store: Arc<SqliteStore>,
    observer: SharedObserver,
    downloader: Downloader,
    calendar: HolidayCalendar,
}

impl IngestionService {
    pub fn new(config: IngestConfig, store: Arc<SqliteStore>, observer: SharedObserver) -> Result<Self> {
        let downloader = Downloader::from_config(&config, observer.clone())?;
        let calendar = HolidayCalendar::b3().with_extra(config.extra_holidays.iter().copied());
        Ok(Self {
            config,
            store,
            observer,
            downloader,
            calendar,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Downloads the files for the last `days` business days into the data
    /// directory. Zero successful files is reported, not treated as fatal.
    pub async fn download_last_days(
        &self,
        days: usize,
        start_date: Option<NaiveDate>,
        extract: bool,
        cancel: &CancellationToken,
    ) -> DownloadSummary {
        let reference = start_date.unwrap_or_else(|| {
            default_reference_date(Utc::now().date_naive(), self.config.publication_lag_days)
        });
        let dates = self.calendar.last_business_days(days, reference);
        info!("📅 Downloading {} trading days ending {}", dates.len(), reference);

        let report = self
            .downloader
            .fetch_range(&dates, &self.config.data_dir, cancel)
            .await;

        let mut summary = DownloadSummary {
            dates,
            files: report.paths,
            failures: report
                .failures
                .into_iter()
                .map(|(date, e)| DownloadFailure {
                    date,
                    error: e.to_string(),
                })
                .collect(),
            ..DownloadSummary::default()
        };

        if extract && !cancel.is_cancelled() {
            for archive in summary.files.iter().filter(|p| is_zip(p)) {
                let archive = archive.clone();
                let dest = self.config.data_dir.clone();
                let extracted = tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
                    .await
                    .map_err(|e| IngestError::Internal(format!("extract task: {e}")))
                    .and_then(|r| r);
                match extracted {
                    Ok(paths) => summary.extracted.extend(paths),
                    Err(e) => {
                        warn!(error = %e, "Archive extraction failed");
                        summary.extract_errors.push(e.to_string());
                    }
                }
            }
        }

        if summary.files.is_empty() && !summary.dates.is_empty() {
            warn!("No files downloaded ({} dates failed)", summary.failures.len());
        }
        summary
    }

    /// Runs every file through the worker pool and collects one result per
    /// file, then refreshes the daily aggregations.
    pub async fn load_files(&self, paths: Vec<PathBuf>, cancel: &CancellationToken) -> LoadSummary {
        let started = Instant::now();
        let total_files = paths.len();

        let parser = Parser::new(
            self.config.layout,
            self.config.batch_size,
            self.config.workers,
            self.observer.clone(),
        );
        let loader = BulkLoader::new(self.store.clone(), self.config.chunk_size, self.observer.clone());
        let pool = WorkerPool::new(self.config.queue_capacity, parser, loader, self.observer.clone());
        pool.start(self.config.workers, cancel.clone());

        let (result_tx, mut result_rx) = mpsc::channel(total_files.max(1));
        let mut results = Vec::with_capacity(total_files);
        for path in paths {
            if let Err(e) = pool.submit(Job::new(path.clone(), result_tx.clone())).await {
                results.push(JobResult::failed(path, e));
            }
        }
        drop(result_tx);
        pool.stop().await;

        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }

        let mut summary = LoadSummary {
            total_records: results.iter().map(|r| r.records_count).sum(),
            total_rejected: results.iter().map(|r| r.records_rejected).sum(),
            failed_files: results.iter().filter(|r| !r.is_ok()).count(),
            results,
            aggregations_refreshed: None,
        };

        info!(
            "📊 Loaded {} records from {} files ({} failed, {} rejected lines) in {:?}",
            summary.total_records,
            total_files,
            summary.failed_files,
            summary.total_rejected,
            started.elapsed()
        );

        if summary.total_records > 0 && !cancel.is_cancelled() {
            match self.refresh_aggregations().await {
                Ok(rows) => summary.aggregations_refreshed = Some(rows),
                Err(e) => warn!(error = %e, "Aggregation refresh failed"),
            }
        }

        summary
    }

    pub async fn refresh_aggregations(&self) -> Result<usize> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.refresh_daily_aggregations()).await?
    }

    pub async fn health(&self) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.health_check()).await?
    }
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// Regular files in `dir`, sorted by name.
pub async fn list_files(dir: &Path) -> Result<Vec<FileEntry>, IngestError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| IngestError::io(dir, &e))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| IngestError::io(dir, &e))?
    {
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        files.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            size_bytes: meta.len(),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}
