//! Daily trade-file downloader
//!
//! One file per trading date. Transfers land in a uniquely named `.part`
//! file and are renamed into place only once complete, so a file at the
//! final name is always whole. An existing final file short-circuits the
//! transfer.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tokio::{fs, io::AsyncWriteExt, sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{config::IngestConfig, error::IngestError, observe::SharedObserver};

/// Paths obtained plus the dates that failed, both in request order.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub paths: Vec<PathBuf>,
    pub failures: Vec<(NaiveDate, IngestError)>,
}

#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    base_url: String,
    file_prefix: String,
    file_extension: String,
    workers: usize,
    observer: SharedObserver,
}

impl Downloader {
    pub fn from_config(config: &IngestConfig, observer: SharedObserver) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            file_prefix: config.file_prefix.clone(),
            file_extension: config.file_extension.clone(),
            workers: config.workers.max(1),
            observer,
        })
    }

    pub fn file_name_for(&self, date: NaiveDate) -> String {
        format!(
            "{}{}.{}",
            self.file_prefix,
            date.format("%Y%m%d"),
            self.file_extension
        )
    }

    pub fn url_for(&self, date: NaiveDate) -> String {
        format!("{}/{}", self.base_url, self.file_name_for(date))
    }

    /// Materializes the file for `date` under `output_dir`.
    pub async fn fetch(
        &self,
        date: NaiveDate,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, IngestError> {
        fs::create_dir_all(output_dir)
            .await
            .map_err(|e| IngestError::io(output_dir, &e))?;

        let file_name = self.file_name_for(date);
        let final_path = output_dir.join(&file_name);
        if fs::try_exists(&final_path).await.unwrap_or(false) {
            debug!(path = %final_path.display(), "File already present, skipping download");
            self.observer.record_event("download.skipped", 1);
            return Ok(final_path);
        }

        let url = self.url_for(date);
        let temp_path = output_dir.join(format!("{}.{}.part", file_name, Uuid::new_v4()));
        let started = Instant::now();

        let transferred = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            r = self.transfer(&url, &temp_path) => r,
        };

        let result = match transferred {
            Ok(bytes) => fs::rename(&temp_path, &final_path)
                .await
                .map(|_| bytes)
                .map_err(|e| IngestError::io(&final_path, &e)),
            Err(e) => Err(e),
        };

        match result {
            Ok(bytes) => {
                self.observer.record_event("download.completed", 1);
                self.observer.record_duration("download.file", started.elapsed());
                info!("📥 Downloaded {} ({} bytes) in {:?}", file_name, bytes, started.elapsed());
                Ok(final_path)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&temp_path).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %temp_path.display(), error = %rm, "Failed to remove partial download");
                    }
                }
                self.observer.record_event("download.failed", 1);
                warn!(%date, error = %e, "Download failed");
                Err(e)
            }
        }
    }

    /// Fetches every date with at most `workers` transfers in flight.
    /// A failed date never stops the others.
    pub async fn fetch_range(
        &self,
        dates: &[NaiveDate],
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> FetchReport {
        let gate = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();

        for (idx, &date) in dates.iter().enumerate() {
            let downloader = self.clone();
            let gate = gate.clone();
            let dir = output_dir.to_path_buf();
            let cancel = cancel.clone();

            set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    p = gate.acquire_owned() => p.ok(),
                };
                let Some(_permit) = permit else {
                    return (idx, date, Err(IngestError::Cancelled));
                };
                (idx, date, downloader.fetch(date, &dir, &cancel).await)
            });
        }

        let mut results = Vec::with_capacity(dates.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => warn!(error = %e, "Download task aborted"),
            }
        }
        results.sort_by_key(|(idx, _, _)| *idx);

        let mut report = FetchReport::default();
        for (_, date, result) in results {
            match result {
                Ok(path) => report.paths.push(path),
                Err(e) => report.failures.push((date, e)),
            }
        }

        info!(
            "📦 Fetched {} of {} files ({} failed)",
            report.paths.len(),
            dates.len(),
            report.failures.len()
        );
        report
    }

    async fn transfer(&self, url: &str, temp_path: &Path) -> Result<u64, IngestError> {
        let transfer_error = |status: Option<u16>, message: String| IngestError::Transfer {
            url: url.to_string(),
            status,
            message,
        };

        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transfer_error(None, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(transfer_error(
                Some(status.as_u16()),
                format!("unexpected status {}", status),
            ));
        }
        let expected = resp.content_length();

        let mut file = fs::File::create(temp_path)
            .await
            .map_err(|e| IngestError::io(temp_path, &e))?;

        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| transfer_error(Some(status.as_u16()), e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| IngestError::io(temp_path, &e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| IngestError::io(temp_path, &e))?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(transfer_error(
                    Some(status.as_u16()),
                    format!("body truncated: {} of {} bytes", written, expected),
                ));
            }
        }

        Ok(written)
    }
}
