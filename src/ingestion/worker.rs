//! File-processing worker pool
//!
//! Each worker loops: take a job, open the file, parse it, bulk-load the
//! trades, answer the job's result channel. Every submitted job is answered
//! exactly once, including jobs still queued when the pool is cancelled.

use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{loader::BulkLoader, parser::Parser};
use crate::{error::IngestError, models::JobResult, observe::SharedObserver};

/// "Fully process this file", answered on `result_tx`.
#[derive(Debug)]
pub struct Job {
    pub path: PathBuf,
    pub result_tx: mpsc::Sender<JobResult>,
}

impl Job {
    pub fn new(path: impl Into<PathBuf>, result_tx: mpsc::Sender<JobResult>) -> Self {
        Self {
            path: path.into(),
            result_tx,
        }
    }

    async fn respond(self, result: JobResult) {
        if self.result_tx.send(result).await.is_err() {
            warn!(path = %self.path.display(), "Job result receiver dropped");
        }
    }
}

#[derive(Clone)]
struct FileProcessor {
    parser: Parser,
    loader: BulkLoader,
    observer: SharedObserver,
}

impl FileProcessor {
    async fn process(&self, path: &Path, cancel: &CancellationToken) -> JobResult {
        let started = Instant::now();
        let result = self.process_inner(path, cancel).await;
        self.observer.record_duration("job.file", started.elapsed());

        match &result.error {
            None => {
                self.observer.record_event("job.completed", 1);
                info!(
                    "✅ Loaded {} records from {} ({} rejected) in {:?}",
                    result.records_count,
                    path.display(),
                    result.records_rejected,
                    started.elapsed()
                );
            }
            Some(e) => {
                self.observer.record_event("job.failed", 1);
                warn!(
                    path = %path.display(),
                    loaded = result.records_count,
                    error = %e,
                    "❌ File processing failed"
                );
            }
        }
        result
    }

    async fn process_inner(&self, path: &Path, cancel: &CancellationToken) -> JobResult {
        let file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) => return JobResult::failed(path.to_path_buf(), IngestError::io(path, &e)),
        };

        let outcome = match self.parser.parse_stream(file, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => return JobResult::failed(path.to_path_buf(), e),
        };

        let rejected = outcome.rejected() as u64;
        for err in outcome.errors.iter().take(5) {
            debug!(path = %path.display(), "Rejected {}", err);
        }

        let report = self.loader.load_concurrent(outcome.trades, cancel).await;
        JobResult {
            path: path.to_path_buf(),
            records_count: report.rows,
            records_rejected: rejected,
            error: report.error,
        }
    }
}

pub struct WorkerPool {
    job_tx: Mutex<Option<mpsc::Sender<Job>>>,
    job_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    processor: FileProcessor,
}

impl WorkerPool {
    pub fn new(queue_capacity: usize, parser: Parser, loader: BulkLoader, observer: SharedObserver) -> Self {
        let (job_tx, job_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            job_tx: Mutex::new(Some(job_tx)),
            job_rx: Arc::new(tokio::sync::Mutex::new(job_rx)),
            handles: Mutex::new(Vec::new()),
            processor: FileProcessor {
                parser,
                loader,
                observer,
            },
        }
    }

    /// Launches `workers` tasks pulling from the shared queue.
    pub fn start(&self, workers: usize, cancel: CancellationToken) {
        let mut handles = self.handles.lock();
        for id in 0..workers.max(1) {
            let rx = self.job_rx.clone();
            let processor = self.processor.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(run_worker(id, rx, processor, cancel)));
        }
        debug!(workers = handles.len(), "Worker pool started");
    }

    /// Enqueues a job, waiting while the queue is full.
    pub async fn submit(&self, job: Job) -> Result<(), IngestError> {
        let tx = self.job_tx.lock().clone().ok_or(IngestError::PoolClosed)?;
        tx.send(job).await.map_err(|_| IngestError::PoolClosed)
    }

    /// Closes the queue and waits until every worker has drained it.
    ///
    /// Jobs left with no worker to run them (the pool was never started, or
    /// every worker died) are answered with `PoolClosed`.
    pub async fn stop(&self) {
        self.job_tx.lock().take();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        let mut rx = self.job_rx.lock().await;
        rx.close();
        let mut orphaned = 0usize;
        while let Some(job) = rx.recv().await {
            let path = job.path.clone();
            job.respond(JobResult::failed(path, IngestError::PoolClosed)).await;
            orphaned += 1;
        }
        if orphaned > 0 {
            warn!(jobs = orphaned, "Answered unprocessed jobs with PoolClosed");
        }
        debug!("Worker pool stopped");
    }
}

async fn run_worker(
    id: usize,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    processor: FileProcessor,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = jobs.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = next else {
            break;
        };

        debug!(worker = id, path = %job.path.display(), "Job dispatched");
        let result = processor.process(&job.path, &cancel).await;
        job.respond(result).await;
    }

    if cancel.is_cancelled() {
        // Refuse new work and answer whatever is still queued
        let mut rx = jobs.lock().await;
        rx.close();
        while let Some(job) = rx.recv().await {
            let path = job.path.clone();
            job.respond(JobResult::failed(path, IngestError::Cancelled)).await;
        }
    }
    debug!(worker = id, "Worker exiting");
}
