//! Chunked bulk loader
//!
//! Trades are split into contiguous chunks and each chunk is persisted in
//! its own transaction on the blocking pool. Chunks that commit stay
//! committed even when a sibling chunk fails.

use std::{
    ops::Range,
    sync::Arc,
    time::Instant,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::IngestError,
    models::Trade,
    observe::SharedObserver,
    storage::{BulkStore, Value},
};

pub const TRADES_TABLE: &str = "trades";

pub const COLUMNS: [&str; 6] = [
    "closing_time",
    "trade_date",
    "ticker",
    "price",
    "quantity",
    "created_at",
];

/// Rows committed before the first failure, plus that failure.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub rows: u64,
    pub error: Option<IngestError>,
}

/// Splits `len` items into contiguous ranges of at most `size` items.
pub fn chunk_ranges(len: usize, size: usize) -> Vec<Range<usize>> {
    let size = size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

#[derive(Clone)]
pub struct BulkLoader {
    store: Arc<dyn BulkStore>,
    chunk_size: usize,
    observer: SharedObserver,
}

impl BulkLoader {
    pub fn new(store: Arc<dyn BulkStore>, chunk_size: usize, observer: SharedObserver) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            observer,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Persists `trades[range]` in one transaction and returns the rows
    /// accepted. Any failure rolls the whole chunk back.
    pub async fn load_chunk(
        &self,
        trades: Arc<Vec<Trade>>,
        range: Range<usize>,
        cancel: CancellationToken,
    ) -> Result<u64, IngestError> {
        let store = self.store.clone();
        let started = Instant::now();

        let result = tokio::task::spawn_blocking(move || {
            copy_chunk(store.as_ref(), &trades[range], &cancel)
        })
        .await
        .map_err(|e| IngestError::Internal(format!("chunk task: {e}")))?;

        self.observer.record_duration("load.chunk", started.elapsed());
        match &result {
            Ok(rows) => self.observer.record_event("load.rows", *rows),
            Err(_) => self.observer.record_event("load.chunk_failed", 1),
        }
        result
    }

    /// Loads every chunk concurrently. The first chunk error stops the wait
    /// and signals the remaining chunks to roll back; the report carries
    /// only rows from chunks that committed before that point.
    pub async fn load_concurrent(&self, trades: Vec<Trade>, cancel: &CancellationToken) -> LoadReport {
        let ranges = chunk_ranges(trades.len(), self.chunk_size);
        let chunk_count = ranges.len();
        let trades = Arc::new(trades);
        let chunk_cancel = cancel.child_token();

        let mut set = JoinSet::new();
        for range in ranges {
            let loader = self.clone();
            let trades = trades.clone();
            let token = chunk_cancel.clone();
            set.spawn(async move { loader.load_chunk(trades, range, token).await });
        }

        let mut report = LoadReport::default();
        while let Some(joined) = set.join_next().await {
            let outcome = joined
                .map_err(|e| IngestError::Internal(format!("chunk task: {e}")))
                .and_then(|r| r);

            match outcome {
                Ok(rows) => report.rows += rows,
                Err(e) => {
                    warn!(error = %e, committed = report.rows, "❌ Chunk load failed, abandoning remaining chunks");
                    chunk_cancel.cancel();
                    report.error = Some(e);
                    break;
                }
            }
        }

        debug!(
            chunks = chunk_count,
            rows = report.rows,
            failed = report.error.is_some(),
            "Bulk load finished"
        );
        report
    }
}

fn load_error(e: anyhow::Error) -> IngestError {
    IngestError::Load(format!("{e:#}"))
}

fn copy_chunk(
    store: &dyn BulkStore,
    trades: &[Trade],
    cancel: &CancellationToken,
) -> Result<u64, IngestError> {
    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled);
    }

    let mut tx = store.begin().map_err(load_error)?;
    let mut rows = TradeRows::new(trades, cancel);

    let copied = match tx.copy_in(TRADES_TABLE, &COLUMNS, &mut rows) {
        Ok(n) => n,
        Err(e) => {
            if let Err(rb) = tx.rollback() {
                warn!(error = %rb, "Rollback after failed copy also failed");
            }
            return Err(load_error(e));
        }
    };

    if rows.interrupted || cancel.is_cancelled() {
        tx.rollback().map_err(load_error)?;
        return Err(IngestError::Cancelled);
    }

    tx.commit().map_err(load_error)?;
    Ok(copied)
}

/// Lazily turns trades into row tuples; ends early once cancellation is seen.
struct TradeRows<'a> {
    trades: std::slice::Iter<'a, Trade>,
    cancel: &'a CancellationToken,
    interrupted: bool,
}

impl<'a> TradeRows<'a> {
    fn new(trades: &'a [Trade], cancel: &'a CancellationToken) -> Self {
        Self {
            trades: trades.iter(),
            cancel,
            interrupted: false,
        }
    }
}

impl Iterator for TradeRows<'_> {
    type Item = Vec<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancel.is_cancelled() {
            self.interrupted = true;
            return None;
        }
        self.trades.next().map(trade_row)
    }
}

fn trade_row(trade: &Trade) -> Vec<Value> {
    vec![
        Value::Text(trade.closing_time.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        Value::Text(trade.trade_date.format("%Y-%m-%d").to_string()),
        Value::Text(trade.ticker.clone()),
        Value::Text(trade.price.to_string()),
        Value::Integer(trade.quantity),
        Value::Text(trade.created_at.to_rfc3339()),
    ]
}
