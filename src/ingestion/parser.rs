//! Concurrent record parser
//!
//! One producer streams data lines off the reader into a bounded queue; a
//! fixed pool of parsing tasks pulls from it, decodes with the configured
//! `RecordLayout`, and hands back local batches. A bad line becomes one
//! `RecordError` and the stream keeps going.
//!
//! Cancellation stops the producer only. Lines already queued are still
//! decoded, so `trades + errors == lines_read` holds for every outcome.

use chrono::{DateTime, Utc};
use csv_async::{AsyncReaderBuilder, ErrorKind as CsvErrorKind, StringRecord};
use futures_util::StreamExt;
use std::{sync::Arc, time::Instant};
use tokio::{
    io::AsyncRead,
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::layout::RecordLayout;
use crate::{
    error::{IngestError, RecordError, RecordErrorKind},
    models::{ParseOutcome, Trade},
    observe::SharedObserver,
};

type NumberedRecord = (u64, StringRecord);

#[derive(Default)]
struct ParseBatch {
    trades: Vec<Trade>,
    errors: Vec<RecordError>,
}

impl ParseBatch {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            trades: Vec::with_capacity(capacity),
            errors: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.trades.is_empty() && self.errors.is_empty()
    }
}

#[derive(Default)]
struct Production {
    lines_read: u64,
    errors: Vec<RecordError>,
}

#[derive(Clone)]
pub struct Parser {
    layout: RecordLayout,
    batch_size: usize,
    workers: usize,
    observer: SharedObserver,
}

impl Parser {
    pub fn new(layout: RecordLayout, batch_size: usize, workers: usize, observer: SharedObserver) -> Self {
        Self {
            layout,
            batch_size: batch_size.max(1),
            workers: workers.max(1),
            observer,
        }
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Parses a `;`-delimited stream whose first line is a header.
    ///
    /// Trade order in the outcome is unspecified. Only a failure of the
    /// underlying reader is fatal.
    pub async fn parse_stream<R>(
        &self,
        reader: R,
        cancel: &CancellationToken,
    ) -> Result<ParseOutcome, IngestError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        let created_at = Utc::now();

        let (line_tx, line_rx) = mpsc::channel::<NumberedRecord>(self.workers * 2);
        let (batch_tx, mut batch_rx) = mpsc::channel::<ParseBatch>(self.workers);
        let shared_rx = Arc::new(Mutex::new(line_rx));

        let handles: Vec<_> = (0..self.workers)
            .map(|_| {
                tokio::spawn(parse_worker(
                    self.layout,
                    self.batch_size,
                    created_at,
                    shared_rx.clone(),
                    batch_tx.clone(),
                ))
            })
            .collect();
        drop(shared_rx);
        drop(batch_tx);

        let collect = async {
            let mut outcome = ParseOutcome::default();
            while let Some(batch) = batch_rx.recv().await {
                outcome.trades.extend(batch.trades);
                outcome.errors.extend(batch.errors);
            }
            outcome
        };

        let (produced, mut outcome) = tokio::join!(produce_records(reader, line_tx, cancel), collect);

        for handle in handles {
            handle
                .await
                .map_err(|e| IngestError::Internal(format!("parse task: {e}")))?;
        }

        let produced = produced?;
        outcome.lines_read = produced.lines_read;
        outcome.errors.extend(produced.errors);

        self.observer.record_event("parse.lines", outcome.lines_read);
        self.observer.record_event("parse.trades", outcome.trades.len() as u64);
        self.observer.record_event("parse.rejected", outcome.errors.len() as u64);
        self.observer.record_duration("parse.file", started.elapsed());

        debug!(
            layout = %self.layout,
            lines = outcome.lines_read,
            trades = outcome.trades.len(),
            rejected = outcome.errors.len(),
            cancelled = cancel.is_cancelled(),
            "Parsed stream in {:?}",
            started.elapsed()
        );

        Ok(outcome)
    }
}

async fn produce_records<R>(
    reader: R,
    line_tx: mpsc::Sender<NumberedRecord>,
    cancel: &CancellationToken,
) -> Result<Production, IngestError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut csv_reader = AsyncReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(true)
        .create_reader(reader);
    let mut records = csv_reader.records();
    let mut production = Production::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = records.next() => next,
        };
        let Some(result) = next else {
            break;
        };

        match result {
            Ok(record) => {
                // Counted only once a parse task is guaranteed to see it
                let item = (production.lines_read + 1, record);
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = line_tx.send(item) => sent,
                };
                if sent.is_err() {
                    break;
                }
                production.lines_read += 1;
            }
            Err(err) => {
                if let CsvErrorKind::Io(io_err) = err.kind() {
                    warn!(lines = production.lines_read, error = %io_err, "Stream read failed");
                    return Err(IngestError::Read {
                        lines_read: production.lines_read,
                        message: io_err.to_string(),
                    });
                }
                production.lines_read += 1;
                production.errors.push(RecordError {
                    line: production.lines_read,
                    kind: RecordErrorKind::Malformed(err.to_string()),
                });
            }
        }
    }

    Ok(production)
}

async fn parse_worker(
    layout: RecordLayout,
    batch_size: usize,
    created_at: DateTime<Utc>,
    lines: Arc<Mutex<mpsc::Receiver<NumberedRecord>>>,
    batches: mpsc::Sender<ParseBatch>,
) {
    let mut batch = ParseBatch::with_capacity(batch_size);

    loop {
        // Ends once the producer has stopped and the queue is drained, so
        // every line it counted is decoded
        let next = { lines.lock().await.recv().await };
        let Some((line, record)) = next else {
            break;
        };

        match layout.decode(&record, created_at) {
            Ok(trade) => batch.trades.push(trade),
            Err(kind) => batch.errors.push(RecordError { line, kind }),
        }

        if batch.trades.len() >= batch_size {
            let full = std::mem::replace(&mut batch, ParseBatch::with_capacity(batch_size));
            if batches.send(full).await.is_err() {
                return;
            }
        }
    }

    // Flush the partial batch
    if !batch.is_empty() {
        let _ = batches.send(batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::{InMemoryObserver, NoopObserver};
    use rust_decimal::Decimal;
    use std::{
        io,
        pin::Pin,
        str::FromStr,
        task::{Context, Poll},
    };
    use tokio::io::ReadBuf;

    const HEADER: &str = "HoraFechamento;DataNegocio;CodigoInstrumento;PrecoNegocio;QuantidadeNegociada\n";

    fn parser(batch_size: usize, workers: usize) -> Parser {
        Parser::new(RecordLayout::Compact, batch_size, workers, Arc::new(NoopObserver))
    }

    fn generate_csv(lines: usize, bad_every: usize) -> String {
        let tickers = ["PETR4", "VALE3", "ITUB4", "BBDC4"];
        let mut out = String::from(HEADER);
        for i in 0..lines {
            if bad_every > 0 && i % bad_every == 0 {
                out.push_str("15:30:00;2024-01-15;BROKEN\n");
                continue;
            }
            out.push_str(&format!(
                "15:30:00;2024-01-15;{};{},{:02};{}\n",
                tickers[i % tickers.len()],
                20 + i % 30,
                i % 100,
                100 + i % 1000
            ));
        }
        out
    }

    #[tokio::test]
    async fn test_single_valid_line() {
        let input = format!("{HEADER}15:30:00;2024-01-15;PETR4;20.50;100\n");
        let outcome = parser(10, 2)
            .parse_stream(input.as_bytes(), &CancellationToken::new())
            .await
            .expect("parse");

        assert_eq!(outcome.trades.len(), 1);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.lines_read, 1);
        let trade = &outcome.trades[0];
        assert_eq!(trade.price, Decimal::from_str("20.50").unwrap());
        assert_eq!(trade.quantity, 100);
        assert_eq!(trade.ticker, "PETR4");
    }

    #[tokio::test]
    async fn test_short_line_is_rejected_not_fatal() {
        let input = format!("{HEADER}15:30:00;2024-01-15;PETR4\n");
        let outcome = parser(10, 2)
            .parse_stream(input.as_bytes(), &CancellationToken::new())
            .await
            .expect("parse");

        assert!(outcome.trades.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].line, 1);
        assert_eq!(
            outcome.errors[0].kind,
            RecordErrorKind::TooFewColumns { required: 5, found: 3 }
        );
    }

    #[tokio::test]
    async fn test_header_only_and_empty_input() {
        let p = parser(10, 3);
        let cancel = CancellationToken::new();

        let outcome = p.parse_stream(HEADER.as_bytes(), &cancel).await.expect("parse");
        assert_eq!(outcome.lines_read, 0);
        assert!(outcome.trades.is_empty());

        let outcome = p.parse_stream(&b""[..], &cancel).await.expect("parse");
        assert_eq!(outcome.lines_read, 0);
    }

    #[tokio::test]
    async fn test_every_line_accounted_for() {
        let input = generate_csv(10_000, 7);
        let observer = Arc::new(InMemoryObserver::new());
        let p = Parser::new(RecordLayout::Compact, 64, 4, observer.clone());

        let outcome = p
            .parse_stream(input.as_bytes(), &CancellationToken::new())
            .await
            .expect("parse");

        let expected_bad = (0..10_000).filter(|i| i % 7 == 0).count();
        assert_eq!(outcome.lines_read, 10_000);
        assert_eq!(outcome.errors.len(), expected_bad);
        assert_eq!(outcome.trades.len() + outcome.errors.len(), 10_000);
        assert_eq!(observer.count("parse.trades"), outcome.trades.len() as u64);
        assert_eq!(observer.count("parse.rejected"), expected_bad as u64);

        // Every rejected line number is distinct
        let mut lines: Vec<u64> = outcome.errors.iter().map(|e| e.line).collect();
        lines.sort_unstable();
        lines.dedup();
        assert_eq!(lines.len(), expected_bad);
    }

    #[tokio::test]
    async fn test_result_independent_of_worker_count() {
        let input = generate_csv(2_500, 0);
        let expected_qty: i64 = (0..2_500).map(|i| 100 + (i % 1000) as i64).sum();

        for workers in [1, 2, 8] {
            let outcome = parser(100, workers)
                .parse_stream(input.as_bytes(), &CancellationToken::new())
                .await
                .expect("parse");
            assert_eq!(outcome.trades.len(), 2_500);
            let qty: i64 = outcome.trades.iter().map(|t| t.quantity).sum();
            assert_eq!(qty, expected_qty, "workers={workers}");
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_record_error() {
        let mut input = HEADER.as_bytes().to_vec();
        input.extend_from_slice(b"15:30:00;2024-01-15;PETR4;20,50;100\n");
        input.extend_from_slice(b"15:30:00;2024-01-15;\xff\xfe;20,50;100\n");
        input.extend_from_slice(b"15:30:00;2024-01-15;VALE3;60,00;10\n");

        let outcome = parser(10, 2)
            .parse_stream(&input[..], &CancellationToken::new())
            .await
            .expect("parse");

        assert_eq!(outcome.lines_read, 3);
        assert_eq!(outcome.trades.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(outcome.errors[0].kind, RecordErrorKind::Malformed(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_produces_nothing() {
        let input = generate_csv(1_000, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = parser(10, 2)
            .parse_stream(input.as_bytes(), &cancel)
            .await
            .expect("cancellation is not a parse failure");

        assert_eq!(outcome.lines_read, 0);
        assert!(outcome.trades.is_empty());
    }

    struct FailingReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos >= self.data.len() {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
            }
            let n = buf.remaining().min(self.data.len() - self.pos);
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_reader_failure_is_fatal() {
        let reader = FailingReader {
            data: format!("{HEADER}15:30:00;2024-01-15;PETR4;20,50;100\n").into_bytes(),
            pos: 0,
        };

        let err = parser(10, 2)
            .parse_stream(reader, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Read { .. }), "{err:?}");
    }

    /// Serves its data, then cancels the token and stalls like an idle socket.
    struct GatedReader {
        data: Vec<u8>,
        pos: usize,
        cancel: CancellationToken,
    }

    impl AsyncRead for GatedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos >= self.data.len() {
                self.cancel.cancel();
                return Poll::Pending;
            }
            // Small reads so the producer is mid-stream when the gate closes
            let n = buf.remaining().min(self.data.len() - self.pos).min(512);
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_keeps_parsed_lines() {
        let cancel = CancellationToken::new();
        let reader = GatedReader {
            data: generate_csv(1_000, 9).into_bytes(),
            pos: 0,
            cancel: cancel.clone(),
        };

        let outcome = parser(64, 4)
            .parse_stream(reader, &cancel)
            .await
            .expect("cancellation is not a parse failure");

        assert!(cancel.is_cancelled());
        assert!(outcome.lines_read > 0);
        assert!(!outcome.trades.is_empty());
        assert_eq!(
            outcome.trades.len() + outcome.errors.len(),
            outcome.lines_read as usize
        );
    }

    #[tokio::test]
    async fn test_short_closing_time_uses_sentinel() {
        let input = format!(
            "{HEADER}1530;2024-01-15;PETR4;20,50;100\n15:30:00;2024-01-15;VALE3;60,00;10\n"
        );
        let outcome = parser(10, 2)
            .parse_stream(input.as_bytes(), &CancellationToken::new())
            .await
            .expect("a short time is not a read failure");

        assert_eq!(outcome.lines_read, 2);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.trades.len(), 2);
        let petr = outcome
            .trades
            .iter()
            .find(|t| t.ticker == "PETR4")
            .expect("PETR4 trade");
        assert_eq!(petr.closing_time, crate::ingestion::layout::sentinel_closing_time());
    }
}
