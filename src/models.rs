//! Core data types shared by the ingestion pipeline

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;

use crate::error::{IngestError, RecordError};

/// A single executed trade, as decoded from one exchange file line.
///
/// Never mutated after parsing; the pipeline owns it until storage accepts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    pub closing_time: NaiveDateTime,
    pub trade_date: NaiveDate,
    pub ticker: String,
    pub price: Decimal,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

/// Result of parsing one stream: accepted trades plus one error per rejected
/// data line.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub trades: Vec<Trade>,
    pub errors: Vec<RecordError>,
    /// Data lines pulled from the stream (header excluded).
    pub lines_read: u64,
}

impl ParseOutcome {
    pub fn rejected(&self) -> usize {
        self.errors.len()
    }
}

/// Outcome of one "process this file" job. Produced exactly once per job.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub path: PathBuf,
    pub records_count: u64,
    pub records_rejected: u64,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<IngestError>,
}

impl JobResult {
    pub fn failed(path: PathBuf, error: IngestError) -> Self {
        Self {
            path,
            records_count: 0,
            records_rejected: 0,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

fn serialize_error<S>(error: &Option<IngestError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}
