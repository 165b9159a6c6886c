//! Ingestion error taxonomy
//!
//! Every failure in the pipeline is returned as a value. `IngestError` covers
//! transfer, file, stream, load and lifecycle failures; `RecordError` covers a
//! single rejected input line and never aborts the containing file.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum IngestError {
    #[error("transfer of {url} failed: {message}")]
    Transfer {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{}: {message}", path.display())]
    Io { path: PathBuf, message: String },

    #[error("stream read failed after {lines_read} lines: {message}")]
    Read { lines_read: u64, message: String },

    #[error("bulk load failed: {0}")]
    Load(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("internal task failure: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// One rejected data line. `line` is the 1-based data line number (the
/// header is not counted).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct RecordError {
    pub line: u64,
    pub kind: RecordErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordErrorKind {
    #[error("expected at least {required} columns, found {found}")]
    TooFewColumns { required: usize, found: usize },

    #[error("invalid trade date {0:?}")]
    InvalidDate(String),

    #[error("invalid price {0:?}")]
    InvalidPrice(String),

    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),

    #[error("empty instrument code")]
    EmptyTicker,

    #[error("malformed line: {0}")]
    Malformed(String),
}
