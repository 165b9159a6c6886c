//! B3 trade ingestion library
//!
//! Downloads daily exchange trade files, parses them concurrently and
//! bulk-loads the trades into SQLite. Exposes the pipeline for the binary
//! and tests.

pub mod api;
pub mod calendar;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod models;
pub mod observe;
pub mod service;
pub mod storage;

pub use error::{IngestError, RecordError, RecordErrorKind};
pub use models::{JobResult, ParseOutcome, Trade};
