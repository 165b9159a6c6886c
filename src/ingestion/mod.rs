//! Ingestion pipeline: download, parse, bulk-load

pub mod downloader;
pub mod extract;
pub mod layout;
pub mod loader;
pub mod parser;
pub mod worker;

pub use downloader::{Downloader, FetchReport};
pub use extract::extract_archive;
pub use layout::RecordLayout;
pub use loader::{chunk_ranges, BulkLoader, LoadReport};
pub use parser::Parser;
pub use worker::{Job, WorkerPool};
