//! Process configuration
//!
//! Read once from the environment (after `.env`) by the binary and handed to
//! components as plain values.

use anyhow::{anyhow, Result};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::{calendar::parse_month_day, ingestion::RecordLayout};

pub const DEFAULT_BASE_URL: &str = "https://bvmf.bmfbovespa.com.br/InstDados/SerHist";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_path: String,
    pub data_dir: PathBuf,

    pub base_url: String,
    pub file_prefix: String,
    pub file_extension: String,
    pub http_timeout: Duration,

    pub workers: usize,
    pub batch_size: usize,
    pub chunk_size: usize,
    pub queue_capacity: usize,
    pub layout: RecordLayout,

    pub publication_lag_days: u32,
    pub extra_holidays: Vec<(u32, u32)>,

    pub api_host: String,
    pub api_port: u16,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_path: "./b3_trades.db".to_string(),
            data_dir: PathBuf::from("./data"),
            base_url: DEFAULT_BASE_URL.to_string(),
            file_prefix: "COTAHIST_".to_string(),
            file_extension: "ZIP".to_string(),
            http_timeout: Duration::from_secs(300),
            workers: 4,
            batch_size: 10_000,
            chunk_size: 10_000,
            queue_capacity: 8,
            layout: RecordLayout::Compact,
            publication_lag_days: 3,
            extra_holidays: Vec::new(),
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let non_empty_env = |key: &str| non_empty(&lookup, key);

        let workers = parse_value(&lookup, "WORKERS")
            .filter(|&v: &usize| v > 0)
            .unwrap_or(defaults.workers);
        let batch_size = parse_value(&lookup, "BATCH_SIZE")
            .filter(|&v: &usize| v > 0)
            .unwrap_or(defaults.batch_size);
        let chunk_size = parse_value(&lookup, "CHUNK_SIZE")
            .filter(|&v: &usize| v > 0)
            .unwrap_or(batch_size);
        let queue_capacity = parse_value(&lookup, "QUEUE_CAPACITY")
            .filter(|&v: &usize| v > 0)
            .unwrap_or(workers * 2);

        let layout = match non_empty_env("RECORD_LAYOUT") {
            Some(raw) => RecordLayout::from_str(&raw)?,
            None => defaults.layout,
        };

        let extra_holidays = match non_empty_env("EXTRA_HOLIDAYS") {
            Some(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| parse_month_day(s).ok_or_else(|| anyhow!("Invalid EXTRA_HOLIDAYS entry {:?}", s)))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            database_path: non_empty_env("DATABASE_PATH").unwrap_or(defaults.database_path),
            data_dir: non_empty_env("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            base_url: non_empty_env("B3_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            file_prefix: non_empty_env("B3_FILE_PREFIX").unwrap_or(defaults.file_prefix),
            file_extension: non_empty_env("B3_FILE_EXTENSION").unwrap_or(defaults.file_extension),
            http_timeout: parse_value(&lookup, "HTTP_TIMEOUT_SECS")
                .filter(|&v: &u64| v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            workers,
            batch_size,
            chunk_size,
            queue_capacity,
            layout,
            publication_lag_days: parse_value(&lookup, "PUBLICATION_LAG_DAYS")
                .unwrap_or(defaults.publication_lag_days),
            extra_holidays,
            api_host: non_empty_env("API_HOST").unwrap_or(defaults.api_host),
            api_port: parse_value(&lookup, "API_PORT").unwrap_or(defaults.api_port),
        })
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn parse_value<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    non_empty(lookup, key).and_then(|v| v.trim().parse().ok())
}
