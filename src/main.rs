//! b3-ingest - B3 daily trade file ingestion
//!
//! Usage:
//!   b3-ingest download --days 5 --extract
//!   b3-ingest load ./data/COTAHIST_20240115.TXT
//!   b3-ingest serve --port 8000
//!
//! Configuration comes from the environment (and `.env`); flags override it.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use b3_ingest::{
    api::{self, AppState},
    config::IngestConfig,
    ingestion::RecordLayout,
    observe::{MetricsObserver, SharedObserver},
    service::{self, IngestionService},
    storage::SqliteStore,
};

#[derive(Parser, Debug)]
#[command(name = "b3-ingest")]
#[command(about = "Download, parse and bulk-load B3 daily trade files")]
struct Cli {
    /// SQLite database path
    #[arg(long, global = true)]
    database: Option<String>,

    /// Worker count for downloads, parsing and file jobs
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Record layout of the input files (compact | intraday)
    #[arg(long, global = true)]
    layout: Option<RecordLayout>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the files for the last N business days
    Download {
        #[arg(short, long, default_value_t = 5)]
        days: usize,

        /// Output directory (defaults to DATA_DIR)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Unpack downloaded archives next to them
        #[arg(short, long)]
        extract: bool,

        /// Walk back from this date instead of today minus the publication lag
        #[arg(long)]
        start_date: Option<NaiveDate>,
    },
    /// List files in a directory
    List {
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Parse and load the given files
    Load {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Rebuild the daily aggregation table
    Refresh,
    /// Check database connectivity
    Health,
    /// Run the admin API
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let mut config = IngestConfig::from_env()?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if let Some(workers) = cli.workers.filter(|&w| w > 0) {
        config.workers = workers;
    }
    if let Some(layout) = cli.layout {
        config.layout = layout;
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, cancelling");
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Command::List { dir } => {
            let dir = dir.unwrap_or_else(|| config.data_dir.clone());
            let files = service::list_files(&dir).await?;
            if files.is_empty() {
                println!("No files in {}", dir.display());
            }
            for file in files {
                println!("{:>12}  {}", file.size_bytes, file.name);
            }
            Ok(())
        }
        Command::Download {
            days,
            output,
            extract,
            start_date,
        } => {
            if let Some(output) = output {
                config.data_dir = output;
            }
            let svc = build_service(config, Arc::new(MetricsObserver))?;
            let summary = svc.download_last_days(days, start_date, extract, &cancel).await;
            print_json(&summary)?;
            if summary.files.is_empty() && !summary.dates.is_empty() {
                bail!("no files downloaded ({} dates failed)", summary.failures.len());
            }
            Ok(())
        }
        Command::Load { files } => {
            let svc = build_service(config, Arc::new(MetricsObserver))?;
            let summary = svc.load_files(files, &cancel).await;
            print_json(&summary)?;
            if summary.failed_files == summary.results.len() {
                bail!("all {} files failed", summary.failed_files);
            }
            Ok(())
        }
        Command::Refresh => {
            let svc = build_service(config, Arc::new(MetricsObserver))?;
            let rows = svc.refresh_aggregations().await?;
            info!("🔄 Refreshed {} daily aggregations", rows);
            Ok(())
        }
        Command::Health => {
            let svc = build_service(config, Arc::new(MetricsObserver))?;
            svc.health().await?;
            println!("ok ({} trades)", svc.store().trade_count()?);
            Ok(())
        }
        Command::Serve { host, port } => {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install Prometheus recorder")?;
            let addr = format!(
                "{}:{}",
                host.unwrap_or_else(|| config.api_host.clone()),
                port.unwrap_or(config.api_port)
            );
            let svc = build_service(config, Arc::new(MetricsObserver))?;
            info!("🚀 b3-ingest admin API starting");
            api::serve(
                AppState {
                    service: Arc::new(svc),
                    metrics: Some(handle),
                    shutdown: cancel,
                },
                &addr,
            )
            .await
        }
    }
}

fn build_service(config: IngestConfig, observer: SharedObserver) -> Result<IngestionService> {
    let store = SqliteStore::new(&config.database_path)?;
    IngestionService::new(config, Arc::new(store), observer)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "b3_ingest=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate root
    let _ = dotenv::dotenv();
    let manifest_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
