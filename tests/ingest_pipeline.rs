//! Download -> extract -> parse -> load against a local file server and an
//! on-disk SQLite database.

use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    routing::get,
    Router,
};
use b3_ingest::{
    config::IngestConfig,
    observe::InMemoryObserver,
    service::IngestionService,
    storage::SqliteStore,
};
use chrono::NaiveDate;
use std::{
    io::{Cursor, Write},
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const HEADER: &str = "HoraFechamento;DataNegocio;CodigoInstrumento;PrecoNegocio;QuantidadeNegociada\n";

fn daily_zip(yyyymmdd: &str) -> Vec<u8> {
    let date = format!("{}-{}-{}", &yyyymmdd[0..4], &yyyymmdd[4..6], &yyyymmdd[6..8]);
    let mut body = String::from(HEADER);
    for i in 0..1_500 {
        let ticker = ["PETR4", "VALE3", "ITUB4"][i % 3];
        body.push_str(&format!("{:06};{};{};{},{:02};{}\n", 100000 + i, date, ticker, 20 + i % 7, i % 100, 100 + i));
    }
    body.push_str("garbage\n");

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(format!("COTAHIST_{yyyymmdd}.TXT"), zip::write::FileOptions::default())
        .unwrap();
    writer.write_all(body.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

async fn serve_archives(hits: Arc<AtomicUsize>) -> SocketAddr {
    async fn archive(
        State(hits): State<Arc<AtomicUsize>>,
        UrlPath(name): UrlPath<String>,
    ) -> Result<Vec<u8>, StatusCode> {
        hits.fetch_add(1, Ordering::SeqCst);
        let digits = name
            .strip_prefix("COTAHIST_")
            .and_then(|rest| rest.strip_suffix(".ZIP"))
            .ok_or(StatusCode::NOT_FOUND)?;
        Ok(daily_zip(digits))
    }

    let app = Router::new()
        .route("/SerHist/:name", get(archive))
        .with_state(hits);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

#[tokio::test]
async fn test_download_extract_and_load() {
    let hits = Arc::new(AtomicUsize::new(0));
    let addr = serve_archives(hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("trades.db");

    let config = IngestConfig {
        database_path: db_path.to_string_lossy().into_owned(),
        data_dir: dir.path().join("data"),
        base_url: format!("http://{addr}/SerHist"),
        workers: 3,
        batch_size: 256,
        chunk_size: 1_000,
        queue_capacity: 2,
        ..IngestConfig::default()
    };
    let store = Arc::new(SqliteStore::new(&config.database_path).unwrap());
    let observer = Arc::new(InMemoryObserver::new());
    let service = IngestionService::new(config, store.clone(), observer.clone()).unwrap();
    let cancel = CancellationToken::new();
    let start = NaiveDate::from_ymd_opt(2024, 1, 17).unwrap();

    let download = service.download_last_days(3, Some(start), true, &cancel).await;
    assert_eq!(download.dates.len(), 3);
    assert_eq!(download.files.len(), 3);
    assert!(download.failures.is_empty());
    assert_eq!(download.extracted.len(), 3);
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    let load = service.load_files(download.extracted.clone(), &cancel).await;
    assert_eq!(load.results.len(), 3);
    assert_eq!(load.failed_files, 0);
    assert_eq!(load.total_records, 4_500);
    assert_eq!(load.total_rejected, 3);
    assert_eq!(load.aggregations_refreshed, Some(9));
    assert_eq!(store.trade_count().unwrap(), 4_500);
    assert_eq!(observer.count("parse.lines"), 4_503);

    let agg = store
        .daily_aggregation("PETR4", "2024-01-16")
        .unwrap()
        .expect("aggregate");
    assert_eq!(agg.trade_count, 500);

    // Second run reuses the archives already on disk
    let again = service.download_last_days(3, Some(start), false, &cancel).await;
    assert_eq!(again.files, download.files);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(observer.count("download.skipped"), 3);
}

#[tokio::test]
async fn test_weekend_start_walks_back_to_business_days() {
    let addr = serve_archives(Arc::new(AtomicUsize::new(0))).await;
    let dir = tempfile::tempdir().unwrap();
    let config = IngestConfig {
        data_dir: dir.path().to_path_buf(),
        base_url: format!("http://{addr}/SerHist"),
        ..IngestConfig::default()
    };
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let service = IngestionService::new(config, store, Arc::new(InMemoryObserver::new())).unwrap();

    // Sunday 2024-01-21 -> Fri 19, Thu 18
    let start = NaiveDate::from_ymd_opt(2024, 1, 21).unwrap();
    let summary = service
        .download_last_days(2, Some(start), false, &CancellationToken::new())
        .await;

    assert_eq!(
        summary.dates,
        vec![
            NaiveDate::from_ymd_opt(2024, 1, 19).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 18).unwrap(),
        ]
    );
    assert!(dir.path().join("COTAHIST_20240119.ZIP").exists());
}
