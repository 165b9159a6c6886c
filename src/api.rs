//! Admin HTTP API
//!
//! Thin triggers over `IngestionService`; every request runs to completion
//! and answers with the same summary the CLI prints.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::service::{DownloadSummary, IngestionService, LoadSummary};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IngestionService>,
    pub metrics: Option<PrometheusHandle>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub days: usize,
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub extract: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub trades: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/api/v1/admin/load", post(admin_load))
        .route("/api/v1/admin/download", post(admin_download))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `state.shutdown` is cancelled.
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🎯 Admin API listening on {}", addr);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")
}

async fn check_store(service: &IngestionService) -> Result<i64> {
    service.health().await?;
    let store = service.store().clone();
    tokio::task::spawn_blocking(move || store.trade_count()).await?
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match check_store(&state.service).await {
        Ok(trades) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                trades: Some(trades),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unavailable",
                trades: None,
                error: Some(format!("{e:#}")),
            }),
        ),
    }
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn admin_load(
    State(state): State<AppState>,
    Json(req): Json<LoadRequest>,
) -> Result<Json<LoadSummary>, Response> {
    if req.files.is_empty() {
        return Err(bad_request("files must not be empty"));
    }
    let cancel = state.shutdown.child_token();
    Ok(Json(state.service.load_files(req.files, &cancel).await))
}

async fn admin_download(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<DownloadSummary>, Response> {
    if req.days > 366 {
        return Err(bad_request("days must be at most 366"));
    }
    let cancel = state.shutdown.child_token();
    Ok(Json(
        state
            .service
            .download_last_days(req.days, req.start_date, req.extract, &cancel)
            .await,
    ))
}
