//! Measurement endpoints.
//!
//! GET  /speedtests/download       : run the download leg
//! POST /speedtests/upload         : time the request body as it arrives
//! GET  /speedtests/ping           : robust latency estimate
//! GET  /speedtests/quick-estimate : short download probe for gauge scaling
//! POST /speedtests/run            : start a full run in the background
//! GET  /speedtests/run            : current run phase
//!
//! Legs publish live samples on the progress channel; subscribe through
//! `/speedtests/ws` or `/speedtests/events`.

use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::mpsc;

use speedtest_common::models::RunPhase;
use speedtest_common::protocol::LegKind;
use speedtest_engine::EngineError;
use speedtest_engine::source::pump_stream;
use speedtest_engine::throughput::{display_scale, measure_leg, quick_estimate};

use crate::api::error::ApiError;
use crate::state::AppState;

const UPLOAD_QUEUE: usize = 64;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/download", get(download))
        .route("/upload", post(upload))
        .route("/ping", get(ping))
        .route("/quick-estimate", get(quick))
        .route("/run", get(run_status).post(start_run))
}

// ── Download ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub download_speed: f64,
}

async fn download(State(state): State<AppState>) -> Result<Json<DownloadResponse>, ApiError> {
    let _slot = state.claim_leg()?;
    let rx = state
        .source()
        .open(LegKind::Download, state.config().download.full_bytes);
    let download_speed = measure_leg(LegKind::Download, rx, state.progress()).await?;
    Ok(Json(DownloadResponse { download_speed }))
}

// ── Upload ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub upload_speed: f64,
}

/// Measures the bytes this endpoint actually accepts from the client.
async fn upload(
    State(state): State<AppState>,
    body: Body,
) -> Result<Json<UploadResponse>, ApiError> {
    let _slot = state.claim_leg()?;
    let started = Instant::now();
    let (tx, rx) = mpsc::channel(UPLOAD_QUEUE);

    let pump = async move {
        let received = pump_stream(body.into_data_stream(), started, &tx).await;
        if let Ok(bytes) = received {
            tracing::debug!(bytes, "upload body received");
        }
    };
    let measure = measure_leg(LegKind::Upload, rx, state.progress());
    let ((), upload_speed) = tokio::join!(pump, measure);

    Ok(Json(UploadResponse {
        upload_speed: upload_speed?,
    }))
}

// ── Ping ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PingResponse {
    /// Milliseconds; `null` when no probe produced a usable reading.
    pub ping: Option<f64>,
}

async fn ping(State(state): State<AppState>) -> Result<Json<PingResponse>, ApiError> {
    match state.latency().estimate().await {
        Ok(estimate) => Ok(Json(PingResponse {
            ping: Some(estimate.median_ms),
        })),
        Err(EngineError::NoValidSamples) => {
            tracing::warn!("latency unavailable");
            Ok(Json(PingResponse { ping: None }))
        }
        Err(e) => Err(e.into()),
    }
}

// ── Quick Estimate ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickEstimateResponse {
    pub estimated_speed: f64,
    pub display_scale: f64,
}

async fn quick(State(state): State<AppState>) -> Result<Json<QuickEstimateResponse>, ApiError> {
    let _slot = state.claim_leg()?;
    let download = &state.config().download;
    let estimated_speed = quick_estimate(
        state.source().as_ref(),
        download.quick_iterations,
        download.quick_bytes,
    )
    .await?;

    Ok(Json(QuickEstimateResponse {
        estimated_speed,
        display_scale: display_scale(estimated_speed),
    }))
}

// ── Orchestrated Run ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    pub run_id: String,
}

async fn start_run(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<StartRunResponse>), ApiError> {
    // Standalone legs and full runs share the progress channel.
    let slot = state.claim_leg()?;
    let (run_id, _handle) = state.orchestrator().start()?;
    drop(slot);

    tracing::info!(run_id = %run_id, "speed test run accepted");
    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { run_id })))
}

#[derive(Debug, Serialize)]
pub struct RunStatusResponse {
    pub running: bool,
    pub phase: RunPhase,
}

async fn run_status(State(state): State<AppState>) -> Json<RunStatusResponse> {
    let orchestrator = state.orchestrator();
    Json(RunStatusResponse {
        running: orchestrator.is_running(),
        phase: orchestrator.phase(),
    })
}
