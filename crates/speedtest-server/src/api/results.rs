//! Result history endpoints.
//!
//! GET  /speedtests : list stored results, newest first
//! POST /speedtests : store a client-submitted result

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use speedtest_common::models::{SpeedTestRecord, StoredSpeedTest};

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_results).post(create_result))
}

async fn list_results(
    State(state): State<AppState>,
) -> Result<Json<Vec<StoredSpeedTest>>, ApiError> {
    Ok(Json(state.store().list().await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResultRequest {
    pub download_speed_mbps: f64,
    pub upload_speed_mbps: f64,
    pub ping_ms: Option<f64>,
    /// Defaults to the time of receipt.
    pub timestamp: Option<DateTime<Utc>>,
}

async fn create_result(
    State(state): State<AppState>,
    Json(body): Json<CreateResultRequest>,
) -> Result<(StatusCode, Json<StoredSpeedTest>), ApiError> {
    let mut record =
        SpeedTestRecord::new(body.download_speed_mbps, body.upload_speed_mbps, body.ping_ms);
    if let Some(timestamp) = body.timestamp {
        record.timestamp = timestamp;
    }

    let stored = state.store().insert(record).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}
