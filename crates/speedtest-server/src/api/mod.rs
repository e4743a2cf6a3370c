//! REST API route tree.

pub mod error;
pub mod measure;
pub mod results;

use axum::Router;
use axum::routing::get;

use crate::state::AppState;
use crate::ws_progress;

/// Build the `/speedtests` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(results::router())
        .merge(measure::router())
        .route("/ws", get(ws_progress::ws_handler))
        .route("/events", get(ws_progress::sse_handler))
}
