//! Speed test service
//!
//! Single binary that runs:
//! - REST API for measurements and result history
//! - WebSocket and SSE endpoints for live progress
//!
//! Set `SIMULATE=1` to replace network transfers and latency probes with
//! scripted ones (local development without outbound traffic).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use speedtest_common::protocol::LegKind;
use speedtest_engine::EngineConfig;
use speedtest_engine::latency::{LatencyProber, ScriptedProber, SystemProber};
use speedtest_engine::source::{HttpSampleSource, SampleSource, ScriptedSource, steady_transfer};
use speedtest_engine::store::{MemoryStore, ResultStore};
use speedtest_server::{api, db, state};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Engine config ───────────────────────────────────────────
    let config = match std::env::var("SPEEDTEST_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
            let config = EngineConfig::from_toml_str(&text)?;
            tracing::info!(path = %path, "loaded engine config");
            config
        }
        Err(_) => EngineConfig::default(),
    };

    // ── Measurement collaborators ───────────────────────────────
    let (source, prober): (Arc<dyn SampleSource>, Arc<dyn LatencyProber>) =
        if std::env::var("SIMULATE").is_ok() {
            tracing::warn!("SIMULATE set, transfers and probes are scripted");
            simulated(&config)
        } else {
            (
                Arc::new(HttpSampleSource::new(&config)?),
                Arc::new(SystemProber),
            )
        };

    // ── Result store ────────────────────────────────────────────
    let store: Arc<dyn ResultStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = db::connect(&database_url).await?;
            db::migrate(&pool).await?;
            Arc::new(db::PgStore::new(pool))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, results are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    // ── Shared state ────────────────────────────────────────────
    let state = state::AppState::new(config, source, prober, store);

    // ── Router ──────────────────────────────────────────────────
    let app = Router::new()
        .nest("/speedtests", api::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // ── Listen ──────────────────────────────────────────────────
    let addr: SocketAddr = std::env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:5000".into())
        .parse()?;

    tracing::info!("speedtest-server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Scripted collaborators: a 50 Mbps down, 20 Mbps up link with 20 ms
/// latency, paced so each transfer takes about a second of wall time.
fn simulated(config: &EngineConfig) -> (Arc<dyn SampleSource>, Arc<dyn LatencyProber>) {
    let secs_at = |bytes: u64, mbps: f64| bytes as f64 * 8.0 / (mbps * 1024.0 * 1024.0);
    let download = config.download.full_bytes;
    let upload = config.upload.bytes;

    let source = ScriptedSource::new()
        .with_script(
            LegKind::Download,
            steady_transfer(download, secs_at(download, 50.0), 20),
        )
        .with_script(LegKind::Upload, steady_transfer(upload, secs_at(upload, 20.0), 20))
        .paced(Duration::from_millis(50));

    (Arc::new(source), Arc::new(ScriptedProber::constant(20.0)))
}
