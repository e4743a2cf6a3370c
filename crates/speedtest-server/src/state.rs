//! Shared application state.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use speedtest_engine::latency::{LatencyEstimator, LatencyProber};
use speedtest_engine::orchestrator::Orchestrator;
use speedtest_engine::progress::ProgressChannel;
use speedtest_engine::source::SampleSource;
use speedtest_engine::store::ResultStore;
use speedtest_engine::{EngineConfig, EngineError};

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    orchestrator: Arc<Orchestrator>,
    /// Held while a standalone leg runs so legs never interleave their
    /// events on the progress channel.
    leg_slot: Mutex<()>,
}

impl AppState {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn SampleSource>,
        prober: Arc<dyn LatencyProber>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let progress = ProgressChannel::new(config.channel_capacity);
        let orchestrator = Orchestrator::new(config, source, prober, progress, store);
        Self {
            inner: Arc::new(Inner {
                orchestrator: Arc::new(orchestrator),
                leg_slot: Mutex::new(()),
            }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.inner.orchestrator
    }

    pub fn config(&self) -> &EngineConfig {
        self.inner.orchestrator.config()
    }

    pub fn source(&self) -> &Arc<dyn SampleSource> {
        self.inner.orchestrator.source()
    }

    pub fn latency(&self) -> &LatencyEstimator {
        self.inner.orchestrator.latency()
    }

    pub fn progress(&self) -> &ProgressChannel {
        self.inner.orchestrator.progress()
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        self.inner.orchestrator.store()
    }

    /// Claim the slot for a standalone leg. Fails while a full run or
    /// another leg is in flight.
    pub fn claim_leg(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        if self.inner.orchestrator.is_running() {
            return Err(EngineError::RunInProgress);
        }
        self.inner
            .leg_slot
            .try_lock()
            .map_err(|_| EngineError::RunInProgress)
    }
}
