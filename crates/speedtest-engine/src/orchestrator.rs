//! Test orchestrator: sequences one full run:
//! quick estimate → latency → download → settle → upload → persist.
//!
//! Quick-estimate and latency failures are soft: the run continues with no
//! scale hint or no latency figure. A failed leg is fatal: the run ends in
//! `Failed`, partial figures are discarded and nothing is persisted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use speedtest_common::ids;
use speedtest_common::models::{RunPhase, SpeedTestRecord, StoredSpeedTest};
use speedtest_common::protocol::LegKind;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::latency::{LatencyEstimate, LatencyEstimator, LatencyProber};
use crate::progress::ProgressChannel;
use crate::source::SampleSource;
use crate::store::ResultStore;
use crate::throughput::{display_scale, measure_leg, quick_estimate};

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub stored: StoredSpeedTest,
    pub latency: Option<LatencyEstimate>,
    pub quick_estimate_mbps: Option<f64>,
    pub display_scale: Option<f64>,
}

pub struct Orchestrator {
    config: EngineConfig,
    source: Arc<dyn SampleSource>,
    latency: LatencyEstimator,
    progress: ProgressChannel,
    store: Arc<dyn ResultStore>,
    phase: watch::Sender<RunPhase>,
    running: Arc<AtomicBool>,
}

/// Clears the in-flight flag when a run ends, however it ends.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn SampleSource>,
        prober: Arc<dyn LatencyProber>,
        progress: ProgressChannel,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let latency = LatencyEstimator::new(prober, config.latency.clone());
        let (phase, _) = watch::channel(RunPhase::Idle);
        Self {
            config,
            source,
            latency,
            progress,
            store,
            phase,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn SampleSource> {
        &self.source
    }

    pub fn latency(&self) -> &LatencyEstimator {
        &self.latency
    }

    pub fn progress(&self) -> &ProgressChannel {
        &self.progress
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Current phase of the latest run.
    pub fn phase(&self) -> RunPhase {
        self.phase.borrow().clone()
    }

    pub fn watch_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run to completion on the current task.
    pub async fn run(&self) -> Result<RunOutcome, EngineError> {
        let guard = self.begin()?;
        self.run_guarded(guard, ids::run_id()).await
    }

    /// Claim the run slot now and continue the run on a background task.
    /// Returns the run ID and the task handle.
    pub fn start(
        self: &Arc<Self>,
    ) -> Result<(String, JoinHandle<Result<RunOutcome, EngineError>>), EngineError> {
        let guard = self.begin()?;
        let run_id = ids::run_id();
        let this = Arc::clone(self);
        let task_run_id = run_id.clone();
        let handle = tokio::spawn(async move { this.run_guarded(guard, task_run_id).await });
        Ok((run_id, handle))
    }

    fn begin(&self) -> Result<RunGuard, EngineError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::RunInProgress);
        }
        Ok(RunGuard(Arc::clone(&self.running)))
    }

    async fn run_guarded(
        &self,
        _guard: RunGuard,
        run_id: String,
    ) -> Result<RunOutcome, EngineError> {
        tracing::info!(run_id = %run_id, "speed test run starting");
        let result = self.run_phases(&run_id).await;
        match &result {
            Ok(outcome) => tracing::info!(
                run_id = %run_id,
                result_id = %outcome.stored.id,
                download_mbps = outcome.stored.record.download_speed_mbps,
                upload_mbps = outcome.stored.record.upload_speed_mbps,
                ping_ms = ?outcome.stored.record.ping_ms,
                "speed test run completed"
            ),
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "speed test run failed");
                self.transition(RunPhase::Failed(e.public_message().to_string()));
            }
        }
        result
    }

    async fn run_phases(&self, run_id: &str) -> Result<RunOutcome, EngineError> {
        let download_cfg = &self.config.download;

        self.transition(RunPhase::QuickEstimating);
        let quick_estimate_mbps = match quick_estimate(
            self.source.as_ref(),
            download_cfg.quick_iterations,
            download_cfg.quick_bytes,
        )
        .await
        {
            Ok(mbps) => Some(mbps),
            Err(e) => {
                tracing::warn!(run_id, error = %e, "quick estimate failed, continuing without scale");
                None
            }
        };
        let display_scale = quick_estimate_mbps.map(display_scale);

        self.transition(RunPhase::ProbingLatency);
        let latency = match self.latency.estimate().await {
            Ok(estimate) => Some(estimate),
            Err(EngineError::NoValidSamples) => None,
            Err(e) => return Err(e),
        };

        self.transition(RunPhase::Downloading);
        let download_mbps = measure_leg(
            LegKind::Download,
            self.source.open(LegKind::Download, download_cfg.full_bytes),
            &self.progress,
        )
        .await?;

        self.transition(RunPhase::TransitioningToUpload);
        tokio::time::sleep(self.config.settle_delay).await;

        self.transition(RunPhase::Uploading);
        let upload_mbps = measure_leg(
            LegKind::Upload,
            self.source.open(LegKind::Upload, self.config.upload.bytes),
            &self.progress,
        )
        .await?;

        let record = SpeedTestRecord::new(
            download_mbps,
            upload_mbps,
            latency.map(|l| l.median_ms),
        );
        let stored = self.store.insert(record).await?;
        self.transition(RunPhase::Completed);

        Ok(RunOutcome {
            run_id: run_id.to_string(),
            stored,
            latency,
            quick_estimate_mbps,
            display_scale,
        })
    }

    fn transition(&self, next: RunPhase) {
        tracing::info!(phase = %next, "run phase");
        self.phase.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::{LEG_FAILED, ProbeError};
    use crate::latency::ScriptedProber;
    use crate::source::{ScriptedSource, SourceEvent, failing_transfer, steady_transfer};
    use crate::store::MemoryStore;

    const HUNDRED_MIB: u64 = 104_857_600;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.settle_delay = Duration::ZERO;
        config.download.quick_iterations = 2;
        config.latency.iterations = 4;
        config.latency.retry_delay = Duration::ZERO;
        config
    }

    fn healthy_source() -> ScriptedSource {
        ScriptedSource::new()
            .with_script(LegKind::Download, steady_transfer(5 * 1024 * 1024, 1.0, 2))
            .with_script(LegKind::Download, steady_transfer(5 * 1024 * 1024, 1.0, 2))
            .with_script(LegKind::Download, steady_transfer(HUNDRED_MIB, 10.0, 5))
            .with_script(LegKind::Upload, steady_transfer(HUNDRED_MIB / 4, 10.0, 5))
    }

    fn orchestrator(
        source: ScriptedSource,
        prober: ScriptedProber,
    ) -> (Orchestrator, Arc<MemoryStore>, ProgressChannel) {
        let store = Arc::new(MemoryStore::new());
        let progress = ProgressChannel::new(256);
        let orch = Orchestrator::new(
            test_config(),
            Arc::new(source),
            Arc::new(prober),
            progress.clone(),
            store.clone(),
        );
        (orch, store, progress)
    }

    #[tokio::test]
    async fn completed_run_persists_exactly_once() {
        let (orch, store, progress) = orchestrator(healthy_source(), ScriptedProber::constant(19.5));
        let mut sub = progress.subscribe();

        let outcome = orch.run().await.unwrap();
        assert_eq!(outcome.stored.record.download_speed_mbps, 80.0);
        assert_eq!(outcome.stored.record.upload_speed_mbps, 20.0);
        assert_eq!(outcome.stored.record.ping_ms, Some(19.5));
        assert_eq!(outcome.quick_estimate_mbps, Some(40.0));
        assert_eq!(outcome.display_scale, Some(50.0));
        assert_eq!(orch.phase(), RunPhase::Completed);
        assert!(!orch.is_running());

        let stored = store.list().await.unwrap();
        assert_eq!(stored, vec![outcome.stored.clone()]);

        // Download events strictly precede upload events; each leg ends done.
        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        let first_upload = events.iter().position(|e| e.upload_speed.is_some()).unwrap();
        assert!(events[..first_upload].iter().all(|e| e.download_speed.is_some()));
        assert!(events[first_upload..].iter().all(|e| e.upload_speed.is_some()));
        assert!(events[first_upload - 1].is_done());
        assert_eq!(events[first_upload - 1].download_mbps(), Some(80.0));
        assert!(events.last().unwrap().is_done());
        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 2);
    }

    #[tokio::test]
    async fn latency_failure_is_soft() {
        let prober = ScriptedProber::new([], [])
            .with_fallback(Err(ProbeError::Unreachable("blocked".into())));
        let (orch, store, _) = orchestrator(healthy_source(), prober);

        let outcome = orch.run().await.unwrap();
        assert_eq!(outcome.latency, None);
        assert_eq!(outcome.stored.record.ping_ms, None);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn quick_estimate_failure_is_soft() {
        let source = ScriptedSource::new()
            .with_script(LegKind::Download, vec![SourceEvent::Failed("reset".into())])
            .with_script(LegKind::Download, vec![SourceEvent::Failed("reset".into())])
            .with_script(LegKind::Download, steady_transfer(HUNDRED_MIB, 10.0, 5))
            .with_script(LegKind::Upload, steady_transfer(HUNDRED_MIB, 10.0, 5));
        let (orch, _, _) = orchestrator(source, ScriptedProber::constant(10.0));

        let outcome = orch.run().await.unwrap();
        assert_eq!(outcome.quick_estimate_mbps, None);
        assert_eq!(outcome.display_scale, None);
        assert_eq!(outcome.stored.record.download_speed_mbps, 80.0);
    }

    #[tokio::test]
    async fn failed_leg_persists_nothing() {
        let source = ScriptedSource::new()
            .with_script(LegKind::Download, steady_transfer(5 * 1024 * 1024, 1.0, 2))
            .with_script(LegKind::Download, steady_transfer(5 * 1024 * 1024, 1.0, 2))
            .with_script(
                LegKind::Download,
                failing_transfer(
                    HUNDRED_MIB,
                    3 * 1024 * 1024,
                    10.0,
                    "tcp connect error: Connection refused (os error 111)",
                ),
            )
            .with_script(LegKind::Upload, steady_transfer(HUNDRED_MIB, 10.0, 5));
        let (orch, store, _) = orchestrator(source, ScriptedProber::constant(10.0));

        let err = orch.run().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::TransferFailed { leg: LegKind::Download, .. }
        ));
        // The phase is visible to API clients; transport detail stays in logs.
        assert_eq!(orch.phase(), RunPhase::Failed(LEG_FAILED.to_string()));
        assert!(store.list().await.unwrap().is_empty());
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn failed_upload_persists_nothing() {
        let source = ScriptedSource::new()
            .with_script(LegKind::Download, steady_transfer(HUNDRED_MIB, 10.0, 5))
            .with_script(
                LegKind::Upload,
                failing_transfer(HUNDRED_MIB, 1024, 10.0, "broken pipe"),
            );
        let (orch, store, _) = orchestrator(source, ScriptedProber::constant(10.0));

        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, EngineError::TransferFailed { leg: LegKind::Upload, .. }));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_overlapping_runs() {
        let (orch, _, _) = orchestrator(healthy_source(), ScriptedProber::constant(10.0));
        let guard = orch.begin().unwrap();
        assert!(orch.is_running());
        assert!(matches!(orch.run().await, Err(EngineError::RunInProgress)));
        drop(guard);
        assert!(orch.run().await.is_ok());
    }

    #[tokio::test]
    async fn started_run_completes_in_background() {
        let (orch, store, _) = orchestrator(healthy_source(), ScriptedProber::constant(10.0));
        let orch = Arc::new(orch);
        let mut phase = orch.watch_phase();
        let (run_id, handle) = orch.start().unwrap();
        assert!(run_id.starts_with("run_"));
        assert!(matches!(orch.start(), Err(EngineError::RunInProgress)));

        let finished = phase.wait_for(RunPhase::is_terminal).await.unwrap().clone();
        assert_eq!(finished, RunPhase::Completed);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.run_id, run_id);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
