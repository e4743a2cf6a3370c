//! Throughput estimation.
//!
//! Checkpoints arrive at chunk granularity, not on a fixed clock, so each
//! sample is the cumulative average rate since transfer start rather than a
//! sliding-window rate. The figure converges as the transfer progresses.

use tokio::sync::mpsc;

use speedtest_common::protocol::{LegKind, ProgressEvent};

use crate::error::EngineError;
use crate::progress::ProgressChannel;
use crate::source::{SampleSource, SourceEvent, TransferCheckpoint};

const BITS_PER_MEGABIT: f64 = 1024.0 * 1024.0;

/// Gauge ceilings offered to displays, in Mbps.
pub const DISPLAY_SCALES: [f64; 9] = [
    10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 10000.0,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub mbps: f64,
    pub is_final: bool,
}

/// Average rate in Mbps for `bytes` moved over `elapsed_secs`.
///
/// `None` when no time has elapsed or the result would not be finite.
pub fn mbps(bytes: u64, elapsed_secs: f64) -> Option<f64> {
    if elapsed_secs.is_nan() || elapsed_secs <= 0.0 {
        return None;
    }
    let rate = (bytes as f64 * 8.0) / (elapsed_secs * BITS_PER_MEGABIT);
    (rate.is_finite() && rate >= 0.0).then_some(rate)
}

/// Turns a leg's checkpoints into samples. One estimator per transfer.
#[derive(Debug, Default)]
pub struct ThroughputEstimator {
    last: Option<TransferCheckpoint>,
}

impl ThroughputEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample for one checkpoint; the zero-elapsed instant yields nothing.
    pub fn on_checkpoint(&mut self, checkpoint: TransferCheckpoint) -> Option<ThroughputSample> {
        self.last = Some(checkpoint);
        mbps(checkpoint.cumulative_bytes, checkpoint.elapsed_secs).map(|mbps| ThroughputSample {
            mbps,
            is_final: false,
        })
    }

    /// The overall rate for the whole transfer, marked final.
    pub fn on_completed(&self) -> Option<ThroughputSample> {
        let last = self.last?;
        mbps(last.cumulative_bytes, last.elapsed_secs).map(|mbps| ThroughputSample {
            mbps,
            is_final: true,
        })
    }

    pub fn last_checkpoint(&self) -> Option<TransferCheckpoint> {
        self.last
    }
}

/// Consume one leg's source events, publishing every sample as it is
/// derived. The final sample is published with `done` and returned.
pub async fn measure_leg(
    leg: LegKind,
    mut events: mpsc::Receiver<SourceEvent>,
    progress: &ProgressChannel,
) -> Result<f64, EngineError> {
    let mut estimator = ThroughputEstimator::new();

    while let Some(event) = events.recv().await {
        match event {
            SourceEvent::Checkpoint(checkpoint) => {
                if let Some(sample) = estimator.on_checkpoint(checkpoint) {
                    tracing::trace!(%leg, mbps = sample.mbps, bytes = checkpoint.cumulative_bytes, "sample");
                    progress.publish(ProgressEvent::speed(leg, sample.mbps, false));
                }
            }
            SourceEvent::Completed => {
                let sample = estimator.on_completed().ok_or_else(|| {
                    EngineError::transfer(leg, "transfer completed without measurable progress")
                })?;
                progress.publish(ProgressEvent::speed(leg, sample.mbps, true));
                tracing::info!(%leg, mbps = sample.mbps, "leg complete");
                return Ok(sample.mbps);
            }
            SourceEvent::Failed(reason) => {
                let bytes = estimator
                    .last_checkpoint()
                    .map(|c| c.cumulative_bytes)
                    .unwrap_or(0);
                tracing::warn!(%leg, bytes, %reason, "leg failed");
                return Err(EngineError::transfer(leg, reason));
            }
        }
    }

    Err(EngineError::transfer(leg, "source closed before completing"))
}

/// Overall rate of one transfer without publishing anything.
async fn measure_quietly(
    leg: LegKind,
    mut events: mpsc::Receiver<SourceEvent>,
) -> Result<f64, EngineError> {
    let mut estimator = ThroughputEstimator::new();
    while let Some(event) = events.recv().await {
        match event {
            SourceEvent::Checkpoint(checkpoint) => {
                estimator.on_checkpoint(checkpoint);
            }
            SourceEvent::Completed => {
                return estimator
                    .on_completed()
                    .map(|s| s.mbps)
                    .ok_or_else(|| EngineError::transfer(leg, "no measurable progress"));
            }
            SourceEvent::Failed(reason) => return Err(EngineError::transfer(leg, reason)),
        }
    }
    Err(EngineError::transfer(leg, "source closed before completing"))
}

/// Cheap pre-measurement: `iterations` short downloads of `payload_bytes`,
/// one average-rate figure each, averaged across the iterations that
/// completed. Fails only if none did.
pub async fn quick_estimate(
    source: &dyn SampleSource,
    iterations: usize,
    payload_bytes: u64,
) -> Result<f64, EngineError> {
    let mut rates = Vec::with_capacity(iterations);
    let mut last_error = None;

    for i in 0..iterations {
        let events = source.open(LegKind::Download, payload_bytes);
        match measure_quietly(LegKind::Download, events).await {
            Ok(rate) => {
                tracing::debug!(iteration = i, mbps = rate, "quick estimate iteration");
                rates.push(rate);
            }
            Err(e) => {
                tracing::debug!(iteration = i, error = %e, "quick estimate iteration failed");
                last_error = Some(e);
            }
        }
    }

    average(&rates).ok_or_else(|| {
        last_error.unwrap_or_else(|| EngineError::transfer(LegKind::Download, "no iterations run"))
    })
}

/// Arithmetic mean, `None` for an empty slice.
pub fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Smallest gauge ceiling that fits `estimate_mbps`.
pub fn display_scale(estimate_mbps: f64) -> f64 {
    DISPLAY_SCALES
        .iter()
        .copied()
        .find(|&scale| estimate_mbps <= scale)
        .unwrap_or(DISPLAY_SCALES[DISPLAY_SCALES.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ScriptedSource, steady_transfer};

    #[test]
    fn zero_elapsed_emits_nothing() {
        let mut est = ThroughputEstimator::new();
        assert_eq!(est.on_checkpoint(TransferCheckpoint::new(0.0, 4096)), None);
        assert_eq!(est.on_completed(), None);
    }

    #[test]
    fn samples_are_cumulative_average() {
        let mut est = ThroughputEstimator::new();
        let a = est.on_checkpoint(TransferCheckpoint::new(1.0, 1024 * 1024)).unwrap();
        assert_eq!(a.mbps, 8.0);
        assert!(!a.is_final);
        let b = est.on_checkpoint(TransferCheckpoint::new(2.0, 3 * 1024 * 1024)).unwrap();
        assert_eq!(b.mbps, 12.0);
    }

    #[test]
    fn hundred_mib_in_ten_seconds_is_eighty() {
        let mut est = ThroughputEstimator::new();
        est.on_checkpoint(TransferCheckpoint::new(5.0, 52_428_800));
        est.on_checkpoint(TransferCheckpoint::new(10.0, 104_857_600));
        let last = est.on_completed().unwrap();
        assert!(last.is_final);
        assert_eq!(last.mbps, 80.0);
    }

    #[test]
    fn samples_are_finite_and_non_negative() {
        let mut est = ThroughputEstimator::new();
        let mut bytes = 0u64;
        for i in 1..200u64 {
            bytes += i * 7919 % 65536;
            let elapsed = i as f64 * 1e-6;
            let sample = est.on_checkpoint(TransferCheckpoint::new(elapsed, bytes)).unwrap();
            assert!(sample.mbps.is_finite());
            assert!(sample.mbps >= 0.0);
        }
        assert_eq!(mbps(u64::MAX, f64::MIN_POSITIVE), None);
        assert_eq!(mbps(10, f64::NAN), None);
    }

    #[test]
    fn averages_quick_iterations() {
        assert_eq!(average(&[40.0, 42.0, 38.0, 41.0, 44.0]), Some(41.0));
        assert_eq!(average(&[]), None);
    }

    #[test]
    fn display_scale_ladder() {
        assert_eq!(display_scale(0.0), 10.0);
        assert_eq!(display_scale(41.0), 50.0);
        assert_eq!(display_scale(100.0), 100.0);
        assert_eq!(display_scale(100.1), 250.0);
        assert_eq!(display_scale(50_000.0), 10000.0);
    }

    fn one_second_at(mbps: f64) -> Vec<SourceEvent> {
        let bytes = (mbps * BITS_PER_MEGABIT / 8.0) as u64;
        steady_transfer(bytes, 1.0, 4)
    }

    #[tokio::test]
    async fn quick_estimate_averages_iterations() {
        let mut source = ScriptedSource::new();
        for rate in [40.0, 42.0, 38.0, 41.0, 44.0] {
            source = source.with_script(LegKind::Download, one_second_at(rate));
        }
        let estimate = quick_estimate(&source, 5, 1024).await.unwrap();
        assert!((estimate - 41.0).abs() < 1e-9, "got {estimate}");
    }

    #[tokio::test]
    async fn quick_estimate_skips_failed_iterations() {
        let source = ScriptedSource::new()
            .with_script(LegKind::Download, vec![SourceEvent::Failed("reset".into())])
            .with_script(LegKind::Download, one_second_at(20.0));
        let estimate = quick_estimate(&source, 3, 1024).await.unwrap();
        assert!((estimate - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn quick_estimate_fails_when_nothing_completes() {
        let source = ScriptedSource::new()
            .with_script(LegKind::Download, vec![SourceEvent::Failed("reset".into())]);
        let err = quick_estimate(&source, 2, 1024).await.unwrap_err();
        assert!(matches!(err, EngineError::TransferFailed { .. }));
    }

    #[tokio::test]
    async fn measure_leg_publishes_in_order_and_marks_done() {
        let progress = ProgressChannel::new(64);
        let mut sub = progress.subscribe();
        let source = ScriptedSource::new()
            .with_script(LegKind::Upload, steady_transfer(104_857_600, 10.0, 2));

        let final_mbps = measure_leg(LegKind::Upload, source.open(LegKind::Upload, 0), &progress)
            .await
            .unwrap();
        assert_eq!(final_mbps, 80.0);

        let mut received = Vec::new();
        while let Some(event) = sub.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 3);
        assert_eq!(received[0].upload_mbps(), Some(80.0));
        assert!(!received[1].is_done());
        assert!(received[2].is_done());
        assert_eq!(received[2].upload_speed.as_deref(), Some("80.00"));
        assert!(received.iter().all(|e| e.download_speed.is_none()));
    }

    #[tokio::test]
    async fn measure_leg_surfaces_transport_failure() {
        let progress = ProgressChannel::new(16);
        let source = ScriptedSource::new().with_script(
            LegKind::Download,
            crate::source::failing_transfer(104_857_600, 3 * 1024 * 1024, 10.0, "reset by peer"),
        );
        let err = measure_leg(LegKind::Download, source.open(LegKind::Download, 0), &progress)
            .await
            .unwrap_err();
        match err {
            EngineError::TransferFailed { leg, reason } => {
                assert_eq!(leg, LegKind::Download);
                assert_eq!(reason, "reset by peer");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
