//! Data models for the speed test service.
//!
//! `SpeedTestRecord` is produced once per completed run by the engine and
//! persisted by the store; `RunPhase` is the orchestrator's state, exposed
//! to API clients polling a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Speed Test Record ───────────────────────────────────────────────

/// The aggregate result of one completed speed test run.
///
/// Immutable once created. `ping_ms` is `None` when every latency probe
/// failed and the run carried on without a latency figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedTestRecord {
    pub download_speed_mbps: f64,
    pub upload_speed_mbps: f64,
    pub ping_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl SpeedTestRecord {
    pub fn new(download_speed_mbps: f64, upload_speed_mbps: f64, ping_ms: Option<f64>) -> Self {
        Self {
            download_speed_mbps,
            upload_speed_mbps,
            ping_ms,
            timestamp: Utc::now(),
        }
    }

    /// Check that every figure is finite and non-negative.
    pub fn validate(&self) -> Result<(), String> {
        let figures = [
            ("downloadSpeedMbps", Some(self.download_speed_mbps)),
            ("uploadSpeedMbps", Some(self.upload_speed_mbps)),
            ("pingMs", self.ping_ms),
        ];
        for (name, value) in figures {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("{name} must be a finite, non-negative number"));
                }
            }
        }
        Ok(())
    }
}

/// A record as held by the store, with its assigned ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSpeedTest {
    pub id: String,
    #[serde(flatten)]
    pub record: SpeedTestRecord,
}

// ── Run Phase ───────────────────────────────────────────────────────

/// Orchestrator state for a single test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    QuickEstimating,
    ProbingLatency,
    Downloading,
    TransitioningToUpload,
    Uploading,
    Completed,
    Failed(String),
}

impl RunPhase {
    /// `Completed` and `Failed` end a run; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed(_))
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::QuickEstimating => write!(f, "quick_estimating"),
            RunPhase::ProbingLatency => write!(f, "probing_latency"),
            RunPhase::Downloading => write!(f, "downloading"),
            RunPhase::TransitioningToUpload => write!(f, "transitioning_to_upload"),
            RunPhase::Uploading => write!(f, "uploading"),
            RunPhase::Completed => write!(f, "completed"),
            RunPhase::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_camel_case() {
        let record = SpeedTestRecord::new(80.0, 20.5, None);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["downloadSpeedMbps"], 80.0);
        assert_eq!(json["uploadSpeedMbps"], 20.5);
        assert!(json["pingMs"].is_null());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn stored_record_flattens() {
        let stored = StoredSpeedTest {
            id: "spt_1".into(),
            record: SpeedTestRecord::new(1.0, 2.0, Some(19.5)),
        };
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["id"], "spt_1");
        assert_eq!(json["pingMs"], 19.5);
    }

    #[test]
    fn validate_rejects_negative_and_nan() {
        assert!(SpeedTestRecord::new(1.0, 1.0, Some(3.0)).validate().is_ok());
        assert!(SpeedTestRecord::new(-1.0, 1.0, None).validate().is_err());
        assert!(SpeedTestRecord::new(1.0, f64::NAN, None).validate().is_err());
        assert!(SpeedTestRecord::new(1.0, 1.0, Some(f64::INFINITY)).validate().is_err());
    }

    #[test]
    fn run_phase_wire_shape() {
        let json = serde_json::to_value(RunPhase::Downloading).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "downloading" }));
        let json = serde_json::to_value(RunPhase::Failed("boom".into())).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "failed", "reason": "boom" }));
        assert!(RunPhase::Completed.is_terminal());
        assert!(!RunPhase::Uploading.is_terminal());
    }
}
