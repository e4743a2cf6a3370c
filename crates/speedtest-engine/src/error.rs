//! Error taxonomy for the measurement engine.
//!
//! Leg failures are fatal to a run; probe failures are absorbed by the
//! latency estimator and only surface as [`EngineError::NoValidSamples`]
//! once every probe is exhausted. Subscriber loss is never an error.

use std::time::Duration;

use thiserror::Error;

use speedtest_common::protocol::LegKind;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport error while moving bytes for a leg.
    #[error("{leg} transfer failed: {reason}")]
    TransferFailed { leg: LegKind, reason: String },
    /// Every latency probe failed or timed out.
    #[error("no valid latency samples")]
    NoValidSamples,
    /// A full run is already in flight.
    #[error("a speed test run is already in progress")]
    RunInProgress,
    #[error("result store error: {0}")]
    Store(#[from] StoreError),
}

/// Shown for any failed leg. Transport details stay in the logs.
pub const LEG_FAILED: &str = "speed test failed, please retry";
/// Shown when a result could not be stored.
pub const STORE_FAILED: &str = "failed to store the speed test result";

impl EngineError {
    pub fn transfer(leg: LegKind, reason: impl Into<String>) -> Self {
        EngineError::TransferFailed {
            leg,
            reason: reason.into(),
        }
    }

    /// Message safe to show end users; never carries transport detail.
    pub fn public_message(&self) -> &'static str {
        match self {
            EngineError::TransferFailed { .. } => LEG_FAILED,
            EngineError::NoValidSamples => "latency unavailable",
            EngineError::RunInProgress => "a speed test is already running",
            EngineError::Store(_) => STORE_FAILED,
        }
    }
}

/// Failure of a single latency probe attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("failed to launch probe: {0}")]
    Spawn(String),
    #[error("unparseable probe output: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("storage backend: {0}")]
    Backend(String),
}
