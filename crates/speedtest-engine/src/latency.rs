//! Latency estimation from noisy, lossy round-trip probes.
//!
//! Half of the probe slots are echo probes against a fixed host, each
//! retried up to `max_attempts` times; the other half time a name lookup,
//! which still works where echo is blocked or rate-limited. Valid timings
//! from both are pooled, the extreme `trim_fraction` is cut from each end,
//! and the median of the rest is the estimate.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use serde::Serialize;

use crate::config::LatencyConfig;
use crate::error::{EngineError, ProbeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMethod {
    Icmp,
    Dns,
}

/// Outcome of one probe slot. `time_ms` is NaN when the probe is not alive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyProbeResult {
    pub time_ms: f64,
    pub alive: bool,
    pub method: ProbeMethod,
}

impl LatencyProbeResult {
    pub fn alive(method: ProbeMethod, time_ms: f64) -> Self {
        Self {
            time_ms,
            alive: true,
            method,
        }
    }

    pub fn dead(method: ProbeMethod) -> Self {
        Self {
            time_ms: f64::NAN,
            alive: false,
            method,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyEstimate {
    pub median_ms: f64,
}

/// Round-trip primitives. Each call is a single attempt.
#[async_trait]
pub trait LatencyProber: Send + Sync {
    /// One echo round trip to `host`, in milliseconds.
    async fn echo(&self, host: &str, timeout: Duration) -> Result<f64, ProbeError>;
    /// Time to resolve `host`, in milliseconds.
    async fn resolve(&self, host: &str, timeout: Duration) -> Result<f64, ProbeError>;
}

// ── System prober ───────────────────────────────────────────────────

/// Echo via the system `ping` binary (no raw-socket privileges needed),
/// resolution via the OS resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProber;

#[async_trait]
impl LatencyProber for SystemProber {
    async fn echo(&self, host: &str, timeout: Duration) -> Result<f64, ProbeError> {
        let mut cmd = tokio::process::Command::new("ping");
        cmd.args(ping_args(host, timeout)).kill_on_drop(true);

        // The binary enforces its own deadline; this one covers a hung spawn.
        let output = tokio::time::timeout(timeout + Duration::from_millis(500), cmd.output())
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
            .map_err(|e| ProbeError::Spawn(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            return Err(ProbeError::Unreachable(host.to_string()));
        }
        parse_ping_time(&stdout).ok_or_else(|| ProbeError::Parse(first_line(&stdout)))
    }

    async fn resolve(&self, host: &str, timeout: Duration) -> Result<f64, ProbeError> {
        let started = Instant::now();
        let addrs = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0)))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
            .map_err(|e| ProbeError::Unreachable(format!("{host}: {e}")))?;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        if addrs.count() == 0 {
            return Err(ProbeError::Unreachable(format!("{host}: no addresses")));
        }
        Ok(elapsed)
    }
}

#[cfg(target_os = "windows")]
fn ping_args(host: &str, timeout: Duration) -> Vec<String> {
    let ms = timeout.as_millis().max(1).to_string();
    vec!["-n".into(), "1".into(), "-w".into(), ms, host.into()]
}

#[cfg(target_os = "macos")]
fn ping_args(host: &str, timeout: Duration) -> Vec<String> {
    let ms = timeout.as_millis().max(1).to_string();
    vec!["-c".into(), "1".into(), "-W".into(), ms, host.into()]
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn ping_args(host: &str, timeout: Duration) -> Vec<String> {
    // iputils takes whole seconds.
    let secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
    vec!["-c".into(), "1".into(), "-W".into(), secs.to_string(), host.into()]
}

/// Extract the round-trip time from `ping` output: `time=12.3 ms`,
/// `time=12ms` or `time<1ms`.
pub fn parse_ping_time(output: &str) -> Option<f64> {
    for line in output.lines() {
        if let Some(idx) = line.find("time=") {
            let rest = &line[idx + 5..];
            let end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(rest.len());
            if let Ok(ms) = rest[..end].parse::<f64>() {
                return Some(ms);
            }
        } else if line.contains("time<1") {
            return Some(0.0);
        }
    }
    None
}

fn first_line(output: &str) -> String {
    output.lines().next().unwrap_or("").to_string()
}

// ── Scripted prober ─────────────────────────────────────────────────

/// Answers probes from queued outcomes; once a queue runs dry it repeats
/// its fallback (unreachable by default).
pub struct ScriptedProber {
    echo: Mutex<VecDeque<Result<f64, ProbeError>>>,
    resolve: Mutex<VecDeque<Result<f64, ProbeError>>>,
    fallback: Result<f64, ProbeError>,
}

impl ScriptedProber {
    pub fn new(
        echo: impl IntoIterator<Item = Result<f64, ProbeError>>,
        resolve: impl IntoIterator<Item = Result<f64, ProbeError>>,
    ) -> Self {
        Self {
            echo: Mutex::new(echo.into_iter().collect()),
            resolve: Mutex::new(resolve.into_iter().collect()),
            fallback: Err(ProbeError::Unreachable("script exhausted".into())),
        }
    }

    /// Every probe answers `ms`.
    pub fn constant(ms: f64) -> Self {
        Self::new([], []).with_fallback(Ok(ms))
    }

    pub fn with_fallback(mut self, fallback: Result<f64, ProbeError>) -> Self {
        self.fallback = fallback;
        self
    }

    fn next(&self, queue: &Mutex<VecDeque<Result<f64, ProbeError>>>) -> Result<f64, ProbeError> {
        queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl LatencyProber for ScriptedProber {
    async fn echo(&self, _host: &str, _timeout: Duration) -> Result<f64, ProbeError> {
        self.next(&self.echo)
    }

    async fn resolve(&self, _host: &str, _timeout: Duration) -> Result<f64, ProbeError> {
        self.next(&self.resolve)
    }
}

// ── Estimator ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LatencyEstimator {
    prober: Arc<dyn LatencyProber>,
    config: LatencyConfig,
}

impl LatencyEstimator {
    pub fn new(prober: Arc<dyn LatencyProber>, config: LatencyConfig) -> Self {
        Self { prober, config }
    }

    /// Estimate against the configured host, iteration count and timeout.
    pub async fn estimate(&self) -> Result<LatencyEstimate, EngineError> {
        let host = self.config.host.clone();
        self.estimate_with(&host, self.config.iterations, self.config.timeout)
            .await
    }

    pub async fn estimate_with(
        &self,
        host: &str,
        iterations: usize,
        timeout: Duration,
    ) -> Result<LatencyEstimate, EngineError> {
        let results = self.collect(host, iterations, timeout).await;
        // A probe that beat its own timeout is never discarded as too slow.
        let max_rtt_ms = self.config.max_rtt_ms.max(timeout.as_secs_f64() * 1000.0);
        let estimate = aggregate(&results, self.config.trim_fraction, max_rtt_ms);
        match &estimate {
            Ok(e) => tracing::info!(
                host,
                median_ms = e.median_ms,
                probes = results.len(),
                alive = results.iter().filter(|r| r.alive).count(),
                "latency estimate"
            ),
            Err(_) => tracing::warn!(host, probes = results.len(), "latency unavailable"),
        }
        estimate
    }

    /// Run every probe slot and return one result per slot.
    pub async fn collect(
        &self,
        host: &str,
        iterations: usize,
        timeout: Duration,
    ) -> Vec<LatencyProbeResult> {
        let echo_slots = iterations / 2;
        let resolve_slots = iterations - echo_slots;
        let mut results = Vec::with_capacity(iterations);

        for slot in 0..echo_slots {
            results.push(self.echo_slot(host, timeout, slot).await);
        }

        let resolve_host = self.config.resolve_host.as_str();
        for slot in 0..resolve_slots {
            let outcome = bounded(timeout, self.prober.resolve(resolve_host, timeout)).await;
            results.push(match outcome {
                Ok(ms) => LatencyProbeResult::alive(ProbeMethod::Dns, ms),
                Err(e) => {
                    tracing::debug!(slot, host = resolve_host, error = %e, "resolution probe failed");
                    LatencyProbeResult::dead(ProbeMethod::Dns)
                }
            });
        }

        results
    }

    async fn echo_slot(&self, host: &str, timeout: Duration, slot: usize) -> LatencyProbeResult {
        let backoff = ConstantBuilder::default()
            .with_delay(self.config.retry_delay)
            .with_max_times(self.config.max_attempts.saturating_sub(1));

        let outcome = (|| bounded(timeout, self.prober.echo(host, timeout)))
            .retry(backoff)
            .notify(|e: &ProbeError, _| {
                tracing::debug!(slot, host, error = %e, "echo probe failed, retrying");
            })
            .await;

        match outcome {
            Ok(ms) => LatencyProbeResult::alive(ProbeMethod::Icmp, ms),
            Err(e) => {
                tracing::debug!(slot, host, error = %e, "echo probe slot exhausted");
                LatencyProbeResult::dead(ProbeMethod::Icmp)
            }
        }
    }
}

async fn bounded<F>(timeout: Duration, probe: F) -> Result<f64, ProbeError>
where
    F: std::future::Future<Output = Result<f64, ProbeError>>,
{
    tokio::time::timeout(timeout, probe)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

/// Pool the valid timings and take their trimmed median.
///
/// A result is valid when alive with a finite timing in `[0, max_rtt_ms]`.
pub fn aggregate(
    results: &[LatencyProbeResult],
    trim_fraction: f64,
    max_rtt_ms: f64,
) -> Result<LatencyEstimate, EngineError> {
    let samples: Vec<f64> = results
        .iter()
        .filter(|r| r.alive && r.time_ms.is_finite() && r.time_ms >= 0.0 && r.time_ms <= max_rtt_ms)
        .map(|r| r.time_ms)
        .collect();

    trimmed_median(&samples, trim_fraction)
        .map(|median_ms| LatencyEstimate { median_ms })
        .ok_or(EngineError::NoValidSamples)
}

/// Median after dropping `round(n * trim_fraction)` samples from each end
/// of the sorted set. At least one sample always survives the trim.
pub fn trimmed_median(samples: &[f64], trim_fraction: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let trim = ((n as f64 * trim_fraction.max(0.0)).round() as usize).min((n - 1) / 2);
    let kept = &sorted[trim..n - trim];

    let mid = kept.len() / 2;
    if kept.len() % 2 == 0 {
        Some((kept[mid - 1] + kept[mid]) / 2.0)
    } else {
        Some(kept[mid])
    }
}
