//! Sample sources: byte-transfer primitives that report progress as a
//! sequence of cumulative checkpoints.
//!
//! `open` spawns a producer task and hands back the receiving end of a
//! channel. The producer emits one [`SourceEvent::Checkpoint`] per chunk,
//! then either a final checkpoint followed by [`SourceEvent::Completed`], or
//! [`SourceEvent::Failed`]. Sources never retry; that is the caller's call.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use speedtest_common::protocol::LegKind;

use crate::config::{DownloadConfig, EngineConfig, UploadConfig};

/// Depth of the per-transfer checkpoint queue.
const CHECKPOINT_QUEUE: usize = 256;

/// Bytes moved so far, observed at a point in time since transfer start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferCheckpoint {
    pub elapsed_secs: f64,
    pub cumulative_bytes: u64,
}

impl TransferCheckpoint {
    pub fn new(elapsed_secs: f64, cumulative_bytes: u64) -> Self {
        Self {
            elapsed_secs,
            cumulative_bytes,
        }
    }

    /// Checkpoint stamped with the time elapsed since `started`.
    pub fn since(started: Instant, cumulative_bytes: u64) -> Self {
        Self::new(started.elapsed().as_secs_f64(), cumulative_bytes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Checkpoint(TransferCheckpoint),
    Completed,
    Failed(String),
}

/// A transfer primitive for one leg.
pub trait SampleSource: Send + Sync {
    /// Start a transfer of roughly `payload_bytes` and stream its progress.
    fn open(&self, leg: LegKind, payload_bytes: u64) -> mpsc::Receiver<SourceEvent>;
}

/// Count the chunks of a byte stream into checkpoints on `tx`.
///
/// Ends with a final checkpoint plus `Completed`, or with `Failed` on the
/// first stream error. Returns the total bytes on success. Stops early if
/// the consumer has gone away.
pub async fn pump_stream<S, B, E>(
    stream: S,
    started: Instant,
    tx: &mpsc::Sender<SourceEvent>,
) -> Result<u64, String>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    futures::pin_mut!(stream);
    let mut total: u64 = 0;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                total += chunk.as_ref().len() as u64;
                let checkpoint = TransferCheckpoint::since(started, total);
                if tx.send(SourceEvent::Checkpoint(checkpoint)).await.is_err() {
                    return Err("checkpoint consumer dropped".into());
                }
            }
            Err(e) => {
                let reason = e.to_string();
                let _ = tx.send(SourceEvent::Failed(reason.clone())).await;
                return Err(reason);
            }
        }
    }

    let _ = tx
        .send(SourceEvent::Checkpoint(TransferCheckpoint::since(started, total)))
        .await;
    let _ = tx.send(SourceEvent::Completed).await;
    Ok(total)
}

// ── HTTP source ─────────────────────────────────────────────────────

/// Moves real bytes over HTTP: GET a sized payload for downloads, POST an
/// in-memory payload for uploads.
///
/// No overall request timeout is set; a stalled transfer surfaces only as a
/// transport error.
#[derive(Clone)]
pub struct HttpSampleSource {
    client: reqwest::Client,
    download: DownloadConfig,
    upload: UploadConfig,
}

impl HttpSampleSource {
    pub fn new(config: &EngineConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            download: config.download.clone(),
            upload: config.upload.clone(),
        })
    }
}

impl SampleSource for HttpSampleSource {
    fn open(&self, leg: LegKind, payload_bytes: u64) -> mpsc::Receiver<SourceEvent> {
        let (tx, rx) = mpsc::channel(CHECKPOINT_QUEUE);
        let client = self.client.clone();
        match leg {
            LegKind::Download => {
                let url = self.download.url_for(payload_bytes);
                tokio::spawn(async move { download(client, url, tx).await });
            }
            LegKind::Upload => {
                let url = self.upload.url.clone();
                let chunk_bytes = self.upload.chunk_bytes;
                tokio::spawn(
                    async move { upload(client, url, payload_bytes, chunk_bytes, tx).await },
                );
            }
        }
        rx
    }
}

async fn download(client: reqwest::Client, url: String, tx: mpsc::Sender<SourceEvent>) {
    tracing::debug!(url = %url, "download transfer starting");
    let started = Instant::now();

    let response = match client
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
    {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "download request failed");
            let _ = tx.send(SourceEvent::Failed(e.to_string())).await;
            return;
        }
    };

    match pump_stream(response.bytes_stream(), started, &tx).await {
        Ok(total) => tracing::debug!(url = %url, total, "download transfer complete"),
        Err(reason) => tracing::warn!(url = %url, %reason, "download transfer aborted"),
    }
}

async fn upload(
    client: reqwest::Client,
    url: String,
    total: u64,
    chunk_bytes: usize,
    tx: mpsc::Sender<SourceEvent>,
) {
    tracing::debug!(url = %url, total, "upload transfer starting");
    let payload = Bytes::from(vec![0u8; chunk_bytes]);
    let started = Instant::now();

    // Each pull of the next chunk reports the bytes the transport has
    // already taken from the previous ones.
    let progress_tx = tx.clone();
    let body = futures::stream::unfold(0u64, move |sent| {
        let payload = payload.clone();
        let progress_tx = progress_tx.clone();
        async move {
            if sent >= total {
                return None;
            }
            let checkpoint = TransferCheckpoint::since(started, sent);
            let _ = progress_tx.send(SourceEvent::Checkpoint(checkpoint)).await;
            let len = (total - sent).min(payload.len() as u64);
            let chunk = payload.slice(0..len as usize);
            Some((Ok::<Bytes, std::io::Error>(chunk), sent + len))
        }
    });

    let result = client
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .header(reqwest::header::CONTENT_LENGTH, total)
        .body(reqwest::Body::wrap_stream(body))
        .send()
        .await
        .and_then(|r| r.error_for_status());

    match result {
        Ok(_) => {
            let _ = tx
                .send(SourceEvent::Checkpoint(TransferCheckpoint::since(started, total)))
                .await;
            let _ = tx.send(SourceEvent::Completed).await;
            tracing::debug!(url = %url, total, "upload transfer complete");
        }
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "upload request failed");
            let _ = tx.send(SourceEvent::Failed(e.to_string())).await;
        }
    }
}

// ── Scripted source ─────────────────────────────────────────────────

/// Replays pre-built event scripts instead of touching the network.
///
/// Each `open` for a leg takes the next queued script; the last script for
/// a leg is replayed for every further `open`. Used in simulation mode and
/// tests.
pub struct ScriptedSource {
    scripts: Mutex<HashMap<LegKind, VecDeque<Vec<SourceEvent>>>>,
    pacing: Duration,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            pacing: Duration::ZERO,
        }
    }

    /// Queue a script for the given leg.
    pub fn with_script(self, leg: LegKind, script: Vec<SourceEvent>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(leg).or_default().push_back(script);
        }
        self
    }

    /// Sleep this long between replayed events.
    pub fn paced(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    fn next_script(&self, leg: LegKind) -> Option<Vec<SourceEvent>> {
        let mut scripts = self.scripts.lock().ok()?;
        let queue = scripts.get_mut(&leg)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for ScriptedSource {
    fn open(&self, leg: LegKind, _payload_bytes: u64) -> mpsc::Receiver<SourceEvent> {
        let (tx, rx) = mpsc::channel(CHECKPOINT_QUEUE);
        let script = self
            .next_script(leg)
            .unwrap_or_else(|| vec![SourceEvent::Failed(format!("no script for {leg} leg"))]);
        let pacing = self.pacing;
        tokio::spawn(async move {
            for event in script {
                if !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

/// A transfer of `total_bytes` at constant rate over `secs`, reported in
/// `steps` evenly spaced checkpoints, then completed.
pub fn steady_transfer(total_bytes: u64, secs: f64, steps: u32) -> Vec<SourceEvent> {
    let steps = steps.max(1);
    let mut events: Vec<SourceEvent> = (1..=steps)
        .map(|i| {
            let fraction = f64::from(i) / f64::from(steps);
            SourceEvent::Checkpoint(TransferCheckpoint::new(
                secs * fraction,
                (total_bytes as f64 * fraction).round() as u64,
            ))
        })
        .collect();
    events.push(SourceEvent::Completed);
    events
}

/// A transfer that moves `failed_at_bytes` of `total_bytes` at constant rate
/// over the nominal `secs`, then fails.
pub fn failing_transfer(
    total_bytes: u64,
    failed_at_bytes: u64,
    secs: f64,
    reason: &str,
) -> Vec<SourceEvent> {
    let fraction = failed_at_bytes as f64 / total_bytes.max(1) as f64;
    let mut events: Vec<SourceEvent> = steady_transfer(failed_at_bytes, secs * fraction, 3)
        .into_iter()
        .filter(|e| matches!(e, SourceEvent::Checkpoint(_)))
        .collect();
    events.push(SourceEvent::Failed(reason.to_string()));
    events
}
