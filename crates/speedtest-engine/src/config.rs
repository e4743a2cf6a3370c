use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const MIB: u64 = 1024 * 1024;

// ── TOML input (every field optional) ───────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfigInput {
    pub settle_delay_ms: Option<u64>,
    pub channel_capacity: Option<usize>,
    pub latency: LatencyConfigInput,
    pub download: DownloadConfigInput,
    pub upload: UploadConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LatencyConfigInput {
    pub host: Option<String>,
    pub resolve_host: Option<String>,
    pub iterations: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub max_attempts: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub trim_fraction: Option<f64>,
    pub max_rtt_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DownloadConfigInput {
    pub url: Option<String>,
    pub full_bytes: Option<u64>,
    pub quick_bytes: Option<u64>,
    pub quick_iterations: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UploadConfigInput {
    pub url: Option<String>,
    pub bytes: Option<u64>,
    pub chunk_bytes: Option<usize>,
}

// ── Resolved config ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LatencyConfig {
    /// Target of echo probes.
    pub host: String,
    /// Name timed by resolution probes.
    pub resolve_host: String,
    /// Total probe slots, split evenly between echo and resolution.
    pub iterations: usize,
    pub timeout: Duration,
    /// Attempts per echo probe slot, including the first.
    pub max_attempts: usize,
    pub retry_delay: Duration,
    /// Fraction of samples discarded from each end before the median.
    pub trim_fraction: f64,
    /// Samples above this, or above the probe timeout when that is larger,
    /// are treated as invalid.
    pub max_rtt_ms: f64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            host: "8.8.8.8".into(),
            resolve_host: "google.com".into(),
            iterations: 10,
            timeout: Duration::from_millis(2000),
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
            trim_fraction: 0.10,
            max_rtt_ms: 2000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    /// URL template; `{bytes}` is replaced with the requested payload size.
    pub url: String,
    pub full_bytes: u64,
    pub quick_bytes: u64,
    pub quick_iterations: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            url: "https://speed.cloudflare.com/__down?bytes={bytes}".into(),
            full_bytes: 25 * MIB,
            quick_bytes: 2 * MIB,
            quick_iterations: 5,
        }
    }
}

impl DownloadConfig {
    pub fn url_for(&self, bytes: u64) -> String {
        self.url.replace("{bytes}", &bytes.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    pub url: String,
    pub bytes: u64,
    pub chunk_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            url: "https://speed.cloudflare.com/__up".into(),
            bytes: 10 * MIB,
            chunk_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Pause between the download and upload legs.
    pub settle_delay: Duration,
    /// Per-subscriber queue depth of the progress channel.
    pub channel_capacity: usize,
    pub latency: LatencyConfig,
    pub download: DownloadConfig,
    pub upload: UploadConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(1000),
            channel_capacity: 1024,
            latency: LatencyConfig::default(),
            download: DownloadConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl EngineConfigInput {
    pub fn resolve(self) -> Result<EngineConfig, ConfigError> {
        let defaults = EngineConfig::default();

        let latency_defaults = defaults.latency;
        let timeout = self
            .latency
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(latency_defaults.timeout);
        if timeout.is_zero() {
            return Err(ConfigError::Invalid("latency.timeout_ms must be > 0".into()));
        }
        let trim_fraction = self
            .latency
            .trim_fraction
            .unwrap_or(latency_defaults.trim_fraction);
        if !(0.0..0.5).contains(&trim_fraction) {
            return Err(ConfigError::Invalid(format!(
                "latency.trim_fraction must be in [0, 0.5), got {trim_fraction}"
            )));
        }
        let latency = LatencyConfig {
            host: non_empty(self.latency.host).unwrap_or(latency_defaults.host),
            resolve_host: non_empty(self.latency.resolve_host)
                .unwrap_or(latency_defaults.resolve_host),
            iterations: self
                .latency
                .iterations
                .unwrap_or(latency_defaults.iterations)
                .max(2),
            timeout,
            max_attempts: self
                .latency
                .max_attempts
                .unwrap_or(latency_defaults.max_attempts)
                .max(1),
            retry_delay: self
                .latency
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(latency_defaults.retry_delay),
            trim_fraction,
            max_rtt_ms: self
                .latency
                .max_rtt_ms
                .unwrap_or(timeout.as_secs_f64() * 1000.0),
        };

        let download_defaults = defaults.download;
        let download = DownloadConfig {
            url: non_empty(self.download.url).unwrap_or(download_defaults.url),
            full_bytes: self
                .download
                .full_bytes
                .unwrap_or(download_defaults.full_bytes),
            quick_bytes: self
                .download
                .quick_bytes
                .unwrap_or(download_defaults.quick_bytes),
            quick_iterations: self
                .download
                .quick_iterations
                .unwrap_or(download_defaults.quick_iterations)
                .max(1),
        };
        if download.full_bytes == 0 || download.quick_bytes == 0 {
            return Err(ConfigError::Invalid("download payload sizes must be > 0".into()));
        }

        let upload_defaults = defaults.upload;
        let upload = UploadConfig {
            url: non_empty(self.upload.url).unwrap_or(upload_defaults.url),
            bytes: self.upload.bytes.unwrap_or(upload_defaults.bytes),
            chunk_bytes: self
                .upload
                .chunk_bytes
                .unwrap_or(upload_defaults.chunk_bytes)
                .max(1024),
        };
        if upload.bytes == 0 {
            return Err(ConfigError::Invalid("upload.bytes must be > 0".into()));
        }

        Ok(EngineConfig {
            settle_delay: self
                .settle_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.settle_delay),
            channel_capacity: self
                .channel_capacity
                .unwrap_or(defaults.channel_capacity)
                .max(16),
            latency,
            download,
            upload,
        })
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        let parsed: EngineConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let cfg = EngineConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.latency.max_attempts, 3);
        assert_eq!(cfg.settle_delay, Duration::from_secs(1));
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            settle_delay_ms = 250

            [latency]
            host = "1.1.1.1"
            iterations = 20
            timeout_ms = 1500
            trim_fraction = 0.2

            [download]
            url = "http://mirror.local/blob?size={bytes}"
            full_bytes = 104857600
            quick_iterations = 3

            [upload]
            url = "http://mirror.local/sink"
            bytes = 1048576
        "#;

        let cfg = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.settle_delay, Duration::from_millis(250));
        assert_eq!(cfg.latency.host, "1.1.1.1");
        assert_eq!(cfg.latency.resolve_host, "google.com");
        assert_eq!(cfg.latency.iterations, 20);
        assert_eq!(cfg.latency.timeout, Duration::from_millis(1500));
        assert_eq!(cfg.latency.max_rtt_ms, 1500.0);
        assert_eq!(cfg.latency.trim_fraction, 0.2);
        assert_eq!(cfg.download.full_bytes, 100 * MIB);
        assert_eq!(cfg.download.quick_bytes, 2 * MIB);
        assert_eq!(cfg.download.quick_iterations, 3);
        assert_eq!(
            cfg.download.url_for(2048),
            "http://mirror.local/blob?size=2048"
        );
        assert_eq!(cfg.upload.bytes, MIB);
    }

    #[test]
    fn rejects_out_of_range_trim() {
        let err = EngineConfig::from_toml_str("[latency]\ntrim_fraction = 0.5").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = EngineConfig::from_toml_str("[latency\nhost = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn blank_host_falls_back() {
        let cfg = EngineConfig::from_toml_str("[latency]\nhost = \"  \"").unwrap();
        assert_eq!(cfg.latency.host, "8.8.8.8");
    }
}
