//! Live progress messages pushed to subscribers.
//!
//! Every message is a JSON object carrying any subset of `downloadSpeed`,
//! `uploadSpeed` (string-encoded Mbps with two decimals) and `done`. The
//! final message of each leg carries `done: true` alongside the final speed,
//! so subscribers need no separate terminal message.

use serde::{Deserialize, Serialize};

/// Which direction a transfer leg moves bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegKind {
    Download,
    Upload,
}

impl std::fmt::Display for LegKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegKind::Download => write!(f, "download"),
            LegKind::Upload => write!(f, "upload"),
        }
    }
}

/// One pushed progress message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

impl ProgressEvent {
    /// Build the event for a throughput sample on the given leg.
    pub fn speed(leg: LegKind, mbps: f64, done: bool) -> Self {
        let value = Some(format_mbps(mbps));
        let mut event = match leg {
            LegKind::Download => Self {
                download_speed: value,
                ..Self::default()
            },
            LegKind::Upload => Self {
                upload_speed: value,
                ..Self::default()
            },
        };
        if done {
            event.done = Some(true);
        }
        event
    }

    /// Parsed download speed, or `None` if absent or not a finite number.
    pub fn download_mbps(&self) -> Option<f64> {
        self.download_speed.as_deref().and_then(parse_mbps)
    }

    /// Parsed upload speed, or `None` if absent or not a finite number.
    pub fn upload_mbps(&self) -> Option<f64> {
        self.upload_speed.as_deref().and_then(parse_mbps)
    }

    pub fn is_done(&self) -> bool {
        self.done.unwrap_or(false)
    }
}

/// Render Mbps the way results are displayed: two decimals.
pub fn format_mbps(mbps: f64) -> String {
    format!("{mbps:.2}")
}

fn parse_mbps(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_event_wire_shape() {
        let event = ProgressEvent::speed(LegKind::Download, 42.1, false);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"downloadSpeed":"42.10"}"#);

        let event = ProgressEvent::speed(LegKind::Upload, 55.0, true);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"uploadSpeed":"55.00","done":true}"#);
    }

    #[test]
    fn tolerates_any_subset_of_fields() {
        let event: ProgressEvent = serde_json::from_str(r#"{"done":true}"#).unwrap();
        assert!(event.is_done());
        assert_eq!(event.download_mbps(), None);

        let event: ProgressEvent = serde_json::from_str("{}").unwrap();
        assert!(!event.is_done());
    }

    #[test]
    fn discards_non_numeric_speeds() {
        let event: ProgressEvent =
            serde_json::from_str(r#"{"downloadSpeed":"fast","uploadSpeed":" 12.5 "}"#).unwrap();
        assert_eq!(event.download_mbps(), None);
        assert_eq!(event.upload_mbps(), Some(12.5));

        let event: ProgressEvent = serde_json::from_str(r#"{"downloadSpeed":"NaN"}"#).unwrap();
        assert_eq!(event.download_mbps(), None);
    }
}
