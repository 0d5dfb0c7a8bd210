//! Event types broadcast to the host during a test run.
//!
//! Two channels: `ProbeStatusEvent` mirrors every controller state change,
//! `ProbeEvent` carries the test-run milestones (stream configs, detection
//! start, the completion report, errors). All types serialize with camelCase
//! fields and lowercase tags so host bindings stay stable.

use serde::{Deserialize, Serialize};

use crate::detect::DelayReport;

/// Error codes carried by [`ProbeEvent::Error`].
pub mod codes {
    /// The decoder returned an empty path or failed outright.
    pub const DECODE_FAILED: i32 = -1;
    /// The decoded reference file was unreadable or empty.
    pub const PRELOAD_FAILED: i32 = -2;
    /// The driver rejected the stream parameters.
    pub const STREAM_OPEN_FAILED: i32 = -3;
    /// The device disappeared mid-run.
    pub const DEVICE_LOST: i32 = -4;
    /// Backend-specific runtime failure delivered via the error callback.
    pub const BACKEND_ERROR: i32 = -5;
    /// The merge worker failed to read or write the intermediate file.
    pub const MERGE_IO_FAILED: i32 = -6;
}

/// Sentinel used for "no delay measured" in completion reports.
pub const NO_DELAY: f64 = -1.0;

/// Controller state, in the order a successful run traverses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Engine created, no run started.
    Idle,
    /// Reference file is being decoded to working-format PCM.
    Decoding,
    /// Decoded PCM is being loaded and silence-prefixed.
    Preloading,
    /// Driver streams are being opened and started.
    OpeningStreams,
    /// Playback + capture active, pre-heat counting down.
    Running,
    /// Pre-heat done; the worker is merging both sides to disk.
    Merging,
    /// Cross-correlation in progress.
    Detecting,
    /// Auto-gain / encode wrap-up.
    Finishing,
    /// Run ended; engine may be restarted.
    Stopped,
    /// Unrecoverable error; see the error event.
    Errored,
}

/// Emitted on the status channel whenever the controller state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeStatusEvent {
    pub status: ProbeStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// One aggregated correlation window in host form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayWindow {
    /// Delay in milliseconds; −1 for a padding entry.
    pub delay_ms: f64,
    /// Correlation in [−1, 1]; −1 for a padding entry.
    pub correlation: f64,
}

/// Final result of a run, emitted exactly once on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    /// Path of the encoded artifact.
    pub output_path: String,
    /// Encoder return code; non-zero means the encode failed but the
    /// measurement itself is still valid.
    pub encode_rc: i32,
    /// Weighted delay estimate in milliseconds, or −1 when detection found
    /// no usable correlation.
    pub avg_delay_ms: f64,
    /// Weighted standard deviation across the aggregated windows; −1 when
    /// detection failed.
    pub std_dev_ms: f64,
    /// True when the window spread exceeded the confidence bound.
    pub low_confidence: bool,
    /// Always exactly three entries, padded with −1/−1.
    pub windows: Vec<DelayWindow>,
}

impl CompletionReport {
    /// Build a host report from an optional detection result, padding the
    /// window list to exactly three entries.
    pub fn new(
        output_path: String,
        encode_rc: i32,
        sample_rate: u32,
        report: Option<&DelayReport>,
    ) -> Self {
        let mut windows: Vec<DelayWindow> = report
            .map(|r| {
                r.windows
                    .iter()
                    .take(3)
                    .map(|w| DelayWindow {
                        delay_ms: w.delay_samples as f64 * 1000.0 / sample_rate as f64,
                        correlation: w.correlation,
                    })
                    .collect()
            })
            .unwrap_or_default();
        while windows.len() < 3 {
            windows.push(DelayWindow {
                delay_ms: NO_DELAY,
                correlation: NO_DELAY,
            });
        }

        Self {
            output_path,
            encode_rc,
            avg_delay_ms: report.map_or(NO_DELAY, |r| r.delay_ms),
            std_dev_ms: report.map_or(NO_DELAY, |r| r.std_dev_ms),
            low_confidence: report.is_some_and(|r| r.low_confidence),
            windows,
        }
    }
}

/// Milestone events of one test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeEvent {
    /// Both streams opened; carries the negotiated config strings
    /// (`SR=… CH=… FMT=… MODE=… PERF=… FPB=… BUF=…`).
    Config { output: String, input: String },
    /// Delay detection is about to start.
    Detecting,
    /// The run finished; emitted at most once, never after an error.
    Completed(CompletionReport),
    /// Fatal failure; emitted at most once per run.
    Error { message: String, code: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::WindowScore;

    #[test]
    fn status_serializes_lowercase() {
        let event = ProbeStatusEvent {
            status: ProbeStatus::OpeningStreams,
            detail: Some("opening".into()),
        };
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "openingstreams");
        assert_eq!(json["detail"], "opening");

        let round_trip: ProbeStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, ProbeStatus::OpeningStreams);
    }

    #[test]
    fn completion_report_pads_to_three_windows() {
        let report = DelayReport {
            delay_ms: 42.0,
            std_dev_ms: 0.5,
            low_confidence: false,
            windows: vec![WindowScore {
                start_frame: 4800,
                delay_samples: 2016,
                correlation: 0.97,
            }],
        };

        let completion = CompletionReport::new("out.m4a".into(), 0, 48_000, Some(&report));
        assert_eq!(completion.windows.len(), 3);
        assert!((completion.windows[0].delay_ms - 42.0).abs() < 1e-9);
        assert!((completion.windows[0].correlation - 0.97).abs() < 1e-9);
        assert_eq!(completion.windows[1].delay_ms, NO_DELAY);
        assert_eq!(completion.windows[2].correlation, NO_DELAY);
    }

    #[test]
    fn failed_detection_uses_sentinels() {
        let completion = CompletionReport::new("out.m4a".into(), 3, 48_000, None);
        assert_eq!(completion.avg_delay_ms, NO_DELAY);
        assert_eq!(completion.std_dev_ms, NO_DELAY);
        assert_eq!(completion.encode_rc, 3);
        assert!(!completion.low_confidence);
        assert!(completion
            .windows
            .iter()
            .all(|w| w.delay_ms == NO_DELAY && w.correlation == NO_DELAY));
    }

    #[test]
    fn probe_event_tags_are_lowercase() {
        let config = ProbeEvent::Config {
            output: "SR=48000".into(),
            input: "SR=48000".into(),
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["kind"], "config");
        assert_eq!(json["output"], "SR=48000");

        let error = ProbeEvent::Error {
            message: "device lost".into(),
            code: codes::DEVICE_LOST,
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["kind"], "error");
        assert_eq!(json["code"], -4);

        let completed = ProbeEvent::Completed(CompletionReport::new("x".into(), 0, 48_000, None));
        let json = serde_json::to_value(&completed).unwrap();
        assert_eq!(json["kind"], "completed");
        assert_eq!(json["outputPath"], "x");
    }
}
