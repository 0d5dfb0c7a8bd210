//! Round-trip delay detection over the merged stereo capture.
//!
//! ## Algorithm
//!
//! ```text
//! 1. Energy-gate the reference channel → candidate window starts
//! 2. Per window: coarse NCC scan (step 10) + fine scan (±10, step 1)
//! 3. Early stop once 3 windows score NCC > 0.5
//! 4. Fallback to a uniform 0.5 s grid when energy gating found < 3 windows
//! 5. Aggregate the top 3 windows by NCC²-weighted mean; the weighted
//!    standard deviation flags low-confidence estimates (> 5 ms spread)
//! ```
//!
//! All search spans are derived from the working sample rate; the result is
//! reported in milliseconds.

pub(crate) mod energy;
pub(crate) mod window;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Tuning knobs for the detector. Defaults mirror the field-calibrated
/// values; hosts rarely need to touch them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorConfig {
    /// Skip this much signal at the front (initial transient). Default 0.1 s.
    pub start_offset_secs: f64,
    /// Correlation window length. Default 0.7 s.
    pub window_secs: f64,
    /// Search range for the right channel relative to the left. Default 0.5 s.
    pub max_delay_secs: f64,
    /// Short-time energy window for candidate selection. Default 30 ms.
    pub energy_window_secs: f64,
    /// Energy scan stride. Default 10 ms.
    pub energy_step_secs: f64,
    /// Mean-square floor below which a window is silence (≈ −30 dBFS on a
    /// full scale of 1.0). Default 1e-3.
    pub silence_floor: f64,
    /// Jump after an energy hit, to avoid re-picking the same utterance.
    /// Default 0.7 s.
    pub skip_gap_secs: f64,
    /// Uniform fallback stride when energy gating finds too few windows.
    /// Default 0.5 s.
    pub fallback_step_secs: f64,
    /// Coarse scan step in samples. Default 10.
    pub coarse_step: usize,
    /// A window scoring above this counts toward early termination.
    /// Default 0.5.
    pub early_stop_correlation: f64,
    /// Stop scanning candidates after this many high-scoring windows.
    /// Default 3.
    pub early_stop_windows: usize,
    /// How many top windows feed the weighted aggregate. Default 3.
    pub top_windows: usize,
    /// Weighted standard deviation above this marks the estimate
    /// low-confidence. Default 5 ms.
    pub max_std_dev_ms: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            start_offset_secs: 0.1,
            window_secs: 0.7,
            max_delay_secs: 0.5,
            energy_window_secs: 0.03,
            energy_step_secs: 0.01,
            silence_floor: 1e-3,
            skip_gap_secs: 0.7,
            fallback_step_secs: 0.5,
            coarse_step: 10,
            early_stop_correlation: 0.5,
            early_stop_windows: 3,
            top_windows: 3,
            max_std_dev_ms: 5.0,
        }
    }
}

/// One scored correlation window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowScore {
    /// Frame index where the window starts on the reference channel.
    pub start_frame: usize,
    /// Best delay of the capture relative to the reference, in samples.
    pub delay_samples: usize,
    /// Normalized cross-correlation at that delay, in [-1, 1].
    pub correlation: f64,
}

/// Aggregated detection result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayReport {
    /// NCC²-weighted mean delay in milliseconds.
    pub delay_ms: f64,
    /// Weighted standard deviation across the aggregated windows.
    pub std_dev_ms: f64,
    /// True when the spread exceeded `max_std_dev_ms`; the estimate is still
    /// returned.
    pub low_confidence: bool,
    /// The aggregated windows, highest correlation first (at most
    /// `top_windows`).
    pub windows: Vec<WindowScore>,
}

/// Estimate the delay of `right` relative to `left`, both mono at
/// `sample_rate`.
///
/// Returns `None` when the signal is too short, never crosses the energy
/// floor with a usable correlation, or the capture carries no energy at all
/// (e.g. a muted microphone).
pub fn detect_delay(
    left: &[f32],
    right: &[f32],
    sample_rate: u32,
    cfg: &DetectorConfig,
) -> Option<DelayReport> {
    let total = left.len().min(right.len());
    let sr = sample_rate as f64;
    let window_len = (sr * cfg.window_secs) as usize;
    let start_offset = (sr * cfg.start_offset_secs) as usize;
    let max_delay = (sr * cfg.max_delay_secs) as usize;

    if total < start_offset + window_len {
        warn!(
            total_frames = total,
            needed = start_offset + window_len,
            "not enough merged audio for delay detection"
        );
        return None;
    }

    let starts = energy::active_window_starts(left, sample_rate, window_len, start_offset, cfg);

    let mut results: Vec<WindowScore> = Vec::new();
    let mut high_scores = 0usize;
    for (idx, &start) in starts.iter().enumerate() {
        if start + window_len > total {
            continue;
        }
        let Some((delay, correlation)) =
            window::search_window(left, right, start, window_len, max_delay, cfg.coarse_step, total)
        else {
            continue;
        };
        info!(
            candidate = idx + 1,
            start_secs = format_args!("{:.2}", start as f64 / sr),
            delay_samples = delay,
            delay_ms = format_args!("{:.2}", delay as f64 * 1000.0 / sr),
            correlation = format_args!("{:.4}", correlation),
            "candidate window scored"
        );
        results.push(WindowScore {
            start_frame: start,
            delay_samples: delay,
            correlation,
        });
        if correlation > cfg.early_stop_correlation {
            high_scores += 1;
            if high_scores >= cfg.early_stop_windows {
                info!(
                    high_scores,
                    threshold = cfg.early_stop_correlation,
                    "early stop: enough high-correlation windows"
                );
                break;
            }
        }
    }

    // Not enough energy-gated hits: fall back to a uniform sliding grid.
    if results.len() < cfg.top_windows {
        warn!(
            found = results.len(),
            "too few energy-gated windows, adding a uniform scan"
        );
        let step = ((sr * cfg.fallback_step_secs) as usize).max(1);
        let mut start = start_offset;
        while start + window_len <= total {
            if let Some((delay, correlation)) = window::search_window(
                left,
                right,
                start,
                window_len,
                max_delay,
                cfg.coarse_step,
                total,
            ) {
                results.push(WindowScore {
                    start_frame: start,
                    delay_samples: delay,
                    correlation,
                });
            }
            start += step;
        }
    }

    if results.is_empty() {
        warn!("no valid correlation window found");
        return None;
    }

    // Highest correlation first; equal scores prefer the earlier delay.
    results.sort_by(|a, b| {
        b.correlation
            .partial_cmp(&a.correlation)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.delay_samples.cmp(&b.delay_samples))
    });
    results.truncate(cfg.top_windows);

    let mut weight_sum = 0.0f64;
    let mut weighted_delay = 0.0f64;
    for w in &results {
        let weight = w.correlation * w.correlation;
        weighted_delay += w.delay_samples as f64 * weight;
        weight_sum += weight;
    }
    if weight_sum <= 0.0 {
        warn!("aggregate weight is zero");
        return None;
    }

    let avg_delay_samples = (weighted_delay / weight_sum + 0.5).floor();
    let mut variance = 0.0f64;
    for w in &results {
        let weight = w.correlation * w.correlation;
        let diff = w.delay_samples as f64 - avg_delay_samples;
        variance += weight * diff * diff;
    }
    let std_dev_ms = (variance / weight_sum).sqrt() * 1000.0 / sr;
    let delay_ms = avg_delay_samples * 1000.0 / sr;
    let low_confidence = std_dev_ms > cfg.max_std_dev_ms;

    let avg_correlation =
        results.iter().map(|w| w.correlation).sum::<f64>() / results.len() as f64;
    info!(
        windows_used = results.len(),
        delay_ms = format_args!("{:.2}", delay_ms),
        std_dev_ms = format_args!("{:.2}", std_dev_ms),
        avg_correlation = format_args!("{:.4}", avg_correlation),
        "delay aggregated"
    );
    if low_confidence {
        warn!(
            std_dev_ms = format_args!("{:.2}", std_dev_ms),
            "high spread across windows, delay may be inaccurate"
        );
    }

    Some(DelayReport {
        delay_ms,
        std_dev_ms,
        low_confidence,
        windows: results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 48_000;

    /// Deterministic band-limited noise (LCG + moving average) with enough
    /// energy to pass the −30 dBFS gate.
    fn speech_like(len: usize, seed: u64) -> Vec<f32> {
        let mut state = seed;
        let white: Vec<f32> = (0..len + 16)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / (1u64 << 31) as f32) - 1.0
            })
            .collect();
        white
            .windows(16)
            .map(|w| w.iter().sum::<f32>() / 16.0 * 2.0)
            .collect()
    }

    fn delayed(signal: &[f32], shift: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; signal.len()];
        out[shift..].copy_from_slice(&signal[..signal.len() - shift]);
        out
    }

    #[test]
    fn zero_delay_loopback_reports_zero() {
        let left: Vec<f32> = (0..SR as usize * 2)
            .map(|i| (i as f32 * std::f32::consts::TAU * 440.0 / SR as f32).sin() * 0.5)
            .collect();
        let right = left.clone();

        let report = detect_delay(&left, &right, SR, &DetectorConfig::default()).unwrap();
        assert!(report.delay_ms.abs() <= 1.0, "delay={} ms", report.delay_ms);
        assert!(report.windows[0].correlation >= 0.99);
        for w in &report.windows {
            assert!(w.delay_samples as f64 * 1000.0 / SR as f64 <= 1.0);
        }
    }

    #[test]
    fn known_100ms_shift_is_recovered_within_1ms() {
        let left = speech_like(SR as usize * 3, 0x1234);
        let right = delayed(&left, 4800);

        let report = detect_delay(&left, &right, SR, &DetectorConfig::default()).unwrap();
        assert!(
            (report.delay_ms - 100.0).abs() <= 1.0,
            "delay={} ms",
            report.delay_ms
        );
        assert!(report.windows[0].correlation >= 0.99);
        assert!(!report.low_confidence);
    }

    #[test]
    fn off_grid_shift_is_recovered_by_the_fine_pass() {
        let left = speech_like(SR as usize * 3, 0xABCD);
        let right = delayed(&left, 1237);

        let report = detect_delay(&left, &right, SR, &DetectorConfig::default()).unwrap();
        let expected_ms = 1237.0 * 1000.0 / SR as f64;
        assert!(
            (report.delay_ms - expected_ms).abs() <= 1.0,
            "delay={} ms expected≈{expected_ms}",
            report.delay_ms
        );
    }

    #[test]
    fn silent_capture_returns_none() {
        let left = speech_like(SR as usize * 3, 99);
        let right = vec![0.0f32; left.len()];
        assert!(detect_delay(&left, &right, SR, &DetectorConfig::default()).is_none());
    }

    #[test]
    fn too_short_signal_returns_none() {
        let left = speech_like(SR as usize / 4, 5);
        let right = left.clone();
        assert!(detect_delay(&left, &right, SR, &DetectorConfig::default()).is_none());
    }

    #[test]
    fn quiet_signal_uses_the_uniform_fallback() {
        // Amplitude below the energy gate but well above numeric noise: the
        // fallback grid must still find the shift.
        let quiet: Vec<f32> = speech_like(SR as usize * 3, 0x77).iter().map(|v| v * 0.05).collect();
        let right = delayed(&quiet, 480);

        let report = detect_delay(&quiet, &right, SR, &DetectorConfig::default()).unwrap();
        assert!(
            (report.delay_ms - 10.0).abs() <= 1.0,
            "delay={} ms",
            report.delay_ms
        );
    }

    #[test]
    fn report_keeps_at_most_three_windows_sorted_by_correlation() {
        let left = speech_like(SR as usize * 5, 0x4242);
        let right = delayed(&left, 960);

        let report = detect_delay(&left, &right, SR, &DetectorConfig::default()).unwrap();
        assert!(report.windows.len() <= 3);
        for pair in report.windows.windows(2) {
            assert!(pair[0].correlation >= pair[1].correlation);
        }
    }
}
