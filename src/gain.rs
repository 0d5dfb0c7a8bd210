//! Capture-channel auto-gain.
//!
//! Microphone captures routinely come back an order of magnitude quieter
//! than the reference. Before the merged file is handed to the encoder, the
//! right (capture) channel is rebalanced: when its RMS falls below 20 % of
//! the reference RMS it is amplified toward the reference level, bounded by
//! a 5 % peak headroom so the boost can never clip.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Gain is applied only when `right_rms < left_rms × MIN_RMS_RATIO`.
pub const MIN_RMS_RATIO: f64 = 0.2;

/// Fraction of full scale the boosted peak may reach.
pub const PEAK_HEADROOM: f64 = 0.95;

/// What the rebalance pass measured and did.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GainSummary {
    pub left_rms: f64,
    pub right_rms: f64,
    pub left_peak: f32,
    pub right_peak: f32,
    /// The factor applied to the right channel, when one was needed.
    pub applied_gain: Option<f64>,
    /// Right-channel RMS after the gain pass (measurement verification).
    pub post_gain_rms: Option<f64>,
}

/// Rebalance the capture channel of an interleaved stereo buffer in place.
///
/// Left (reference) samples are never touched. Boosted samples are clamped
/// to [-1, 1], though the peak-limited gain keeps them inside the headroom
/// in practice.
pub fn rebalance_capture(interleaved: &mut [f32]) -> GainSummary {
    let frames = interleaved.len() / 2;

    let mut left_sum_sq = 0.0f64;
    let mut right_sum_sq = 0.0f64;
    let mut left_peak = 0.0f32;
    let mut right_peak = 0.0f32;
    for frame in interleaved.chunks_exact(2) {
        let (l, r) = (frame[0], frame[1]);
        left_sum_sq += (l as f64) * (l as f64);
        right_sum_sq += (r as f64) * (r as f64);
        left_peak = left_peak.max(l.abs());
        right_peak = right_peak.max(r.abs());
    }

    let (left_rms, right_rms) = if frames > 0 {
        (
            (left_sum_sq / frames as f64).sqrt(),
            (right_sum_sq / frames as f64).sqrt(),
        )
    } else {
        (0.0, 0.0)
    };

    info!(
        left_rms = format_args!("{:.4}", left_rms),
        left_peak = format_args!("{:.4}", left_peak),
        right_rms = format_args!("{:.4}", right_rms),
        right_peak = format_args!("{:.4}", right_peak),
        "channel levels measured"
    );

    let mut summary = GainSummary {
        left_rms,
        right_rms,
        left_peak,
        right_peak,
        applied_gain: None,
        post_gain_rms: None,
    };

    if !(left_rms > 0.0 && right_rms > 0.0 && right_rms < left_rms * MIN_RMS_RATIO) {
        info!(
            ratio = format_args!(
                "{:.2}",
                if left_rms > 0.0 { right_rms / left_rms } else { 0.0 }
            ),
            "capture level sufficient, no gain applied"
        );
        return summary;
    }

    let gain_rms = left_rms / right_rms;
    let gain_peak = PEAK_HEADROOM / right_peak as f64;
    let gain = gain_rms.min(gain_peak);

    info!(
        gain = format_args!("{:.2}", gain),
        gain_rms = format_args!("{:.2}", gain_rms),
        gain_peak = format_args!("{:.2}", gain_peak),
        "amplifying capture channel"
    );

    let gain_f = gain as f32;
    for frame in interleaved.chunks_exact_mut(2) {
        frame[1] = (frame[1] * gain_f).clamp(-1.0, 1.0);
    }

    // Verification pass over the boosted channel.
    let mut post_sum_sq = 0.0f64;
    let mut post_peak = 0.0f32;
    for frame in interleaved.chunks_exact(2) {
        post_sum_sq += (frame[1] as f64) * (frame[1] as f64);
        post_peak = post_peak.max(frame[1].abs());
    }
    let post_rms = (post_sum_sq / frames as f64).sqrt();
    info!(
        post_rms = format_args!("{:.4}", post_rms),
        post_peak = format_args!("{:.4}", post_peak),
        "capture channel after gain"
    );

    summary.applied_gain = Some(gain);
    summary.post_gain_rms = Some(post_rms);
    summary
}
