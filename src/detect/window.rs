//! Per-window delay search: coarse-stepped normalized cross-correlation
//! followed by a sample-accurate fine pass around the coarse optimum.

/// Minimum usable search span in samples; shorter spans carry no information.
const MIN_SEARCH_SPAN: usize = 100;

/// Minimum correlation window in samples.
const MIN_WINDOW_SAMPLES: usize = 1000;

/// Find the delay of `right` relative to `left` inside one window.
///
/// Scans `delay ∈ [0, max_delay]` at `coarse_step`, then refines
/// `[d* − coarse_step, d* + coarse_step]` at step 1. Returns
/// `(delay_samples, ncc)` or `None` when the window is unusable or never
/// produces a valid correlation (e.g. an all-zero channel). On equal NCC the
/// earlier delay wins — both passes scan ascending and only a strictly
/// greater score replaces the incumbent.
pub(crate) fn search_window(
    left: &[f32],
    right: &[f32],
    start: usize,
    window_len: usize,
    max_delay: usize,
    coarse_step: usize,
    total: usize,
) -> Option<(usize, f64)> {
    let search_end = max_delay.min(total.saturating_sub(start + window_len));
    if search_end < MIN_SEARCH_SPAN || window_len < MIN_WINDOW_SAMPLES {
        return None;
    }

    let step = coarse_step.max(1);

    // Coarse pass.
    let mut best: Option<(usize, f64)> = None;
    let mut delay = 0usize;
    while delay <= search_end && start + window_len + delay < total {
        if let Some(ncc) = ncc_at(left, right, start, window_len, delay, total) {
            if best.map_or(true, |(_, b)| ncc > b) {
                best = Some((delay, ncc));
            }
        }
        delay += step;
    }
    let (coarse_delay, coarse_ncc) = best?;

    // Fine pass around the coarse optimum.
    let lo = coarse_delay.saturating_sub(step);
    let hi = (coarse_delay + step).min(search_end);
    let mut refined = (coarse_delay, coarse_ncc);
    for delay in lo..=hi {
        if start + window_len + delay >= total {
            break;
        }
        if let Some(ncc) = ncc_at(left, right, start, window_len, delay, total) {
            if ncc > refined.1 {
                refined = (delay, ncc);
            }
        }
    }

    Some(refined)
}

/// Normalized cross-correlation of one window at one delay, accumulated in
/// f64. `None` when either side has zero energy over the window.
fn ncc_at(
    left: &[f32],
    right: &[f32],
    start: usize,
    window_len: usize,
    delay: usize,
    total: usize,
) -> Option<f64> {
    let mut corr = 0.0f64;
    let mut left_norm = 0.0f64;
    let mut right_norm = 0.0f64;
    let mut valid = 0usize;

    for i in 0..window_len {
        let li = start + i;
        let ri = start + i + delay;
        if li < total && ri < total {
            let l = left[li] as f64;
            let r = right[ri] as f64;
            corr += l * r;
            left_norm += l * l;
            right_norm += r * r;
            valid += 1;
        }
    }

    if valid > 0 && left_norm > 0.0 && right_norm > 0.0 {
        Some(corr / (left_norm * right_norm).sqrt())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: usize = 48_000;

    /// Deterministic band-limited noise: LCG white noise smoothed with a
    /// short moving average, so the autocorrelation peak is narrow but wide
    /// enough for the coarse grid to land on its flank.
    fn smoothed_noise(len: usize, seed: u64) -> Vec<f32> {
        let mut state = seed;
        let white: Vec<f32> = (0..len + 16)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / (1u64 << 31) as f32) - 1.0
            })
            .collect();
        white
            .windows(16)
            .map(|w| w.iter().sum::<f32>() / 16.0)
            .collect()
    }

    fn shifted(signal: &[f32], shift: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; signal.len()];
        out[shift..].copy_from_slice(&signal[..signal.len() - shift]);
        out
    }

    #[test]
    fn finds_an_exact_on_grid_shift() {
        let left = smoothed_noise(SR * 2, 0x5EED);
        let right = shifted(&left, 4800);
        let (delay, ncc) =
            search_window(&left, &right, 4800, SR * 7 / 10, SR / 2, 10, left.len()).unwrap();
        assert_eq!(delay, 4800);
        assert!(ncc > 0.99, "ncc={ncc}");
    }

    #[test]
    fn fine_pass_recovers_off_grid_shifts() {
        let left = smoothed_noise(SR * 2, 0xBEEF);
        let right = shifted(&left, 4803);
        let (delay, ncc) =
            search_window(&left, &right, 4800, SR * 7 / 10, SR / 2, 10, left.len()).unwrap();
        assert_eq!(delay, 4803);
        assert!(ncc > 0.99, "ncc={ncc}");
    }

    #[test]
    fn zero_shift_wins_ties_on_periodic_signals() {
        // A pure sine correlates equally at every period; the earlier delay
        // must win.
        let left: Vec<f32> = (0..SR * 2)
            .map(|i| (i as f32 * std::f32::consts::TAU * 440.0 / SR as f32).sin() * 0.5)
            .collect();
        let right = left.clone();
        let (delay, ncc) =
            search_window(&left, &right, 4800, SR * 7 / 10, SR / 2, 10, left.len()).unwrap();
        assert_eq!(delay, 0);
        assert!(ncc > 0.999);
    }

    #[test]
    fn silent_right_channel_is_rejected() {
        let left = smoothed_noise(SR * 2, 42);
        let right = vec![0.0f32; left.len()];
        assert!(search_window(&left, &right, 4800, SR * 7 / 10, SR / 2, 10, left.len()).is_none());
    }

    #[test]
    fn degenerate_windows_are_rejected() {
        let left = smoothed_noise(SR, 7);
        let right = left.clone();
        // Window too short.
        assert!(search_window(&left, &right, 0, 500, SR / 2, 10, left.len()).is_none());
        // Search span too short: window nearly fills the signal.
        assert!(
            search_window(&left, &right, 0, left.len() - 50, SR / 2, 10, left.len()).is_none()
        );
    }
}
