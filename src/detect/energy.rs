//! Energy-gated selection of correlation window starts.
//!
//! The reference track is speech-like material (spoken digits with pauses),
//! so correlation windows anchored on high-energy onsets score far better
//! than uniformly spaced ones. A short mean-square window slides over the
//! reference channel; each hit becomes a candidate start, and the scan then
//! jumps past the rest of that utterance so repeated peaks inside one digit
//! are not picked twice.

use super::DetectorConfig;

/// Scan `left` for high-energy window starts.
///
/// Returns frame indices at which a correlation window of `window_len`
/// frames fits entirely inside the signal. Empty when the signal is too
/// short or never crosses the energy floor.
pub(crate) fn active_window_starts(
    left: &[f32],
    sample_rate: u32,
    window_len: usize,
    start_offset: usize,
    cfg: &DetectorConfig,
) -> Vec<usize> {
    let total = left.len();
    let mut candidates = Vec::new();
    if total <= start_offset + window_len {
        return candidates;
    }

    let sr = sample_rate as f64;
    let energy_window = (sr * cfg.energy_window_secs) as usize;
    let energy_step = (sr * cfg.energy_step_secs) as usize;
    let skip_gap = (sr * cfg.skip_gap_secs) as usize;
    if energy_window == 0 || energy_step == 0 {
        return candidates;
    }

    let mut s = start_offset;
    while s + energy_window <= total {
        let sum_sq: f64 = left[s..s + energy_window]
            .iter()
            .map(|&v| {
                let v = v as f64;
                v * v
            })
            .sum();
        let mean_sq = sum_sq / energy_window as f64;

        if mean_sq >= cfg.silence_floor {
            if s + window_len <= total {
                candidates.push(s);
            }
            // Jump past this utterance so its internal peaks are not
            // re-selected.
            s += skip_gap.max(energy_step);
        } else {
            s += energy_step;
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 48_000;

    fn cfg() -> DetectorConfig {
        DetectorConfig::default()
    }

    fn burst_signal(bursts: &[(f64, f64)], total_secs: f64) -> Vec<f32> {
        // Loud 0.3-amplitude tone inside each (start, end) second range.
        let total = (SR as f64 * total_secs) as usize;
        let mut out = vec![0.0f32; total];
        for &(start, end) in bursts {
            let a = (SR as f64 * start) as usize;
            let b = ((SR as f64 * end) as usize).min(total);
            for (i, v) in out[a..b].iter_mut().enumerate() {
                *v = 0.3 * (i as f32 * 0.13).sin();
            }
        }
        out
    }

    #[test]
    fn silence_yields_no_candidates() {
        let signal = vec![0.0f32; SR as usize * 3];
        let starts = active_window_starts(&signal, SR, SR as usize, 4800, &cfg());
        assert!(starts.is_empty());
    }

    #[test]
    fn below_floor_noise_yields_no_candidates() {
        // Amplitude 0.02 → mean-square 2e-4, below the 1e-3 floor.
        let signal: Vec<f32> = (0..SR as usize * 2)
            .map(|i| 0.02 * (i as f32 * 0.1).sin())
            .collect();
        let starts = active_window_starts(&signal, SR, SR as usize / 2, 4800, &cfg());
        assert!(starts.is_empty());
    }

    #[test]
    fn one_candidate_per_utterance() {
        // Two bursts separated by much more than the skip gap.
        let signal = burst_signal(&[(0.5, 1.0), (2.5, 3.0)], 5.0);
        let window_len = (SR as f64 * 0.7) as usize;
        let starts = active_window_starts(&signal, SR, window_len, 4800, &cfg());

        assert_eq!(starts.len(), 2, "starts: {starts:?}");
        // A hit lands near the burst onset: within one energy window plus
        // one scan step of it.
        let tolerance = (SR as u64) * 3 / 100 + (SR as u64) / 100 + 480;
        assert!((starts[0] as i64 - (SR as i64 / 2)).unsigned_abs() < tolerance);
        assert!((starts[1] as i64 - (SR as i64 * 5 / 2)).unsigned_abs() < tolerance);
    }

    #[test]
    fn dense_peaks_inside_one_utterance_collapse_to_one_start() {
        // One long 1 s burst: the skip gap must prevent multiple starts
        // closer than 0.7 s.
        let signal = burst_signal(&[(0.2, 1.2)], 4.0);
        let window_len = (SR as f64 * 0.7) as usize;
        let starts = active_window_starts(&signal, SR, window_len, 4800, &cfg());

        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= (SR as f64 * 0.69) as usize);
        }
    }

    #[test]
    fn short_signal_yields_nothing() {
        let signal = vec![0.5f32; 1000];
        assert!(active_window_starts(&signal, SR, 48_000, 4800, &cfg()).is_empty());
    }
}
