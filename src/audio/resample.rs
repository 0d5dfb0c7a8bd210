//! Fixed-chunk sample-rate conversion over a rubato `FastFixedIn` session.
//!
//! `RateConverter` deliberately does one thing: turn exactly `chunk_in`
//! mono f32 frames at the input rate into however many frames the output
//! rate yields. Feeding whole chunks is the caller's job — the format ring
//! reader in `buffering::convert` buffers decoded samples until a chunk is
//! full, which keeps this type free of any queueing state of its own.
//!
//! The rubato session carries its delay line across calls, so consecutive
//! chunks of one stream come out phase-continuous. `reset()` drops that
//! history when the owning ring is cleared at the end of pre-heat.
//!
//! Callers that see equal input and output rates skip this type entirely;
//! construction with a 1:1 ratio is an error.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::{ProbeError, Result};

/// Mono f32 rate converter with a fixed input chunk size.
pub struct RateConverter {
    resampler: FastFixedIn<f32>,
    chunk_in: usize,
    /// Pre-allocated rubato output: `[1][output_frames_max]`.
    output: Vec<Vec<f32>>,
}

impl std::fmt::Debug for RateConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateConverter")
            .field("chunk_in", &self.chunk_in)
            .finish_non_exhaustive()
    }
}

impl RateConverter {
    /// Create a converter for `input_rate` → `output_rate`.
    ///
    /// # Errors
    /// `ProbeError::Resample` when the rates are equal (use no converter at
    /// all in that case) or rubato rejects the configuration.
    pub fn new(input_rate: u32, output_rate: u32, chunk_in: usize) -> Result<Self> {
        if input_rate == output_rate {
            return Err(ProbeError::Resample(format!(
                "refusing a 1:1 session at {input_rate} Hz"
            )));
        }

        let resampler = FastFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            1.0, // fixed ratio — no dynamic adjustment
            PolynomialDegree::Cubic,
            chunk_in,
            1, // mono
        )
        .map_err(|e| ProbeError::Resample(format!("init: {e}")))?;

        let max_out = resampler.output_frames_max();
        tracing::debug!(input_rate, output_rate, chunk_in, max_out, "resampler ready");

        Ok(Self {
            resampler,
            chunk_in,
            output: vec![vec![0f32; max_out]; 1],
        })
    }

    /// Input frames consumed per [`convert_chunk`] call.
    ///
    /// [`convert_chunk`]: RateConverter::convert_chunk
    pub fn chunk_in(&self) -> usize {
        self.chunk_in
    }

    /// Convert exactly one input chunk; returns the frames it produced.
    ///
    /// `chunk.len()` must equal [`chunk_in`]. The returned slice borrows the
    /// internal output buffer and is valid until the next call.
    ///
    /// [`chunk_in`]: RateConverter::chunk_in
    pub fn convert_chunk(&mut self, chunk: &[f32]) -> Result<&[f32]> {
        debug_assert_eq!(chunk.len(), self.chunk_in, "callers feed whole chunks");
        let (_consumed, produced) = self
            .resampler
            .process_into_buffer(&[chunk], &mut self.output, None)
            .map_err(|e| ProbeError::Resample(e.to_string()))?;
        Ok(&self.output[0][..produced])
    }

    /// Flush the delay line so the next chunk starts from clean state.
    pub fn reset(&mut self) {
        self.resampler.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_rates_are_rejected() {
        let err = RateConverter::new(48_000, 48_000, 960).unwrap_err();
        assert!(matches!(err, ProbeError::Resample(_)));
    }

    #[test]
    fn upsampling_yields_ratio_scaled_chunks() {
        let mut rc = RateConverter::new(44_100, 48_000, 960).unwrap();
        assert_eq!(rc.chunk_in(), 960);

        // 960 frames at 44.1 kHz → ≈1045 at 48 kHz.
        let chunk = vec![0.25f32; 960];
        let out_len = rc.convert_chunk(&chunk).unwrap().len();
        assert!(
            (out_len as isize - 1045).unsigned_abs() <= 12,
            "produced {out_len} frames"
        );
    }

    #[test]
    fn consecutive_chunks_are_phase_continuous() {
        // A linear ramp split across two chunks must come out without a jump
        // at the seam; cubic interpolation reproduces a ramp almost exactly.
        let mut rc = RateConverter::new(44_100, 48_000, 960).unwrap();
        let ramp: Vec<f32> = (0..1920).map(|i| i as f32 * 1e-4).collect();

        let mut joined: Vec<f32> = rc.convert_chunk(&ramp[..960]).unwrap().to_vec();
        joined.extend_from_slice(rc.convert_chunk(&ramp[960..]).unwrap());

        // Skip the warm-up frames dominated by the initial delay line.
        let step_bound = 2e-4;
        for pair in joined[16..].windows(2) {
            let step = pair[1] - pair[0];
            assert!(
                (-1e-5..step_bound).contains(&step),
                "discontinuity in resampled ramp: step {step}"
            );
        }
    }

    #[test]
    fn reset_drops_the_delay_line() {
        let mut rc = RateConverter::new(44_100, 48_000, 960).unwrap();
        rc.convert_chunk(&vec![0.9f32; 960]).unwrap();
        rc.reset();

        // Without history, silence in means silence out.
        let out = rc.convert_chunk(&vec![0.0f32; 960]).unwrap();
        assert!(
            out.iter().all(|v| v.abs() < 1e-3),
            "stale audio bled through reset"
        );
    }
}
