//! Little-endian interleaved PCM file helpers for the intermediate artifact.

use std::path::Path;

use crate::error::{ProbeError, Result};

/// Read an interleaved stereo f32le file fully into memory.
///
/// The file is bounded by the reference duration, so whole-file loading is
/// fine. Rejects files whose size is not a multiple of one stereo frame.
pub fn read_f32_stereo(path: &Path) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % 8 != 0 {
        return Err(ProbeError::InvalidPcm(format!(
            "stereo f32 file {} has {} stray trailing bytes",
            path.display(),
            bytes.len() % 8
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Split an interleaved stereo buffer into (left, right).
pub fn split_stereo(interleaved: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let frames = interleaved.len() / 2;
    let mut left = Vec::with_capacity(frames);
    let mut right = Vec::with_capacity(frames);
    for frame in interleaved.chunks_exact(2) {
        left.push(frame[0]);
        right.push(frame[1]);
    }
    (left, right)
}

/// Clamp to [-1, 1] and quantise to signed 16-bit.
#[inline]
pub fn f32_to_i16(x: f32) -> i16 {
    (x.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Overwrite `path` with interleaved i16le samples.
pub fn write_i16_interleaved(path: &Path, samples: &[i16]) -> Result<()> {
    let bytes: &[u8] = bytemuck::cast_slice(samples);
    std::fs::write(path, bytes)?;
    Ok(())
}
