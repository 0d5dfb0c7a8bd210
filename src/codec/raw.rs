//! `RawPcmCodec` — pass-through backend for sources that are already PCM.
//!
//! "Decoding" copies the input file into the cache directory unchanged, and
//! "encoding" copies the PCM to the output path without a container. Used by
//! the test suite and by development hosts that feed raw captures instead of
//! compressed audio.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::codec::AudioCodec;
use crate::error::{ProbeError, Result};

/// Copy-through codec. The requested rate/channels/format are trusted to
/// already match the source file.
pub struct RawPcmCodec;

impl RawPcmCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RawPcmCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioCodec for RawPcmCodec {
    fn decode_to_pcm(
        &mut self,
        src: &Path,
        cache_dir: &Path,
        out_sample_rate: u32,
        out_channels: u16,
        out_name: &str,
        float: bool,
    ) -> Result<PathBuf> {
        let dest = cache_dir.join(out_name);
        debug!(
            src = %src.display(),
            dest = %dest.display(),
            out_sample_rate,
            out_channels,
            float,
            "RawPcmCodec::decode_to_pcm — copying without conversion"
        );
        std::fs::copy(src, &dest)
            .map_err(|e| ProbeError::DecodeFailed(format!("{}: {e}", src.display())))?;
        Ok(dest)
    }

    fn encode_pcm_to_m4a(
        &mut self,
        pcm: &Path,
        out_m4a: &Path,
        in_sample_rate: u32,
        in_channels: u16,
        float: bool,
    ) -> i32 {
        debug!(
            pcm = %pcm.display(),
            out = %out_m4a.display(),
            in_sample_rate,
            in_channels,
            float,
            "RawPcmCodec::encode_pcm_to_m4a — copying without a container"
        );
        match std::fs::copy(pcm, out_m4a) {
            Ok(_) => 0,
            Err(e) => {
                warn!("RawPcmCodec encode copy failed: {e}");
                -1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_copies_into_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.pcm");
        std::fs::write(&src, [1u8, 2, 3, 4]).unwrap();

        let mut codec = RawPcmCodec::new();
        let out = codec
            .decode_to_pcm(&src, dir.path(), 48_000, 1, "orig_s16le.pcm", false)
            .unwrap();
        assert_eq!(out, dir.path().join("orig_s16le.pcm"));
        assert_eq!(std::fs::read(out).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn decode_of_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut codec = RawPcmCodec::new();
        let err = codec
            .decode_to_pcm(
                &dir.path().join("missing"),
                dir.path(),
                48_000,
                1,
                "out.pcm",
                false,
            )
            .unwrap_err();
        assert!(matches!(err, ProbeError::DecodeFailed(_)));
    }

    #[test]
    fn encode_returns_zero_on_success_nonzero_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pcm = dir.path().join("merged.pcm");
        std::fs::write(&pcm, [0u8; 16]).unwrap();

        let mut codec = RawPcmCodec::new();
        assert_eq!(
            codec.encode_pcm_to_m4a(&pcm, &dir.path().join("out.m4a"), 48_000, 2, false),
            0
        );
        assert_ne!(
            codec.encode_pcm_to_m4a(
                &dir.path().join("missing.pcm"),
                &dir.path().join("out2.m4a"),
                48_000,
                2,
                false
            ),
            0
        );
    }
}
