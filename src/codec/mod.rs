//! Codec collaborator abstraction.
//!
//! Decoding the reference file to PCM and encoding the merged PCM to M4A are
//! external concerns — the engine consumes them through this narrow trait so
//! hosts can plug in FFmpeg, MediaCodec bindings, or the raw-PCM stub used in
//! tests.
//!
//! `&mut self` expresses that codec backends are stateful (contexts, open
//! handles); all mutation is serialised through `CodecHandle`'s
//! `parking_lot::Mutex`.

pub mod pcm;
pub mod raw;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Contract for decode/encode backends.
pub trait AudioCodec: Send + 'static {
    /// Decode `src` into interleaved PCM at the requested rate/channels,
    /// written under `cache_dir` as `out_name`.
    ///
    /// `float` selects 32-bit float output over signed 16-bit.
    ///
    /// # Errors
    /// Any failure aborts the test run as `DecodeFailed`.
    fn decode_to_pcm(
        &mut self,
        src: &Path,
        cache_dir: &Path,
        out_sample_rate: u32,
        out_channels: u16,
        out_name: &str,
        float: bool,
    ) -> Result<PathBuf>;

    /// Encode an interleaved PCM file into an M4A/AAC container.
    ///
    /// Returns 0 on success; a non-zero code is reported through the
    /// completion event and is not fatal for the session.
    fn encode_pcm_to_m4a(
        &mut self,
        pcm: &Path,
        out_m4a: &Path,
        in_sample_rate: u32,
        in_channels: u16,
        float: bool,
    ) -> i32;
}

/// Thread-safe reference-counted handle to any `AudioCodec` implementor.
#[derive(Clone)]
pub struct CodecHandle(pub Arc<Mutex<dyn AudioCodec>>);

impl CodecHandle {
    /// Wrap any `AudioCodec` in a `CodecHandle`.
    pub fn new<C: AudioCodec>(codec: C) -> Self {
        Self(Arc::new(Mutex::new(codec)))
    }
}

impl std::fmt::Debug for CodecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecHandle").finish_non_exhaustive()
    }
}
