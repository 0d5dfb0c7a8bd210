//! Preloaded reference track with a pre-heat silence prefix.
//!
//! The playback callback pulls from this buffer with a single atomic cursor;
//! the cursor is monotone and never rewinds, so the concatenation of all
//! returned slices is exactly `silence ‖ payload`.

use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::info;

use crate::audio::format::AudioFormat;
use crate::error::{ProbeError, Result};

/// Hard cap on the decoded reference payload read into memory.
pub const MAX_REFERENCE_BYTES: usize = 50 * 1024 * 1024;

/// Immutable in-memory PCM of the reference track, prefixed by `preheat_ms`
/// of zeroed samples at the working format.
#[derive(Debug)]
pub struct ReferenceBuffer {
    data: Vec<u8>,
    silence_bytes: usize,
    cursor: AtomicUsize,
}

impl ReferenceBuffer {
    /// Read a decoded PCM file (capped at 50 MiB) and prepend the pre-heat
    /// silence.
    ///
    /// # Errors
    /// `ProbeError::PreloadFailed` when the file is unreadable or empty.
    pub fn load(path: &Path, format: &AudioFormat, preheat_ms: u32) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| ProbeError::PreloadFailed(format!("{}: {e}", path.display())))?;

        let mut payload = Vec::new();
        file.take(MAX_REFERENCE_BYTES as u64)
            .read_to_end(&mut payload)
            .map_err(|e| ProbeError::PreloadFailed(format!("{}: {e}", path.display())))?;

        Self::from_payload(payload, format, preheat_ms)
    }

    /// Build from an already-decoded payload.
    pub fn from_payload(payload: Vec<u8>, format: &AudioFormat, preheat_ms: u32) -> Result<Self> {
        if payload.is_empty() {
            return Err(ProbeError::PreloadFailed("reference PCM is empty".into()));
        }

        let silence_bytes = format.bytes_for_ms(preheat_ms);
        let mut data = vec![0u8; silence_bytes];
        data.extend_from_slice(&payload);

        info!(
            silence_bytes,
            payload_bytes = payload.len(),
            total_bytes = data.len(),
            "reference loaded"
        );

        Ok(Self {
            data,
            silence_bytes,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Take up to `n_bytes` starting at the cursor, advancing it atomically.
    ///
    /// The second value is `true` once the cursor has reached the end; the
    /// returned slice may then be shorter than requested (or empty).
    pub fn take(&self, n_bytes: usize) -> (&[u8], bool) {
        let len = self.data.len();
        let start = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some((c + n_bytes).min(len))
            })
            .unwrap_or(len);
        let end = (start + n_bytes).min(len);
        (&self.data[start..end], end == len)
    }

    /// Total length in bytes: silence + payload.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes of pre-heat silence at the front.
    pub fn silence_bytes(&self) -> usize {
        self.silence_bytes
    }

    /// Current cursor position in bytes.
    pub fn position(&self) -> usize {
        self.cursor.load(Ordering::Acquire).min(self.data.len())
    }

    /// Whether playback has consumed the whole buffer.
    pub fn is_exhausted(&self) -> bool {
        self.position() == self.data.len()
    }
}
