//! Audio format descriptors shared by the streams, the ring buffers and the
//! reference buffer.
//!
//! A format is the triple (sample rate, channel count, sample kind). Stereo
//! data is always interleaved LRLR. The *working format* is the one both
//! driver streams are opened with; the *canonical form* (48 kHz mono f32) is
//! what the merge worker consumes on each side.

use serde::{Deserialize, Serialize};

/// Sample rate of the canonical merge form.
pub const CANONICAL_SAMPLE_RATE: u32 = 48_000;

/// On-the-wire sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    /// Signed 16-bit little-endian.
    Int16,
    /// 32-bit IEEE float in [-1.0, 1.0].
    Float32,
}

impl SampleKind {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleKind::Int16 => 2,
            SampleKind::Float32 => 4,
        }
    }

    /// Label used in stream config strings ("FMT=I16" / "FMT=Float").
    pub fn label(self) -> &'static str {
        match self {
            SampleKind::Int16 => "I16",
            SampleKind::Float32 => "Float",
        }
    }
}

/// Requested device sharing mode. Advisory on hosts whose driver API has no
/// equivalent knob; recorded verbatim in the negotiated snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sharing {
    Exclusive,
    Shared,
}

impl Sharing {
    pub fn label(self) -> &'static str {
        match self {
            Sharing::Exclusive => "Exclusive",
            Sharing::Shared => "Shared",
        }
    }
}

/// Requested performance mode. `LowLatency` asks the stream for a buffer of
/// twice the device burst size; `None` leaves the device default alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerfMode {
    LowLatency,
    None,
}

impl PerfMode {
    pub fn label(self) -> &'static str {
        match self {
            PerfMode::LowLatency => "LowLatency",
            PerfMode::None => "None",
        }
    }
}

/// A concrete PCM format: rate, channels, sample kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub kind: SampleKind,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, kind: SampleKind) -> Self {
        Self {
            sample_rate,
            channels,
            kind,
        }
    }

    /// 48 kHz mono f32 — the form both merge sides are converted into.
    pub fn canonical() -> Self {
        Self::new(CANONICAL_SAMPLE_RATE, 1, SampleKind::Float32)
    }

    /// Byte width of one frame (one sample per channel).
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.kind.bytes_per_sample()
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_bytes()
    }

    /// Whole-frame byte count covering `ms` milliseconds.
    pub fn bytes_for_ms(&self, ms: u32) -> usize {
        let frames = self.sample_rate as usize * ms as usize / 1000;
        frames * self.frame_bytes()
    }
}

/// Per-direction stream request (§6 test-run configuration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub sharing: Sharing,
    pub perf: PerfMode,
    pub kind: SampleKind,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            sharing: Sharing::Exclusive,
            perf: PerfMode::LowLatency,
            kind: SampleKind::Int16,
        }
    }
}

/// Snapshot of what a stream actually opened with.
///
/// `buffer_frames == 0` means the device kept its own default size (a
/// low-latency resize request was rejected and tolerated).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NegotiatedStream {
    pub format: AudioFormat,
    pub sharing: Sharing,
    pub perf: PerfMode,
    pub frames_per_burst: u32,
    pub buffer_frames: u32,
}

impl NegotiatedStream {
    /// Host-facing one-liner, e.g.
    /// `SR=48000 CH=1 FMT=I16 MODE=Exclusive PERF=LowLatency FPB=96 BUF=192`.
    pub fn config_string(&self) -> String {
        format!(
            "SR={} CH={} FMT={} MODE={} PERF={} FPB={} BUF={}",
            self.format.sample_rate,
            self.format.channels,
            self.format.kind.label(),
            self.sharing.label(),
            self.perf.label(),
            self.frames_per_burst,
            self.buffer_frames,
        )
    }
}
