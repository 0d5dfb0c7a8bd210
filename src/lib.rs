//! # echoprobe
//!
//! Round-trip audio latency measurement engine: play a reference file
//! through the speaker while capturing the microphone, then cross-correlate
//! the recording against the original to estimate the end-to-end
//! playback → acoustic → capture delay.
//!
//! ## Architecture
//!
//! ```text
//! reference.pcm ─► ReferenceBuffer ─► Playback ─► speaker
//!                        │ (tap: same bytes)
//!                        ▼
//!               FormatRing (reference)──┐
//!                                       ├─► merge worker ─► merged_lr_f32le.pcm
//!               FormatRing (capture) ───┘        │
//!                        ▲                       ├─► delay detector (NCC)
//! microphone ─► Capture ─┘                       ├─► auto-gain → i16 rewrite
//!                                                └─► encoder → .m4a
//! ```
//!
//! Both driver callbacks are zero-alloc and lock-free; all heap work happens
//! on the merge worker thread. Results and state changes are broadcast to
//! the host via [`EchoProbe::subscribe_events`] and
//! [`EchoProbe::subscribe_status`].
//!
//! The cpal driver backend is behind the `audio-cpal` feature (it needs
//! platform audio headers to link). Without it the stream engines return an
//! error at open; everything else — rings, merge worker, detector, gain,
//! codec seam — is fully functional and device-free.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod detect;
pub mod engine;
pub mod error;
pub mod gain;
pub mod ipc;

// Convenience re-exports for downstream crates
pub use audio::format::{
    AudioFormat, NegotiatedStream, PerfMode, SampleKind, Sharing, StreamOptions,
    CANONICAL_SAMPLE_RATE,
};
pub use codec::{raw::RawPcmCodec, AudioCodec, CodecHandle};
pub use detect::{detect_delay, DelayReport, DetectorConfig, WindowScore};
pub use engine::{EchoProbe, ProbeConfig};
pub use error::ProbeError;
pub use gain::{rebalance_capture, GainSummary};
pub use ipc::events::{
    CompletionReport, DelayWindow, ProbeEvent, ProbeStatus, ProbeStatusEvent,
};
