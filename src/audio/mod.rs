//! Low-latency playback and capture via the cpal backend.
//!
//! # Design constraints
//!
//! Both driver callbacks run on OS audio threads at elevated priority. They
//! **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! The playback callback only copies bytes out of the preloaded
//! [`ReferenceBuffer`] (one atomic cursor bump) and pushes the same bytes
//! into a lock-free ring; the capture callback only pushes the incoming
//! bytes into its ring. Error callbacks hand off to a short-lived teardown
//! thread instead of doing work in place.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Both streams are therefore created, held and dropped on the
//! engine's worker thread; the controller never touches them directly.

pub mod format;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BufferSize, SampleRate, Stream, StreamConfig, SupportedBufferSize,
};

use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use tracing::{info, warn};

#[cfg(feature = "audio-cpal")]
use crate::audio::format::{AudioFormat, SampleKind};
use crate::audio::format::{NegotiatedStream, StreamOptions};
use crate::buffering::convert::FormatRingWriter;
use crate::buffering::reference::ReferenceBuffer;
use crate::engine::ErrorNotifier;
#[cfg(not(feature = "audio-cpal"))]
use crate::error::ProbeError;
use crate::error::Result;
#[cfg(feature = "audio-cpal")]
use crate::ipc::events::codes;

/// Lifecycle of one stream, visible to the controller for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamPhase {
    Idle = 0,
    Running = 1,
    /// Playback only: the reference buffer is exhausted.
    Ended = 2,
    Errored = 3,
}

impl StreamPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamPhase::Running,
            2 => StreamPhase::Ended,
            3 => StreamPhase::Errored,
            _ => StreamPhase::Idle,
        }
    }
}

/// Handle to the active playback stream.
///
/// **Not `Send`** — bound to the thread that opened it. Dropping the handle
/// closes the stream.
pub struct Playback {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    negotiated: NegotiatedStream,
    phase: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
}

impl Playback {
    /// Open the default output device with the working format and start it.
    ///
    /// Every callback pulls `frame_count` frames' worth of bytes from
    /// `reference`, zero-fills any shortfall, and forwards the pulled bytes
    /// (never the fill) into `tap`. When the reference is exhausted the
    /// shared `running` flag is cleared — the run stops itself.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        options: &StreamOptions,
        sample_rate: u32,
        channels: u16,
        reference: Arc<ReferenceBuffer>,
        tap: FormatRingWriter,
        running: Arc<AtomicBool>,
        errors: ErrorNotifier,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| crate::error::ProbeError::StreamOpen("no default output device".into()))?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| crate::error::ProbeError::StreamOpen(e.to_string()))?;
        let burst = burst_frames(supported.buffer_size());
        let buffer = requested_buffer(options, supported.buffer_size());

        let phase = Arc::new(AtomicU8::new(StreamPhase::Idle as u8));
        let (stream, buffer_frames) = match options.kind {
            SampleKind::Int16 => build_playback_stream::<i16>(
                &device,
                sample_rate,
                channels,
                buffer,
                reference,
                tap,
                Arc::clone(&running),
                Arc::clone(&phase),
                errors,
            )?,
            SampleKind::Float32 => build_playback_stream::<f32>(
                &device,
                sample_rate,
                channels,
                buffer,
                reference,
                tap,
                Arc::clone(&running),
                Arc::clone(&phase),
                errors,
            )?,
        };

        stream
            .play()
            .map_err(|e| crate::error::ProbeError::StreamOpen(e.to_string()))?;
        phase.store(StreamPhase::Running as u8, Ordering::Release);

        let negotiated = NegotiatedStream {
            format: AudioFormat::new(sample_rate, channels, options.kind),
            sharing: options.sharing,
            perf: options.perf,
            frames_per_burst: burst,
            buffer_frames,
        };
        info!(config = %negotiated.config_string(), "output stream started");

        Ok(Self {
            _stream: stream,
            negotiated,
            phase,
            running,
        })
    }

    /// What the stream actually opened with.
    pub fn negotiated(&self) -> &NegotiatedStream {
        &self.negotiated
    }

    pub fn phase(&self) -> StreamPhase {
        StreamPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Signal the callback to emit silence from its next invocation on.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Handle to the active capture stream. Same thread-affinity rules as
/// [`Playback`].
pub struct Capture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    negotiated: NegotiatedStream,
    phase: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
}

impl Capture {
    /// Open the default input device with the working format and start it.
    ///
    /// Every callback forwards the incoming interleaved bytes, untouched,
    /// into `writer`.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        options: &StreamOptions,
        sample_rate: u32,
        channels: u16,
        writer: FormatRingWriter,
        running: Arc<AtomicBool>,
        errors: ErrorNotifier,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| crate::error::ProbeError::StreamOpen("no default input device".into()))?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| crate::error::ProbeError::StreamOpen(e.to_string()))?;
        let burst = burst_frames(supported.buffer_size());
        let buffer = requested_buffer(options, supported.buffer_size());

        let phase = Arc::new(AtomicU8::new(StreamPhase::Idle as u8));
        let (stream, buffer_frames) = match options.kind {
            SampleKind::Int16 => build_capture_stream::<i16>(
                &device,
                sample_rate,
                channels,
                buffer,
                writer,
                Arc::clone(&running),
                Arc::clone(&phase),
                errors,
            )?,
            SampleKind::Float32 => build_capture_stream::<f32>(
                &device,
                sample_rate,
                channels,
                buffer,
                writer,
                Arc::clone(&running),
                Arc::clone(&phase),
                errors,
            )?,
        };

        stream
            .play()
            .map_err(|e| crate::error::ProbeError::StreamOpen(e.to_string()))?;
        phase.store(StreamPhase::Running as u8, Ordering::Release);

        let negotiated = NegotiatedStream {
            format: AudioFormat::new(sample_rate, channels, options.kind),
            sharing: options.sharing,
            perf: options.perf,
            frames_per_burst: burst,
            buffer_frames,
        };
        info!(config = %negotiated.config_string(), "input stream started");

        Ok(Self {
            _stream: stream,
            negotiated,
            phase,
            running,
        })
    }

    pub fn negotiated(&self) -> &NegotiatedStream {
        &self.negotiated
    }

    pub fn phase(&self) -> StreamPhase {
        StreamPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Device burst size: the smallest buffer the driver reports supporting.
/// 0 when the backend does not expose buffer bounds.
#[cfg(feature = "audio-cpal")]
fn burst_frames(size: &SupportedBufferSize) -> u32 {
    match size {
        SupportedBufferSize::Range { min, .. } => *min,
        SupportedBufferSize::Unknown => 0,
    }
}

/// Buffer request for the stream: 2× burst in low-latency mode, clamped into
/// the range the device advertises; `None` (device default) otherwise. A
/// device that cannot honour the low-latency size is tolerated by clamping
/// rather than failing the open.
#[cfg(feature = "audio-cpal")]
fn requested_buffer(options: &StreamOptions, size: &SupportedBufferSize) -> Option<u32> {
    match (options.perf, size) {
        (format::PerfMode::LowLatency, SupportedBufferSize::Range { min, max }) if *min > 0 => {
            let target = (min * 2).clamp(*min, *max);
            if target != min * 2 {
                warn!(
                    requested = min * 2,
                    granted = target,
                    "low-latency buffer clamped to device range"
                );
            }
            Some(target)
        }
        _ => None,
    }
}

#[cfg(feature = "audio-cpal")]
#[allow(clippy::too_many_arguments)]
fn build_playback_stream<T: cpal::SizedSample + bytemuck::Pod>(
    device: &cpal::Device,
    sample_rate: u32,
    channels: u16,
    buffer: Option<u32>,
    reference: Arc<ReferenceBuffer>,
    mut tap: FormatRingWriter,
    running: Arc<AtomicBool>,
    phase: Arc<AtomicU8>,
    errors: ErrorNotifier,
) -> Result<(Stream, u32)> {
    let data_phase = Arc::clone(&phase);
    let data_cb = move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
        let dst: &mut [u8] = bytemuck::cast_slice_mut(data);
        if !running.load(Ordering::Relaxed) {
            dst.fill(0);
            return;
        }

        let (chunk, done) = reference.take(dst.len());
        let pulled = chunk.len();
        dst[..pulled].copy_from_slice(chunk);
        if pulled < dst.len() {
            dst[pulled..].fill(0);
        }

        // The reference ring sees exactly what the driver got, minus fill.
        if pulled > 0 {
            let written = tap.write_bytes(chunk);
            if written < pulled {
                warn!("reference ring full: dropped {} bytes", pulled - written);
            }
        }

        if done {
            data_phase.store(StreamPhase::Ended as u8, Ordering::Release);
            running.store(false, Ordering::Release);
            info!("reference exhausted, playback ended");
        }
    };

    let err_phase = phase;
    let err_cb = move |err: cpal::StreamError| {
        err_phase.store(StreamPhase::Errored as u8, Ordering::Release);
        let code = match err {
            cpal::StreamError::DeviceNotAvailable => codes::DEVICE_LOST,
            _ => codes::BACKEND_ERROR,
        };
        errors.raise(format!("playback stream error: {err}"), code);
    };

    let (buffer_size, buffer_frames) = match buffer {
        Some(frames) => (BufferSize::Fixed(frames), frames),
        None => (BufferSize::Default, 0),
    };
    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size,
    };
    let stream = device
        .build_output_stream(&config, data_cb, err_cb, None)
        .map_err(|e| crate::error::ProbeError::StreamOpen(e.to_string()))?;
    Ok((stream, buffer_frames))
}

#[cfg(feature = "audio-cpal")]
#[allow(clippy::too_many_arguments)]
fn build_capture_stream<T: cpal::SizedSample + bytemuck::Pod>(
    device: &cpal::Device,
    sample_rate: u32,
    channels: u16,
    buffer: Option<u32>,
    mut writer: FormatRingWriter,
    running: Arc<AtomicBool>,
    phase: Arc<AtomicU8>,
    errors: ErrorNotifier,
) -> Result<(Stream, u32)> {
    let data_cb = move |data: &[T], _info: &cpal::InputCallbackInfo| {
        if !running.load(Ordering::Relaxed) {
            return;
        }
        let src: &[u8] = bytemuck::cast_slice(data);
        let written = writer.write_bytes(src);
        if written < src.len() {
            warn!("capture ring full: dropped {} bytes", src.len() - written);
        }
    };

    let err_phase = phase;
    let err_cb = move |err: cpal::StreamError| {
        err_phase.store(StreamPhase::Errored as u8, Ordering::Release);
        let code = match err {
            cpal::StreamError::DeviceNotAvailable => codes::DEVICE_LOST,
            _ => codes::BACKEND_ERROR,
        };
        errors.raise(format!("capture stream error: {err}"), code);
    };

    let (buffer_size, buffer_frames) = match buffer {
        Some(frames) => (BufferSize::Fixed(frames), frames),
        None => (BufferSize::Default, 0),
    };
    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size,
    };
    let stream = device
        .build_input_stream(&config, data_cb, err_cb, None)
        .map_err(|e| crate::error::ProbeError::StreamOpen(e.to_string()))?;
    Ok((stream, buffer_frames))
}

/// Stubs when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl Playback {
    pub fn open(
        _options: &StreamOptions,
        _sample_rate: u32,
        _channels: u16,
        _reference: Arc<ReferenceBuffer>,
        _tap: FormatRingWriter,
        _running: Arc<AtomicBool>,
        _errors: ErrorNotifier,
    ) -> Result<Self> {
        Err(ProbeError::StreamOpen(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl Capture {
    pub fn open(
        _options: &StreamOptions,
        _sample_rate: u32,
        _channels: u16,
        _writer: FormatRingWriter,
        _running: Arc<AtomicBool>,
        _errors: ErrorNotifier,
    ) -> Result<Self> {
        Err(ProbeError::StreamOpen(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
