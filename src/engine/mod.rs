//! `EchoProbe` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! EchoProbe::new()
//!     └─► start()   → decode → preload → open streams → running
//!         │             (worker thread owns both cpal streams + merge loop)
//!         ├─► self-stop when the reference is exhausted
//!         └─► stop()  → running=false, worker joined, streams dropped
//! ```
//!
//! `start()` refuses to overlap runs; `stop()` is safe to call any number of
//! times, including after a self-stop (it then only joins the worker).
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). Both streams are therefore opened *inside* the worker thread
//! and never cross a thread boundary; a sync mpsc channel propagates any
//! open error back to the `start()` caller. The same thread then runs the
//! merge loop, so stream teardown happens exactly where they were created.

pub mod merger;

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::audio::format::{AudioFormat, SampleKind, StreamOptions};
use crate::audio::{Capture, Playback};
use crate::buffering::convert::FormatRing;
use crate::buffering::reference::ReferenceBuffer;
use crate::codec::CodecHandle;
use crate::detect::DetectorConfig;
use crate::error::{ProbeError, Result};
use crate::ipc::events::{codes, ProbeEvent, ProbeStatus, ProbeStatusEvent};

/// Broadcast capacity: plenty for the handful of events one run produces.
const BROADCAST_CAP: usize = 256;

/// Name of the decoded reference file in the cache directory.
fn decoded_pcm_name(kind: SampleKind) -> &'static str {
    match kind {
        SampleKind::Float32 => "orig_f32le.pcm",
        SampleKind::Int16 => "orig_s16le.pcm",
    }
}

/// Name of the intermediate merged artifact.
const MERGED_PCM_NAME: &str = "merged_lr_f32le.pcm";

/// Configuration for one test run.
///
/// `sample_rate` and `channels` apply to *both* streams — merge alignment
/// requires a single working format, so there is deliberately no per-stream
/// rate/channel knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    /// Working sample rate in Hz. Default 48000; invalid values are clamped.
    pub sample_rate: u32,
    /// Working channel count, 1 or 2. Default 1.
    pub channels: u16,
    /// Output-stream options (sharing/perf/format).
    pub output: StreamOptions,
    /// Input-stream options.
    pub input: StreamOptions,
    /// Capacity of each ring in milliseconds of audio. Default 1000.
    pub ring_buffer_ms: u32,
    /// Silence prepended to the reference while the streams stabilise; the
    /// rings are discarded when it elapses. Default 3000.
    pub preheat_ms: u32,
    /// Delay-detector tuning.
    pub detector: DetectorConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            output: StreamOptions::default(),
            input: StreamOptions::default(),
            ring_buffer_ms: 1000,
            preheat_ms: 3000,
            detector: DetectorConfig::default(),
        }
    }
}

/// Status storage + status channel, shared by the controller, the worker and
/// the error path.
#[derive(Clone)]
pub struct StatusHub {
    status: Arc<Mutex<ProbeStatus>>,
    tx: broadcast::Sender<ProbeStatusEvent>,
}

impl StatusHub {
    pub fn new(tx: broadcast::Sender<ProbeStatusEvent>) -> Self {
        Self {
            status: Arc::new(Mutex::new(ProbeStatus::Idle)),
            tx,
        }
    }

    pub fn set(&self, status: ProbeStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.tx.send(ProbeStatusEvent { status, detail });
    }

    pub fn get(&self) -> ProbeStatus {
        *self.status.lock()
    }
}

/// One-shot error path shared with the driver callbacks and the worker.
///
/// The first `raise` wins the CAS; every later call no-ops, so the host sees
/// exactly one error event per run. `raise` is safe from a real-time thread:
/// it flips two atomics and spawns a detached teardown thread that waits
/// ≈100 ms for the in-flight callback to drain before notifying.
#[derive(Clone)]
pub struct ErrorNotifier {
    pub running: Arc<AtomicBool>,
    pub error_flag: Arc<AtomicBool>,
    pub hub: StatusHub,
    pub event_tx: broadcast::Sender<ProbeEvent>,
    pub origin: &'static str,
}

impl ErrorNotifier {
    /// Deferred raise, for driver callbacks.
    pub fn raise(&self, message: String, code: i32) {
        if !self.acquire() {
            return;
        }
        error!(origin = self.origin, code, message = %message, "stream error, scheduling teardown");
        let this = self.clone();
        std::thread::spawn(move || {
            // Let the outgoing callback finish before the host reacts.
            std::thread::sleep(Duration::from_millis(100));
            this.notify(message, code);
        });
    }

    /// Immediate raise, for the worker thread (no draining needed).
    pub fn raise_now(&self, message: String, code: i32) {
        if !self.acquire() {
            return;
        }
        error!(origin = self.origin, code, message = %message, "worker error");
        self.notify(message, code);
    }

    fn acquire(&self) -> bool {
        if self
            .error_flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(origin = self.origin, "error already handled, ignoring duplicate");
            return false;
        }
        self.running.store(false, Ordering::SeqCst);
        true
    }

    fn notify(&self, message: String, code: i32) {
        self.hub.set(ProbeStatus::Errored, Some(message.clone()));
        let _ = self.event_tx.send(ProbeEvent::Error { message, code });
    }
}

/// The round-trip latency tester.
///
/// `EchoProbe` is `Send + Sync` — all fields use interior mutability. Wrap in
/// an `Arc` to share between the host's command surface and event forwarders.
pub struct EchoProbe {
    config: ProbeConfig,
    codec: CodecHandle,
    /// `true` while streams + merge worker are active.
    running: Arc<AtomicBool>,
    /// One-shot error latch for the current run.
    error_flag: Arc<AtomicBool>,
    hub: StatusHub,
    event_tx: broadcast::Sender<ProbeEvent>,
    /// The stream/merge worker of the current (or last) run.
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    diagnostics: Arc<merger::MergerDiagnostics>,
}

impl EchoProbe {
    /// Create an engine. Does not touch any device — call [`start`].
    ///
    /// [`start`]: EchoProbe::start
    pub fn new(config: ProbeConfig, codec: CodecHandle) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (event_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config,
            codec,
            running: Arc::new(AtomicBool::new(false)),
            error_flag: Arc::new(AtomicBool::new(false)),
            hub: StatusHub::new(status_tx),
            event_tx,
            worker: Mutex::new(None),
            diagnostics: Arc::new(merger::MergerDiagnostics::default()),
        }
    }

    /// Run a latency test: decode `input`, play it while capturing the
    /// microphone, merge, detect, encode to `output_m4a`.
    ///
    /// Blocks until both streams are confirmed open (or failed), then
    /// returns; the run continues on a background worker until the reference
    /// is exhausted or [`stop`] is called.
    ///
    /// # Errors
    /// - `ProbeError::AlreadyRunning` when a run is active.
    /// - `ProbeError::DecodeFailed` / `PreloadFailed` / `StreamOpen` for the
    ///   corresponding start stages; each is also surfaced on the event
    ///   channel.
    ///
    /// [`stop`]: EchoProbe::stop
    pub fn start(&self, input: &Path, cache_dir: &Path, output_m4a: &Path) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ProbeError::AlreadyRunning);
        }
        // A previous run may have self-stopped; reap its worker first.
        if let Some(handle) = self.worker.lock().take() {
            info!("joining worker of previous run before restart");
            let _ = handle.join();
        }

        self.error_flag.store(false, Ordering::SeqCst);
        self.diagnostics.reset();

        let cfg = self.normalized_config();

        // ── Decode ───────────────────────────────────────────────────────
        self.hub.set(ProbeStatus::Decoding, None);
        let out_float = cfg.output.kind == SampleKind::Float32;
        let decoded = match self.codec.0.lock().decode_to_pcm(
            input,
            cache_dir,
            cfg.sample_rate,
            cfg.channels,
            decoded_pcm_name(cfg.output.kind),
            out_float,
        ) {
            Ok(path) if !path.as_os_str().is_empty() => path,
            Ok(_) => {
                return Err(self.fail_start(
                    ProbeError::DecodeFailed("decoder returned an empty path".into()),
                    codes::DECODE_FAILED,
                ))
            }
            Err(e) => return Err(self.fail_start(e, codes::DECODE_FAILED)),
        };
        info!(decoded = %decoded.display(), "reference decoded");

        // ── Preload ──────────────────────────────────────────────────────
        self.hub.set(ProbeStatus::Preloading, None);
        let out_format = AudioFormat::new(cfg.sample_rate, cfg.channels, cfg.output.kind);
        let in_format = AudioFormat::new(cfg.sample_rate, cfg.channels, cfg.input.kind);
        let reference = match ReferenceBuffer::load(&decoded, &out_format, cfg.preheat_ms) {
            Ok(r) => Arc::new(r),
            Err(e) => return Err(self.fail_start(e, codes::PRELOAD_FAILED)),
        };

        // ── Rings ────────────────────────────────────────────────────────
        let canonical = AudioFormat::canonical();
        let reference_cap = out_format.bytes_for_ms(cfg.ring_buffer_ms);
        let capture_cap = in_format.bytes_for_ms(cfg.ring_buffer_ms);
        let (reference_writer, reference_reader) =
            match FormatRing::new(reference_cap, out_format, canonical) {
                Ok(pair) => pair,
                Err(e) => return Err(self.fail_start(e, codes::PRELOAD_FAILED)),
            };
        let (capture_writer, capture_reader) =
            match FormatRing::new(capture_cap, in_format, canonical) {
                Ok(pair) => pair,
                Err(e) => return Err(self.fail_start(e, codes::PRELOAD_FAILED)),
            };

        // ── Open streams + run the merge loop on the worker ──────────────
        self.hub.set(ProbeStatus::OpeningStreams, None);
        self.running.store(true, Ordering::SeqCst);
        let start_time = Instant::now();

        let ctx = merger::MergerContext {
            running: Arc::clone(&self.running),
            error_flag: Arc::clone(&self.error_flag),
            start_time,
            preheat: Duration::from_millis(cfg.preheat_ms as u64),
            reference: reference_reader,
            capture: capture_reader,
            merged_path: cache_dir.join(MERGED_PCM_NAME),
            output_m4a: output_m4a.to_path_buf(),
            working_sample_rate: cfg.sample_rate,
            detector: cfg.detector.clone(),
            codec: self.codec.clone(),
            hub: self.hub.clone(),
            event_tx: self.event_tx.clone(),
            errors: self.notifier("merger"),
            diagnostics: Arc::clone(&self.diagnostics),
        };

        let playback_errors = self.notifier("playback");
        let capture_errors = self.notifier("capture");
        let running = Arc::clone(&self.running);
        let hub = self.hub.clone();
        let event_tx = self.event_tx.clone();
        let output_options = cfg.output;
        let input_options = cfg.input;
        let (sample_rate, channels) = (cfg.sample_rate, cfg.channels);

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<()>>();

        let handle = std::thread::Builder::new()
            .name("echoprobe-io".into())
            .spawn(move || {
                // Streams must be created on THIS thread — cpal::Stream is !Send.
                let playback = match Playback::open(
                    &output_options,
                    sample_rate,
                    channels,
                    reference,
                    reference_writer,
                    Arc::clone(&running),
                    playback_errors,
                ) {
                    Ok(p) => p,
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                let capture = match Capture::open(
                    &input_options,
                    sample_rate,
                    channels,
                    capture_writer,
                    Arc::clone(&running),
                    capture_errors,
                ) {
                    Ok(c) => c,
                    Err(e) => {
                        // Tear the already-opened peer down with the worker.
                        running.store(false, Ordering::SeqCst);
                        let _ = open_tx.send(Err(e));
                        drop(playback);
                        return;
                    }
                };

                let _ = event_tx.send(ProbeEvent::Config {
                    output: playback.negotiated().config_string(),
                    input: capture.negotiated().config_string(),
                });
                hub.set(ProbeStatus::Running, None);
                let _ = open_tx.send(Ok(()));

                merger::run(ctx);

                // Streams drop here, releasing the devices on this thread.
                drop(capture);
                drop(playback);
            })
            .map_err(|e| ProbeError::Other(anyhow::anyhow!("cannot spawn worker: {e}")))?;
        *self.worker.lock() = Some(handle);

        match open_rx.recv() {
            Ok(Ok(())) => {
                info!("latency test started");
                Ok(())
            }
            Ok(Err(e)) => {
                self.join_worker();
                Err(self.fail_start(e, codes::STREAM_OPEN_FAILED))
            }
            Err(_) => {
                // Channel closed with no verdict — the worker died.
                self.running.store(false, Ordering::SeqCst);
                self.join_worker();
                Err(self.fail_start(
                    ProbeError::Other(anyhow::anyhow!("worker died before opening streams")),
                    codes::STREAM_OPEN_FAILED,
                ))
            }
        }
    }

    /// Stop the run and join the worker. Safe to call any number of times,
    /// and required once even after a self-stop to release resources.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.join_worker();
        if was_running {
            info!("latency test stopped");
        }
        let status = self.hub.get();
        if !matches!(
            status,
            ProbeStatus::Idle | ProbeStatus::Stopped | ProbeStatus::Errored
        ) {
            self.hub.set(ProbeStatus::Stopped, None);
        }
    }

    /// Whether playback/capture are currently active. Becomes `false` on its
    /// own when the reference has been played out.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current controller state (snapshot).
    pub fn status(&self) -> ProbeStatus {
        self.hub.get()
    }

    /// Subscribe to controller state changes.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ProbeStatusEvent> {
        self.hub.tx.subscribe()
    }

    /// Subscribe to run milestones (config, detecting, completed, error).
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProbeEvent> {
        self.event_tx.subscribe()
    }

    /// Snapshot of the merge counters for observability.
    pub fn diagnostics_snapshot(&self) -> merger::MergerSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn notifier(&self, origin: &'static str) -> ErrorNotifier {
        ErrorNotifier {
            running: Arc::clone(&self.running),
            error_flag: Arc::clone(&self.error_flag),
            hub: self.hub.clone(),
            event_tx: self.event_tx.clone(),
            origin,
        }
    }

    fn join_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    /// Clamp the host-supplied configuration to supported values.
    fn normalized_config(&self) -> ProbeConfig {
        let mut cfg = self.config.clone();
        if cfg.sample_rate == 0 {
            warn!(sample_rate = cfg.sample_rate, "invalid sample rate, falling back to 48000");
            cfg.sample_rate = 48_000;
        }
        if cfg.channels == 0 || cfg.channels > 2 {
            warn!(channels = cfg.channels, "unsupported channel count, normalizing to mono");
            cfg.channels = 1;
        }
        if cfg.ring_buffer_ms == 0 {
            warn!("ring_buffer_ms of 0, falling back to 1000");
            cfg.ring_buffer_ms = 1000;
        }
        cfg
    }

    /// Record a start-stage failure on both channels and hand the error back.
    fn fail_start(&self, err: ProbeError, code: i32) -> ProbeError {
        self.running.store(false, Ordering::SeqCst);
        let message = err.to_string();
        self.hub.set(ProbeStatus::Errored, Some(message.clone()));
        let _ = self.event_tx.send(ProbeEvent::Error { message, code });
        err
    }
}

impl Drop for EchoProbe {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.get_mut().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::time::Duration;

    use tokio::sync::broadcast::error::TryRecvError;

    use crate::codec::AudioCodec;

    struct FailingCodec;

    impl AudioCodec for FailingCodec {
        fn decode_to_pcm(
            &mut self,
            _src: &Path,
            _cache_dir: &Path,
            _out_sample_rate: u32,
            _out_channels: u16,
            _out_name: &str,
            _float: bool,
        ) -> Result<PathBuf> {
            Err(ProbeError::DecodeFailed("scripted failure".into()))
        }

        fn encode_pcm_to_m4a(
            &mut self,
            _pcm: &Path,
            _out_m4a: &Path,
            _in_sample_rate: u32,
            _in_channels: u16,
            _float: bool,
        ) -> i32 {
            0
        }
    }

    /// Codec whose decode "succeeds" but reports an empty path.
    struct EmptyPathCodec;

    impl AudioCodec for EmptyPathCodec {
        fn decode_to_pcm(
            &mut self,
            _src: &Path,
            _cache_dir: &Path,
            _out_sample_rate: u32,
            _out_channels: u16,
            _out_name: &str,
            _float: bool,
        ) -> Result<PathBuf> {
            Ok(PathBuf::new())
        }

        fn encode_pcm_to_m4a(
            &mut self,
            _pcm: &Path,
            _out_m4a: &Path,
            _in_sample_rate: u32,
            _in_channels: u16,
            _float: bool,
        ) -> i32 {
            0
        }
    }

    #[test]
    fn decode_failure_aborts_start_and_emits_one_error() {
        let probe = EchoProbe::new(ProbeConfig::default(), CodecHandle::new(FailingCodec));
        let mut events = probe.subscribe_events();

        let dir = tempfile::tempdir().unwrap();
        let err = probe
            .start(
                &dir.path().join("in.wav"),
                dir.path(),
                &dir.path().join("out.m4a"),
            )
            .unwrap_err();
        assert!(matches!(err, ProbeError::DecodeFailed(_)));
        assert_eq!(probe.status(), ProbeStatus::Errored);
        assert!(!probe.is_running());

        let event = events.try_recv().expect("one error event");
        let ProbeEvent::Error { code, .. } = event else {
            panic!("expected error event, got {event:?}");
        };
        assert_eq!(code, codes::DECODE_FAILED);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn empty_decoder_path_is_a_decode_failure() {
        let probe = EchoProbe::new(ProbeConfig::default(), CodecHandle::new(EmptyPathCodec));
        let dir = tempfile::tempdir().unwrap();
        let err = probe
            .start(
                &dir.path().join("in.wav"),
                dir.path(),
                &dir.path().join("out.m4a"),
            )
            .unwrap_err();
        assert!(matches!(err, ProbeError::DecodeFailed(_)));
    }

    #[test]
    fn unreadable_reference_is_a_preload_failure() {
        // RawPcmCodec copies the input; pointing it at a missing file makes
        // the decode fail, while an empty file passes decode and must then
        // fail preload.
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.pcm");
        std::fs::write(&input, []).unwrap();

        let probe = EchoProbe::new(
            ProbeConfig::default(),
            CodecHandle::new(crate::codec::raw::RawPcmCodec::new()),
        );
        let err = probe
            .start(&input, dir.path(), &dir.path().join("out.m4a"))
            .unwrap_err();
        assert!(matches!(err, ProbeError::PreloadFailed(_)));
        assert_eq!(probe.status(), ProbeStatus::Errored);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let probe = EchoProbe::new(ProbeConfig::default(), CodecHandle::new(FailingCodec));
        probe.stop();
        probe.stop();
        assert_eq!(probe.status(), ProbeStatus::Idle);
    }

    #[test]
    fn normalization_clamps_invalid_values() {
        let mut config = ProbeConfig::default();
        config.sample_rate = 0;
        config.channels = 6;
        config.ring_buffer_ms = 0;
        let probe = EchoProbe::new(config, CodecHandle::new(FailingCodec));
        let cfg = probe.normalized_config();
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.channels, 1);
        assert_eq!(cfg.ring_buffer_ms, 1000);
    }

    #[test]
    fn error_notifier_fires_exactly_once() {
        let (status_tx, _) = broadcast::channel(8);
        let (event_tx, mut event_rx) = broadcast::channel(8);
        let notifier = ErrorNotifier {
            running: Arc::new(AtomicBool::new(true)),
            error_flag: Arc::new(AtomicBool::new(false)),
            hub: StatusHub::new(status_tx),
            event_tx,
            origin: "test",
        };

        notifier.raise("first".into(), codes::DEVICE_LOST);
        notifier.raise("second".into(), codes::BACKEND_ERROR);
        assert!(!notifier.running.load(Ordering::SeqCst));

        // The deferred notify waits ~100 ms.
        std::thread::sleep(Duration::from_millis(300));
        let ProbeEvent::Error { message, code } = event_rx.try_recv().expect("one error event")
        else {
            panic!("expected error event");
        };
        assert_eq!(message, "first");
        assert_eq!(code, codes::DEVICE_LOST);
        assert!(matches!(event_rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(notifier.hub.get(), ProbeStatus::Errored);
    }

    #[test]
    fn raise_now_notifies_synchronously() {
        let (status_tx, _) = broadcast::channel(8);
        let (event_tx, mut event_rx) = broadcast::channel(8);
        let notifier = ErrorNotifier {
            running: Arc::new(AtomicBool::new(true)),
            error_flag: Arc::new(AtomicBool::new(false)),
            hub: StatusHub::new(status_tx),
            event_tx,
            origin: "merger",
        };

        notifier.raise_now("io failed".into(), codes::MERGE_IO_FAILED);
        let ProbeEvent::Error { code, .. } = event_rx.try_recv().expect("error event") else {
            panic!("expected error event");
        };
        assert_eq!(code, codes::MERGE_IO_FAILED);
    }
}
