//! Blocking merge worker.
//!
//! ## Per-iteration stages
//!
//! ```text
//! 1. Pre-heat gate: sleep until preheat_ms elapsed, then clear both rings
//!    (this aligns t=0 for the reference and the capture side)
//! 2. Top up each side's scratch to one 20 ms chunk (960 frames at 48 kHz)
//! 3. Interleave min(left, right) frames → append to merged_lr_f32le.pcm
//! 4. Move each side's unmerged residue to its scratch front
//! 5. Nothing on either side → back off ≈5 ms
//! ```
//!
//! The loop exits when the controller clears `running` (explicit stop or
//! playback self-stop) or when the one-shot error flag is set. A clean exit
//! runs the post chain: delay detection on the float file, capture-channel
//! auto-gain, i16 rewrite, encode, completion event.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::audio::format::CANONICAL_SAMPLE_RATE;
use crate::buffering::convert::FormatRingReader;
use crate::codec::{pcm, CodecHandle};
use crate::detect::{self, DetectorConfig};
use crate::engine::{ErrorNotifier, StatusHub};
use crate::gain;
use crate::ipc::events::{codes, CompletionReport, ProbeEvent, ProbeStatus};

/// Merge chunk duration.
const CHUNK_MS: usize = 20;

/// Frames per chunk at the canonical rate (960).
const CHUNK_FRAMES: usize = CANONICAL_SAMPLE_RATE as usize * CHUNK_MS / 1000;

/// Sleep while waiting for the pre-heat gate.
const PREHEAT_POLL: Duration = Duration::from_millis(100);

/// Default back-off when both rings are empty.
const DEFAULT_EMPTY_SLEEP_MS: u64 = 5;

/// Shared counters for observability; reset per run.
#[derive(Default)]
pub struct MergerDiagnostics {
    pub reference_frames: AtomicUsize,
    pub capture_frames: AtomicUsize,
    pub frames_merged: AtomicUsize,
    pub chunks_written: AtomicUsize,
    pub empty_backoffs: AtomicUsize,
}

impl MergerDiagnostics {
    pub fn reset(&self) {
        self.reference_frames.store(0, Ordering::Relaxed);
        self.capture_frames.store(0, Ordering::Relaxed);
        self.frames_merged.store(0, Ordering::Relaxed);
        self.chunks_written.store(0, Ordering::Relaxed);
        self.empty_backoffs.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MergerSnapshot {
        MergerSnapshot {
            reference_frames: self.reference_frames.load(Ordering::Relaxed),
            capture_frames: self.capture_frames.load(Ordering::Relaxed),
            frames_merged: self.frames_merged.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            empty_backoffs: self.empty_backoffs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MergerSnapshot {
    pub reference_frames: usize,
    pub capture_frames: usize,
    pub frames_merged: usize,
    pub chunks_written: usize,
    pub empty_backoffs: usize,
}

/// All context the worker needs, passed as one struct so the spawn stays tidy.
pub struct MergerContext {
    pub running: Arc<AtomicBool>,
    pub error_flag: Arc<AtomicBool>,
    pub start_time: Instant,
    pub preheat: Duration,
    pub reference: FormatRingReader,
    pub capture: FormatRingReader,
    pub merged_path: PathBuf,
    pub output_m4a: PathBuf,
    pub working_sample_rate: u32,
    pub detector: DetectorConfig,
    pub codec: CodecHandle,
    pub hub: StatusHub,
    pub event_tx: broadcast::Sender<ProbeEvent>,
    pub errors: ErrorNotifier,
    pub diagnostics: Arc<MergerDiagnostics>,
}

/// Run the merge loop until `running` clears, then post-process.
pub fn run(mut ctx: MergerContext) {
    info!(merged = %ctx.merged_path.display(), "merge worker started");

    let file = match std::fs::File::create(&ctx.merged_path) {
        Ok(f) => f,
        Err(e) => {
            ctx.errors.raise_now(
                format!("cannot create {}: {e}", ctx.merged_path.display()),
                codes::MERGE_IO_FAILED,
            );
            return;
        }
    };
    let mut writer = std::io::BufWriter::new(file);

    let mut left_scratch = vec![0f32; CHUNK_FRAMES];
    let mut right_scratch = vec![0f32; CHUNK_FRAMES];
    let mut interleaved = vec![0f32; CHUNK_FRAMES * 2];
    let mut left_rem = 0usize;
    let mut right_rem = 0usize;
    let mut started = false;

    while ctx.running.load(Ordering::Relaxed) && !ctx.error_flag.load(Ordering::Relaxed) {
        // ── Pre-heat gate ────────────────────────────────────────────────
        if !started {
            if ctx.start_time.elapsed() < ctx.preheat {
                std::thread::sleep(PREHEAT_POLL);
                continue;
            }
            // Align t=0: everything buffered during pre-heat is discarded.
            ctx.reference.clear();
            ctx.capture.clear();
            started = true;
            ctx.hub.set(ProbeStatus::Merging, None);
            info!("pre-heat done, merging");
        }

        // ── Top up both sides ────────────────────────────────────────────
        let left_new = ctx
            .reference
            .read_convert(&mut left_scratch[left_rem..CHUNK_FRAMES]);
        let right_new = ctx
            .capture
            .read_convert(&mut right_scratch[right_rem..CHUNK_FRAMES]);
        ctx.diagnostics
            .reference_frames
            .fetch_add(left_new, Ordering::Relaxed);
        ctx.diagnostics
            .capture_frames
            .fetch_add(right_new, Ordering::Relaxed);

        let left_have = left_rem + left_new;
        let right_have = right_rem + right_new;
        let frames = left_have.min(right_have);
        if frames == 0 {
            ctx.diagnostics.empty_backoffs.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
            continue;
        }

        // ── Interleave and append (no mixing: L = reference, R = capture) ─
        for i in 0..frames {
            interleaved[2 * i] = left_scratch[i];
            interleaved[2 * i + 1] = right_scratch[i];
        }
        if let Err(e) = writer.write_all(bytemuck::cast_slice(&interleaved[..frames * 2])) {
            drop(writer);
            ctx.errors.raise_now(
                format!("write to {} failed: {e}", ctx.merged_path.display()),
                codes::MERGE_IO_FAILED,
            );
            return;
        }
        ctx.diagnostics
            .frames_merged
            .fetch_add(frames, Ordering::Relaxed);
        ctx.diagnostics.chunks_written.fetch_add(1, Ordering::Relaxed);

        // ── Carry residues to the scratch front ──────────────────────────
        left_rem = left_have - frames;
        right_rem = right_have - frames;
        if left_rem > 0 {
            left_scratch.copy_within(frames..left_have, 0);
        }
        if right_rem > 0 {
            right_scratch.copy_within(frames..right_have, 0);
        }
    }

    if let Err(e) = writer.flush() {
        ctx.errors.raise_now(
            format!("flush of {} failed: {e}", ctx.merged_path.display()),
            codes::MERGE_IO_FAILED,
        );
        return;
    }
    drop(writer);

    let snap = ctx.diagnostics.snapshot();
    info!(
        reference_frames = snap.reference_frames,
        capture_frames = snap.capture_frames,
        frames_merged = snap.frames_merged,
        chunks_written = snap.chunks_written,
        empty_backoffs = snap.empty_backoffs,
        "merge loop finished"
    );

    if ctx.error_flag.load(Ordering::Relaxed) {
        warn!("error occurred, skipping detection and encoding");
        return;
    }

    post_process(&mut ctx);
}

/// Detection → auto-gain → i16 rewrite → encode → completion event.
fn post_process(ctx: &mut MergerContext) {
    ctx.hub.set(ProbeStatus::Detecting, None);
    let _ = ctx.event_tx.send(ProbeEvent::Detecting);

    let mut samples = match pcm::read_f32_stereo(&ctx.merged_path) {
        Ok(s) => s,
        Err(e) => {
            ctx.errors.raise_now(
                format!("cannot read merged file: {e}"),
                codes::MERGE_IO_FAILED,
            );
            return;
        }
    };

    let (left, right) = pcm::split_stereo(&samples);
    let report = detect::detect_delay(&left, &right, ctx.working_sample_rate, &ctx.detector);
    match &report {
        Some(r) => info!(
            delay_ms = format_args!("{:.2}", r.delay_ms),
            low_confidence = r.low_confidence,
            "delay detected"
        ),
        None => warn!("delay detection found no usable correlation"),
    }

    let gain_summary = gain::rebalance_capture(&mut samples);
    debug!(?gain_summary, "auto-gain finished");

    // The encoder consumes interleaved i16 at the working rate.
    let quantised: Vec<i16> = samples.iter().map(|&s| pcm::f32_to_i16(s)).collect();
    if let Err(e) = pcm::write_i16_interleaved(&ctx.merged_path, &quantised) {
        ctx.errors.raise_now(
            format!("cannot rewrite merged file: {e}"),
            codes::MERGE_IO_FAILED,
        );
        return;
    }

    ctx.hub.set(ProbeStatus::Finishing, None);
    let rc = ctx.codec.0.lock().encode_pcm_to_m4a(
        &ctx.merged_path,
        &ctx.output_m4a,
        ctx.working_sample_rate,
        2,
        false,
    );
    if rc == 0 {
        info!(out = %ctx.output_m4a.display(), "encode finished");
    } else {
        warn!(rc, out = %ctx.output_m4a.display(), "encode failed");
    }

    if ctx.error_flag.load(Ordering::Relaxed) {
        warn!("error occurred during post-processing, suppressing completion");
        return;
    }

    let completion = CompletionReport::new(
        ctx.output_m4a.display().to_string(),
        rc,
        ctx.working_sample_rate,
        report.as_ref(),
    );
    let _ = ctx.event_tx.send(ProbeEvent::Completed(completion));
    ctx.hub.set(ProbeStatus::Stopped, None);
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("ECHOPROBE_MERGE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_EMPTY_SLEEP_MS)
    })
}
