//! Format-aware ring: a byte ring plus an (input format → output format)
//! conversion stage on the read side.
//!
//! The writer half is handed to a driver callback and stores raw interleaved
//! bytes exactly as the stream delivered them. The reader half — owned by the
//! merge worker — decodes that format (i16 → f32, stereo → mono average),
//! queues the decoded samples in a pending buffer, and hands the resampler
//! one whole chunk at a time; rubato's delay line persists across chunks, so
//! successive reads yield one phase-continuous stream. When the rates match
//! no resampler session exists at all and the pending buffer feeds the
//! caller directly.
//!
//! Ownership is split rather than shared: single producer on the real-time
//! thread, single consumer on the worker, no lock anywhere.

use tracing::{debug, error};

use crate::audio::format::{AudioFormat, SampleKind};
use crate::audio::resample::RateConverter;
use crate::buffering::{create_byte_ring, ByteRingConsumer, ByteRingProducer, Consumer, Producer};
use crate::error::Result;

/// Input frames fed to the resampler per process call (20 ms at 48 kHz).
const CONVERT_CHUNK: usize = 960;

/// Factory for a matched writer/reader pair over one byte ring.
pub struct FormatRing;

impl FormatRing {
    /// Allocate the ring and configure the conversion stage.
    ///
    /// `capacity_bytes` bounds how much un-merged audio can sit between the
    /// callback and the worker. `out_fmt.channels` must be 1 (the merge
    /// canonical form is mono per side).
    pub fn new(
        capacity_bytes: usize,
        in_fmt: AudioFormat,
        out_fmt: AudioFormat,
    ) -> Result<(FormatRingWriter, FormatRingReader)> {
        debug_assert_eq!(out_fmt.channels, 1, "conversion output is mono per side");

        let (prod, cons) = create_byte_ring(capacity_bytes);
        let converter = if in_fmt.sample_rate == out_fmt.sample_rate {
            None
        } else {
            Some(RateConverter::new(
                in_fmt.sample_rate,
                out_fmt.sample_rate,
                CONVERT_CHUNK,
            )?)
        };

        Ok((
            FormatRingWriter { prod },
            FormatRingReader {
                cons,
                in_fmt,
                out_fmt,
                converter,
                byte_scratch: Vec::new(),
                pending: Vec::new(),
                carry: Vec::new(),
            },
        ))
    }
}

/// Producer half. The only method is wait-free and allocation-free; it is
/// safe to call from the real-time driver callback.
pub struct FormatRingWriter {
    prod: ByteRingProducer,
}

impl FormatRingWriter {
    /// Store raw interleaved bytes in the stream's native format.
    /// Returns how many bytes were actually stored; the tail of an oversized
    /// write is dropped.
    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        self.prod.push_slice(bytes)
    }
}

/// Consumer half: decode + resample on read.
pub struct FormatRingReader {
    cons: ByteRingConsumer,
    in_fmt: AudioFormat,
    out_fmt: AudioFormat,
    /// `None` when the rates match — decoded samples pass straight through.
    converter: Option<RateConverter>,
    byte_scratch: Vec<u8>,
    /// Decoded mono samples waiting to fill a resampler chunk (or, in
    /// passthrough mode, to be handed out on the next read).
    pending: Vec<f32>,
    /// Converted samples that did not fit the caller's buffer last time.
    carry: Vec<f32>,
}

impl FormatRingReader {
    /// Fill `out` with converted mono f32 frames; returns frames produced.
    ///
    /// Pulls roughly `ceil(out.len() × in_sr / out_sr)` input frames from the
    /// ring, decodes and resamples them. Returns 0 without touching `out`
    /// when the ring is empty and nothing is carried over. May return fewer
    /// frames than requested while the resampler warms up; the surplus of a
    /// conversion round is carried into the next call.
    pub fn read_convert(&mut self, out: &mut [f32]) -> usize {
        if out.is_empty() {
            return 0;
        }

        let mut produced = self.drain_carry(out);
        if produced == out.len() {
            return produced;
        }

        let remaining = out.len() - produced;
        let in_frame_bytes = self.in_fmt.frame_bytes();
        let need_frames =
            remaining * self.in_fmt.sample_rate as usize / self.out_fmt.sample_rate as usize + 1;
        let need_bytes = need_frames * in_frame_bytes;

        if self.byte_scratch.len() < need_bytes {
            self.byte_scratch.resize(need_bytes, 0);
        }
        let got_bytes = self.cons.pop_slice(&mut self.byte_scratch[..need_bytes]);
        if got_bytes == 0 && self.pending.is_empty() {
            return produced;
        }
        self.decode_into_pending(got_bytes / in_frame_bytes);

        match self.converter.as_mut() {
            // Passthrough: decoded samples go straight out, leftovers wait.
            None => {
                let take = self.pending.len().min(out.len() - produced);
                out[produced..produced + take].copy_from_slice(&self.pending[..take]);
                self.pending.drain(..take);
                produced += take;
            }
            // Feed the resampler whole chunks; a cursor walks the pending
            // buffer and the tail that is short of a chunk stays queued.
            Some(converter) => {
                let chunk_in = converter.chunk_in();
                let mut consumed = 0usize;
                while self.pending.len() - consumed >= chunk_in {
                    let chunk = &self.pending[consumed..consumed + chunk_in];
                    consumed += chunk_in;
                    let frames = match converter.convert_chunk(chunk) {
                        Ok(frames) => frames,
                        Err(e) => {
                            error!("resampler failed, dropping one chunk: {e}");
                            continue;
                        }
                    };
                    let take = frames.len().min(out.len() - produced);
                    out[produced..produced + take].copy_from_slice(&frames[..take]);
                    produced += take;
                    if frames.len() > take {
                        self.carry.extend_from_slice(&frames[take..]);
                    }
                }
                if consumed > 0 {
                    self.pending.drain(..consumed);
                }
            }
        }

        produced
    }

    /// Drop everything buffered on this side: ring bytes, queued samples,
    /// the carry and the resampler delay line. Establishes a fresh t=0 for
    /// subsequent reads.
    pub fn clear(&mut self) {
        let dropped = self.cons.clear();
        self.pending.clear();
        self.carry.clear();
        if let Some(converter) = self.converter.as_mut() {
            converter.reset();
        }
        debug!(dropped_bytes = dropped, "format ring cleared");
    }

    fn drain_carry(&mut self, out: &mut [f32]) -> usize {
        if self.carry.is_empty() {
            return 0;
        }
        let take = self.carry.len().min(out.len());
        out[..take].copy_from_slice(&self.carry[..take]);
        self.carry.drain(..take);
        take
    }

    /// Decode `frames` interleaved input frames from `byte_scratch`, append
    /// them to `pending` as mono f32 in [-1, 1] (channels averaged).
    fn decode_into_pending(&mut self, frames: usize) {
        if frames == 0 {
            return;
        }
        let ch = self.in_fmt.channels as usize;
        self.pending.reserve(frames);

        match self.in_fmt.kind {
            SampleKind::Int16 => {
                for frame in self.byte_scratch[..frames * ch * 2].chunks_exact(ch * 2) {
                    let mut sum = 0f32;
                    for sample in frame.chunks_exact(2) {
                        sum += i16::from_le_bytes([sample[0], sample[1]]) as f32 / 32768.0;
                    }
                    self.pending.push(sum / ch as f32);
                }
            }
            SampleKind::Float32 => {
                for frame in self.byte_scratch[..frames * ch * 4].chunks_exact(ch * 4) {
                    let mut sum = 0f32;
                    for sample in frame.chunks_exact(4) {
                        sum += f32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                    }
                    self.pending.push(sum / ch as f32);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::CANONICAL_SAMPLE_RATE;

    fn canonical() -> AudioFormat {
        AudioFormat::canonical()
    }

    fn i16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn identity_formats_round_trip_sample_values() {
        let in_fmt = AudioFormat::new(CANONICAL_SAMPLE_RATE, 1, SampleKind::Int16);
        let (mut writer, mut reader) = FormatRing::new(4096, in_fmt, canonical()).unwrap();

        let ramp: Vec<i16> = (0..256).map(|i| (i * 64) as i16).collect();
        assert_eq!(writer.write_bytes(&i16_bytes(&ramp)), 512);

        let mut out = vec![0f32; 256];
        let got = reader.read_convert(&mut out);
        assert_eq!(got, 256);
        for (i, &v) in out.iter().enumerate() {
            let expected = (i as f32 * 64.0) / 32768.0;
            assert!((v - expected).abs() < 1e-6, "sample {i}: {v} vs {expected}");
        }
    }

    #[test]
    fn stereo_input_is_averaged_to_mono() {
        let in_fmt = AudioFormat::new(CANONICAL_SAMPLE_RATE, 2, SampleKind::Int16);
        let (mut writer, mut reader) = FormatRing::new(4096, in_fmt, canonical()).unwrap();

        // L = 8192, R = 16384 → mono = 12288 / 32768 = 0.375
        let frames: Vec<i16> = (0..64).flat_map(|_| [8192i16, 16384i16]).collect();
        writer.write_bytes(&i16_bytes(&frames));

        let mut out = vec![0f32; 64];
        assert_eq!(reader.read_convert(&mut out), 64);
        for &v in &out {
            assert!((v - 0.375).abs() < 1e-6);
        }
    }

    #[test]
    fn float_input_passes_through_untouched() {
        let in_fmt = AudioFormat::new(CANONICAL_SAMPLE_RATE, 1, SampleKind::Float32);
        let (mut writer, mut reader) = FormatRing::new(8192, in_fmt, canonical()).unwrap();

        let samples: Vec<f32> = (0..100).map(|i| (i as f32 - 50.0) * 0.01).collect();
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        writer.write_bytes(&bytes);

        let mut out = vec![0f32; 100];
        assert_eq!(reader.read_convert(&mut out), 100);
        assert_eq!(out, samples);
    }

    #[test]
    fn empty_ring_reads_zero_and_leaves_out_untouched() {
        let in_fmt = AudioFormat::new(CANONICAL_SAMPLE_RATE, 1, SampleKind::Int16);
        let (_writer, mut reader) = FormatRing::new(1024, in_fmt, canonical()).unwrap();

        let mut out = vec![0.5f32; 32];
        assert_eq!(reader.read_convert(&mut out), 0);
        assert!(out.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn successive_short_reads_preserve_the_stream() {
        let in_fmt = AudioFormat::new(CANONICAL_SAMPLE_RATE, 1, SampleKind::Int16);
        let (mut writer, mut reader) = FormatRing::new(8192, in_fmt, canonical()).unwrap();

        let ramp: Vec<i16> = (0..300).map(|i| i as i16).collect();
        writer.write_bytes(&i16_bytes(&ramp));

        let mut collected = Vec::new();
        let mut out = vec![0f32; 7]; // deliberately awkward size
        loop {
            let got = reader.read_convert(&mut out);
            if got == 0 {
                break;
            }
            collected.extend_from_slice(&out[..got]);
        }

        assert_eq!(collected.len(), 300);
        for (i, &v) in collected.iter().enumerate() {
            assert!((v - i as f32 / 32768.0).abs() < 1e-6);
        }
    }

    #[test]
    fn clear_drops_buffered_bytes_and_carry() {
        let in_fmt = AudioFormat::new(CANONICAL_SAMPLE_RATE, 1, SampleKind::Int16);
        let (mut writer, mut reader) = FormatRing::new(4096, in_fmt, canonical()).unwrap();

        writer.write_bytes(&i16_bytes(&vec![1000i16; 128]));
        reader.clear();

        let mut out = vec![0f32; 32];
        assert_eq!(reader.read_convert(&mut out), 0);

        // Data written after the clear is visible.
        writer.write_bytes(&i16_bytes(&vec![2000i16; 16]));
        assert_eq!(reader.read_convert(&mut out), 16);
        assert!((out[0] - 2000.0 / 32768.0).abs() < 1e-6);
    }

    #[test]
    fn resampling_path_produces_roughly_ratio_scaled_output() {
        let in_fmt = AudioFormat::new(44_100, 1, SampleKind::Int16);
        let (mut writer, mut reader) = FormatRing::new(1 << 16, in_fmt, canonical()).unwrap();

        // 44100 input frames ≈ 1 s → ≈ 48000 output frames.
        writer.write_bytes(&i16_bytes(&vec![4096i16; 44_100]));

        // A zero read can mean "resampler still accumulating", so only stop
        // after several consecutive empty reads.
        let mut total = 0usize;
        let mut zero_streak = 0;
        let mut out = vec![0f32; 960];
        while zero_streak < 4 {
            let got = reader.read_convert(&mut out);
            if got == 0 {
                zero_streak += 1;
            } else {
                zero_streak = 0;
                total += got;
            }
        }
        assert!(
            (total as isize - 48_000).unsigned_abs() < 2_000,
            "expected ≈48000 frames, got {total}"
        );
    }
}
