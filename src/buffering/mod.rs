//! Lock-free SPSC byte rings between the driver callbacks and the merge
//! worker.
//!
//! Uses `ringbuf::HeapRb<u8>` whose `push_slice` is wait-free and
//! allocation-free, safe to call from the real-time audio callback. The
//! element type is raw bytes rather than samples because each ring stores
//! whatever interleaved format its stream was opened with (i16 or f32, mono
//! or stereo); decoding happens on the consumer side.
//!
//! Contract (shared with the consumer in [`convert`]):
//! - a write that does not fit drops the tail and reports how much it stored,
//! - a read returns `min(requested, available)` bytes,
//! - bytes come out as a prefix of the bytes that went in, in write order.

pub mod convert;
pub mod reference;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Type alias for the producer half — held by the audio callback thread.
pub type ByteRingProducer = ringbuf::HeapProd<u8>;

/// Type alias for the consumer half — held by the merge worker.
pub type ByteRingConsumer = ringbuf::HeapCons<u8>;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
///
/// Capacity is in bytes; callers size it as `bytes_per_second ×
/// ring_buffer_ms / 1000` for the stream format the producer writes.
pub fn create_byte_ring(capacity_bytes: usize) -> (ByteRingProducer, ByteRingConsumer) {
    HeapRb::<u8>::new(capacity_bytes.max(1)).split()
}
