//! Lock-free SPSC ring buffers for audio samples.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides wait-free `push_slice` /
//! `pop_slice` safe to call from the real-time device callbacks. Two rings
//! exist per call: one from the microphone callback into the capture
//! pipeline, one from the playback driver into the output callback.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Producer};

/// Producer half of a sample ring — held by whichever side writes samples.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half of a sample ring — held by whichever side drains samples.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Capture ring capacity: 2^21 = 2 097 152 f32 samples ≈ 43.7 s at 48 kHz.
/// Covers the 30 s max recording plus headroom while a turn is being sent.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 21;

/// Playback ring capacity: 2^20 f32 samples ≈ 21.8 s at 48 kHz.
/// Server audio arrives in sub-second windows; this absorbs bursts without
/// ever forcing the scheduler to block.
pub const PLAYBACK_RING_CAPACITY: usize = 1 << 20;

/// Create the microphone-to-pipeline ring.
pub fn create_capture_ring() -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(CAPTURE_RING_CAPACITY).split()
}

/// Create the scheduler-to-output-device ring.
pub fn create_playback_ring() -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(PLAYBACK_RING_CAPACITY).split()
}
