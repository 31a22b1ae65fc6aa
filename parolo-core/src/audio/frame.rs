//! Fixed-duration PCM16 frames emitted by the capture source.

use std::time::Instant;

use crate::util::queue::DropOldestQueue;

/// One frame of mono PCM16LE audio at the pipeline sample rate.
///
/// `frame_index` increases strictly monotonically within a capture session
/// and resets to 0 when the source re-binds to a device. Consumers must
/// tolerate the reset; they will never see a gap inside one session.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Little-endian signed 16-bit samples.
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_index: u64,
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Number of samples in this frame.
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    /// Frame duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.sample_count() as f64 / self.sample_rate as f64
    }
}

/// Convert f32 samples in [-1, 1] to interleaved PCM16LE bytes.
pub fn f32_to_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode PCM16LE bytes back to i16 samples (local recognizers want i16).
pub fn pcm16le_to_i16(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Bounded frame queue between the capture thread and a recognizer backend.
/// Capacity 32; overflow drops the oldest frame (the queue counts drops).
pub type FrameQueue = DropOldestQueue<AudioFrame>;

/// Default frame queue capacity.
pub const FRAME_QUEUE_CAPACITY: usize = 32;
