//! # Session Audio Buffer
//!
//! Accumulates raw PCM payload bytes between dispatches.
//!
//! ## Key Features:
//! - **Append-only between dispatches**: frames are appended in arrival order
//! - **Take-and-clear**: a dispatch moves the whole content out in one step
//! - **Hard cap**: if a backend stalls for a long time the buffer keeps the most
//!   recent `max_bytes` and drops the oldest audio, the same sliding-window
//!   behaviour a circular buffer gives

use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug)]
pub struct AudioBuffer {
    bytes: VecDeque<u8>,
    max_bytes: usize,
    dropped_bytes: usize,
}

impl AudioBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            max_bytes,
            dropped_bytes: 0,
        }
    }

    /// Append a frame payload.
    ///
    /// Returns the number of old bytes discarded to respect the cap (usually 0).
    pub fn append(&mut self, payload: &[u8]) -> usize {
        self.bytes.extend(payload.iter().copied());

        let overflow = self.bytes.len().saturating_sub(self.max_bytes);
        if overflow > 0 {
            // Keep sample alignment: drop an even number of bytes
            let overflow = overflow + (overflow % 2);
            let overflow = overflow.min(self.bytes.len());
            self.bytes.drain(..overflow);
            self.dropped_bytes += overflow;
            warn!(
                dropped = overflow,
                cap = self.max_bytes,
                "Audio buffer cap reached, discarding oldest audio"
            );
            return overflow;
        }
        0
    }

    /// Move the buffered audio out, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<u8> {
        let taken: Vec<u8> = self.bytes.drain(..).collect();
        taken
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Total bytes discarded by the cap over the buffer's lifetime.
    pub fn dropped_bytes(&self) -> usize {
        self.dropped_bytes
    }

    /// Resize the cap (runtime config updates). Takes effect on the next append.
    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
    }

    /// Duration of buffered 16-bit mono audio at the given sample rate.
    pub fn duration_seconds(&self, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        (self.bytes.len() / 2) as f64 / sample_rate as f64
    }
}
