//! 2× linear upsampler (24kHz synthesis output → 48kHz client playback).
//!
//! Each input sample is emitted followed by the midpoint to the next one, so
//! the newest sample is always held back until its successor (or `flush`)
//! arrives. An odd trailing byte is carried to the next `push` as well.

use crate::audio::processor::encode_samples;
use crate::pipeline::stages::Upsampler;

#[derive(Debug, Default)]
pub struct LinearUpsampler {
    last_sample: Option<i16>,
    pending_byte: Option<u8>,
}

impl LinearUpsampler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Upsampler for LinearUpsampler {
    fn push(&mut self, pcm: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(pcm.len() + 1);
        if let Some(b) = self.pending_byte.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(pcm);
        if bytes.len() % 2 == 1 {
            self.pending_byte = bytes.pop();
        }

        let mut out = Vec::with_capacity(bytes.len());
        for pair in bytes.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            if let Some(prev) = self.last_sample {
                out.push(prev);
                out.push(((prev as i32 + sample as i32) / 2) as i16);
            }
            self.last_sample = Some(sample);
        }
        encode_samples(&out)
    }

    fn flush(&mut self) -> Vec<u8> {
        self.pending_byte = None;
        match self.last_sample.take() {
            Some(last) => encode_samples(&[last, last]),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::decode_samples;

    #[test]
    fn test_doubles_sample_count_across_pushes() {
        let mut up = LinearUpsampler::new();
        let first = up.push(&encode_samples(&[0, 100]));
        assert_eq!(decode_samples(&first), vec![0, 50]);

        let second = up.push(&encode_samples(&[200]));
        assert_eq!(decode_samples(&second), vec![100, 150]);

        assert_eq!(decode_samples(&up.flush()), vec![200, 200]);
    }

    #[test]
    fn test_odd_byte_carried_over() {
        let mut up = LinearUpsampler::new();
        let bytes = encode_samples(&[10, 20]);
        assert!(up.push(&bytes[..3]).is_empty());
        assert_eq!(decode_samples(&up.push(&bytes[3..])), vec![10, 15]);
    }

    #[test]
    fn test_flush_resets_state() {
        let mut up = LinearUpsampler::new();
        assert!(up.flush().is_empty());
        up.push(&encode_samples(&[5]));
        assert!(!up.flush().is_empty());
        assert!(up.flush().is_empty());
        // Nothing leaks into the next job
        assert!(up.push(&encode_samples(&[7])).is_empty());
    }
}
