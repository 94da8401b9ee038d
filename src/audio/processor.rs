//! # PCM Preprocessing
//!
//! Cleans up a dispatched utterance before it is handed to speech recognition
//! inside the in-process pipeline.
//!
//! ## Preprocessing Steps:
//! 1. **Decode**: little-endian 16-bit mono samples (a trailing odd byte is ignored)
//! 2. **Remove DC offset**: center audio around zero
//! 3. **Normalize volume**: scale quiet audio up towards a fixed peak
//! 4. **Smoothing**: 3-point moving average to take the edge off hiss
//!
//! The remote backends do their own preprocessing; this module is only used by
//! the local pipeline's `Preprocessed` stage.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{RelayError, RelayResult};

/// Peak amplitude normalization aims for, leaving some headroom below i16::MAX.
const TARGET_PEAK: i16 = 28_000;

/// Below this peak the audio is treated as silence and left unscaled.
const SILENCE_PEAK: i16 = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct AudioProcessor;

impl AudioProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Run the full preprocessing chain over raw PCM bytes.
    ///
    /// ## Errors:
    /// An utterance without a single complete sample is a `Stage` error; there
    /// is nothing meaningful to recognize.
    pub fn preprocess(&self, pcm: &[u8]) -> RelayResult<Vec<u8>> {
        let mut samples = decode_samples(pcm);
        if samples.is_empty() {
            return Err(RelayError::stage("preprocessing", "utterance contains no samples"));
        }

        let dc_offset = calculate_dc_offset(&samples);
        for sample in &mut samples {
            *sample = sample.saturating_sub(dc_offset);
        }
        normalize_volume(&mut samples);
        apply_smoothing(&mut samples);

        Ok(encode_samples(&samples))
    }
}

/// Decode little-endian i16 samples.
pub fn decode_samples(pcm: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(pcm);
    let mut samples = Vec::with_capacity(pcm.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Encode i16 samples back to little-endian bytes.
pub fn encode_samples(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

fn calculate_dc_offset(samples: &[i16]) -> i16 {
    if samples.is_empty() {
        return 0;
    }
    let sum: i64 = samples.iter().map(|&s| s as i64).sum();
    (sum / samples.len() as i64) as i16
}

fn normalize_volume(samples: &mut [i16]) {
    let max_abs = samples
        .iter()
        .map(|&s| s.saturating_abs())
        .max()
        .unwrap_or(0);

    // Silence stays silence; already-loud audio is not touched
    if max_abs < SILENCE_PEAK || max_abs >= TARGET_PEAK {
        return;
    }

    let scale = TARGET_PEAK as f32 / max_abs as f32;
    for sample in samples {
        let scaled = (*sample as f32 * scale) as i32;
        *sample = scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
}

fn apply_smoothing(samples: &mut [i16]) {
    if samples.len() < 3 {
        return;
    }
    let source = samples.to_vec();
    for i in 1..samples.len() - 1 {
        let avg = (source[i - 1] as i32 + source[i] as i32 + source[i + 1] as i32) / 3;
        samples[i] = avg as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_keeps_sample_count() {
        let samples: Vec<i16> = (0..200).map(|i| ((i as f32 * 0.3).sin() * 2_000.0) as i16).collect();
        let pcm = encode_samples(&samples);

        let processed = AudioProcessor::new().preprocess(&pcm).unwrap();
        assert_eq!(processed.len(), pcm.len());

        // Quiet audio gets louder
        let peak = decode_samples(&processed).iter().map(|s| s.saturating_abs()).max().unwrap();
        assert!(peak > 2_000);
    }

    #[test]
    fn test_dc_offset_removed() {
        let samples = vec![1_000i16; 64];
        let processed = AudioProcessor::new().preprocess(&encode_samples(&samples)).unwrap();
        assert!(decode_samples(&processed).iter().all(|&s| s == 0));
    }

    #[test]
    fn test_empty_audio_is_a_stage_error() {
        let err = AudioProcessor::new().preprocess(&[7]).unwrap_err();
        assert!(matches!(err, RelayError::Stage { stage: "preprocessing", .. }));
    }
}
