//! # Synthesis Collector
//!
//! Runs a blocking speech synthesizer on its own thread and gathers the audio
//! chunks it pushes through a bounded queue.
//!
//! ## Termination (whichever happens first):
//! 1. **Producer done**: the synthesizer returned and the queue drained
//! 2. **Stop signal**: someone else asked the job to stop
//! 3. **Deadline**: the collector sets the stop signal itself and gives up waiting
//!
//! Chunks collected before a stop or deadline are always kept. Only when no
//! chunk at all arrived does the configured fallback audio stand in, so the
//! pipeline still completes with something playable.

use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{FallbackConfig, SynthesisConfig};
use crate::error::RelayError;
use crate::pipeline::stages::{ChunkSender, SpeechSynthesizer, StopSignal, SynthesisRequest};

/// Peak amplitude of the fallback tone (half of full scale).
const TONE_AMPLITUDE: f32 = 16_383.0;

/// Audio used when synthesis yields nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackAudio {
    None,
    Tone {
        frequency_hz: f32,
        duration: Duration,
        sample_rate: u32,
    },
}

impl FallbackAudio {
    pub fn from_config(config: &FallbackConfig) -> Self {
        if !config.enabled {
            return FallbackAudio::None;
        }
        FallbackAudio::Tone {
            frequency_hz: config.frequency_hz,
            duration: Duration::from_millis(config.duration_ms),
            sample_rate: config.sample_rate,
        }
    }

    /// Render as 16-bit little-endian mono PCM.
    pub fn render(&self) -> Option<Vec<u8>> {
        match self {
            FallbackAudio::None => None,
            FallbackAudio::Tone { frequency_hz, duration, sample_rate } => {
                let count = (*sample_rate as u128 * duration.as_millis() / 1000) as usize;
                let mut pcm = Vec::with_capacity(count * 2);
                for i in 0..count {
                    let t = i as f32 / *sample_rate as f32;
                    let sample = (TONE_AMPLITUDE * (2.0 * PI * frequency_hz * t).sin()) as i16;
                    pcm.extend_from_slice(&sample.to_le_bytes());
                }
                Some(pcm)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SynthesisOutcome {
    /// Chunks in production order (or the single fallback chunk)
    pub chunks: Vec<Vec<u8>>,
    pub timed_out: bool,
    pub stopped: bool,
    pub used_fallback: bool,
    /// Error the synthesizer returned, if it finished with one
    pub producer_error: Option<RelayError>,
}

impl SynthesisOutcome {
    /// All collected audio as one byte sequence.
    pub fn audio(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisCollector {
    deadline: Duration,
    queue_capacity: usize,
    fallback: FallbackAudio,
}

impl SynthesisCollector {
    pub fn new(deadline: Duration, queue_capacity: usize, fallback: FallbackAudio) -> Self {
        Self {
            deadline,
            queue_capacity: queue_capacity.max(1),
            fallback,
        }
    }

    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self::new(
            config.deadline(),
            config.queue_capacity,
            FallbackAudio::from_config(&config.fallback),
        )
    }

    pub async fn collect(
        &self,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        request: SynthesisRequest,
        stop: StopSignal,
    ) -> SynthesisOutcome {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(self.queue_capacity);
        let sender = ChunkSender::new(tx);
        let producer_stop = stop.clone();
        let producer = tokio::task::spawn_blocking(move || {
            synthesizer.synthesize(&request, &sender, &producer_stop)
        });

        let mut outcome = SynthesisOutcome::default();
        let mut stop_rx = stop.subscribe();
        let deadline = tokio::time::sleep(self.deadline);
        tokio::pin!(deadline);
        let mut producer_finished = false;

        loop {
            if stop.is_set() {
                outcome.stopped = true;
                break;
            }
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => outcome.chunks.push(chunk),
                    None => {
                        producer_finished = true;
                        break;
                    }
                },
                _ = &mut deadline => {
                    outcome.timed_out = true;
                    break;
                }
                // Re-checked at the top of the loop
                _ = stop_rx.changed() => {}
            }
        }

        if producer_finished {
            outcome.producer_error = match producer.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(join_error) => Some(RelayError::stage("synthesis", join_error.to_string())),
            };
        } else {
            // Tell the producer to wind down, keep whatever is already queued
            stop.set();
            while let Ok(chunk) = rx.try_recv() {
                outcome.chunks.push(chunk);
            }
        }

        if outcome.timed_out {
            warn!(
                error = %RelayError::SynthesisTimeout { deadline_ms: self.deadline.as_millis() as u64 },
                chunks = outcome.chunks.len(),
                "Synthesis deadline reached, continuing with partial audio"
            );
        }
        if let Some(err) = &outcome.producer_error {
            warn!(error = %err, chunks = outcome.chunks.len(), "Synthesizer failed");
        }

        if outcome.chunks.is_empty() {
            if let Some(tone) = self.fallback.render() {
                debug!(bytes = tone.len(), "Using fallback audio");
                outcome.chunks.push(tone);
                outcome.used_fallback = true;
            }
        }

        outcome
    }
}
