//! # Pipeline Orchestrator
//!
//! Drives one job through the fixed stage sequence when the relay runs the
//! pipeline itself:
//!
//! ```text
//! AudioReceived → Preprocessed → Transcribed → Responded → SynthesisChunk* → Completed
//! ```
//!
//! Each transition is sent on the job's event channel as soon as it happens.
//! A recognition or response failure ends the job with a single `Error`;
//! synthesis trouble only degrades the audio (partial output or fallback).

use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::audio::processor::AudioProcessor;
use crate::audio::session::{lock, ConversationTurn, SharedHistory};
use crate::config::AppConfig;
use crate::pipeline::events::StageEvent;
use crate::pipeline::stages::{
    ResponseGenerator, SpeechRecognizer, SpeechSynthesizer, StopSignal, SynthesisRequest,
    UpsamplerFactory,
};
use crate::pipeline::synthesis::SynthesisCollector;
use crate::state::config_read;

/// The collaborators a local pipeline runs on.
#[derive(Clone)]
pub struct PipelineStages {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub responder: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub upsampler: UpsamplerFactory,
}

/// Everything one job needs from its session.
pub struct PipelineInput {
    pub audio: Vec<u8>,
    pub history: SharedHistory,
    pub speed: f32,
    pub stop: StopSignal,
}

/// Where a job's synthesis settings come from.
enum CollectorSettings {
    Fixed(SynthesisCollector),
    /// Re-read from the running config at the start of every job
    Live(Arc<RwLock<AppConfig>>),
}

pub struct PipelineOrchestrator {
    stages: PipelineStages,
    processor: AudioProcessor,
    settings: CollectorSettings,
}

impl PipelineOrchestrator {
    pub fn new(stages: PipelineStages, collector: SynthesisCollector) -> Self {
        Self {
            stages,
            processor: AudioProcessor::new(),
            settings: CollectorSettings::Fixed(collector),
        }
    }

    /// Follow the `synthesis` section of a config that may change at runtime.
    pub fn with_live_config(stages: PipelineStages, config: Arc<RwLock<AppConfig>>) -> Self {
        Self {
            stages,
            processor: AudioProcessor::new(),
            settings: CollectorSettings::Live(config),
        }
    }

    fn collector(&self) -> SynthesisCollector {
        match &self.settings {
            CollectorSettings::Fixed(collector) => collector.clone(),
            CollectorSettings::Live(config) => SynthesisCollector::from_config(&config_read(config).synthesis),
        }
    }

    /// Run one job to its terminal event.
    ///
    /// A closed `events` channel does not abort the run: the job still
    /// finishes (and updates history) with nobody listening.
    pub async fn run(&self, input: PipelineInput, events: &mpsc::Sender<StageEvent>) {
        let emit = |event: StageEvent| async move {
            let _ = events.send(event).await;
        };

        emit(StageEvent::AudioReceived { byte_length: input.audio.len() }).await;

        let audio = match self.processor.preprocess(&input.audio) {
            Ok(audio) => audio,
            Err(e) => return emit(StageEvent::error(e.to_string())).await,
        };
        emit(StageEvent::Preprocessed).await;

        let text = match self.stages.recognizer.transcribe(&audio).await {
            Ok(text) => text,
            Err(e) => return emit(StageEvent::error(e.to_string())).await,
        };
        debug!(chars = text.len(), "Transcription complete");
        emit(StageEvent::Transcribed { text: text.clone() }).await;

        let history_snapshot = lock(&input.history).clone();
        let reply = match self.stages.responder.respond(&text, &history_snapshot).await {
            Ok(reply) => reply,
            Err(e) => return emit(StageEvent::error(e.to_string())).await,
        };
        {
            let mut history = lock(&input.history);
            history.push(ConversationTurn::user(text));
            history.push(ConversationTurn::assistant(reply.clone()));
        }
        emit(StageEvent::Responded { text: reply.clone() }).await;

        let outcome = self
            .collector()
            .collect(
                Arc::clone(&self.stages.synthesizer),
                SynthesisRequest { text: reply.clone(), speed: input.speed },
                input.stop,
            )
            .await;

        let mut upsampler = (self.stages.upsampler)();
        let mut final_audio = Vec::new();
        for chunk in &outcome.chunks {
            let converted = upsampler.push(chunk);
            if !converted.is_empty() {
                final_audio.extend_from_slice(&converted);
                emit(StageEvent::SynthesisChunk { audio: converted }).await;
            }
        }
        // Always flushed, even after zero chunks
        let tail = upsampler.flush();
        if !tail.is_empty() {
            final_audio.extend_from_slice(&tail);
            emit(StageEvent::SynthesisChunk { audio: tail }).await;
        }

        info!(
            chunks = outcome.chunks.len(),
            timed_out = outcome.timed_out,
            fallback = outcome.used_fallback,
            bytes = final_audio.len(),
            "Pipeline complete"
        );
        emit(StageEvent::Completed { final_text: reply, final_audio }).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{RelayError, RelayResult};
    use crate::pipeline::stages::Upsampler;
    use crate::pipeline::synthesis::tests::ScriptedSynthesizer;
    use crate::pipeline::synthesis::FallbackAudio;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub(crate) struct FixedRecognizer(pub(crate) RelayResult<&'static str>);

    #[async_trait]
    impl SpeechRecognizer for FixedRecognizer {
        async fn transcribe(&self, _pcm: &[u8]) -> RelayResult<String> {
            match &self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(e) => Err(RelayError::stage("recognition", e.to_string())),
            }
        }
    }

    /// Replies "echo: <text>" and remembers how much history it saw.
    #[derive(Default)]
    pub(crate) struct EchoResponder {
        pub(crate) seen_history: AtomicUsize,
    }

    #[async_trait]
    impl ResponseGenerator for EchoResponder {
        async fn respond(&self, text: &str, history: &[ConversationTurn]) -> RelayResult<String> {
            self.seen_history.store(history.len(), Ordering::SeqCst);
            Ok(format!("echo: {}", text))
        }
    }

    /// Passes audio through unchanged and counts flushes.
    pub(crate) struct CountingUpsampler {
        flushes: Arc<AtomicUsize>,
    }

    impl Upsampler for CountingUpsampler {
        fn push(&mut self, pcm: &[u8]) -> Vec<u8> {
            pcm.to_vec()
        }

        fn flush(&mut self) -> Vec<u8> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    pub(crate) fn counting_factory(flushes: Arc<AtomicUsize>) -> UpsamplerFactory {
        Arc::new(move || {
            Box::new(CountingUpsampler { flushes: Arc::clone(&flushes) }) as Box<dyn Upsampler>
        })
    }

    fn orchestrator(
        recognizer: FixedRecognizer,
        synthesizer: ScriptedSynthesizer,
        flushes: Arc<AtomicUsize>,
        fallback: FallbackAudio,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            PipelineStages {
                recognizer: Arc::new(recognizer),
                responder: Arc::new(EchoResponder::default()),
                synthesizer: Arc::new(synthesizer),
                upsampler: counting_factory(flushes),
            },
            SynthesisCollector::new(Duration::from_millis(200), 4, fallback),
        )
    }

    fn input(history: SharedHistory) -> PipelineInput {
        PipelineInput {
            audio: vec![0, 1, 0, 2, 0, 3],
            history,
            speed: 1.0,
            stop: StopSignal::new(),
        }
    }

    async fn run_collect(orch: &PipelineOrchestrator, input: PipelineInput) -> Vec<StageEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        orch.run(input, &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_stage_order_and_history() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(
            FixedRecognizer(Ok("hi")),
            ScriptedSynthesizer::finishing(vec![vec![1, 1], vec![2, 2]]),
            Arc::clone(&flushes),
            FallbackAudio::None,
        );
        let history = SharedHistory::default();

        let events = run_collect(&orch, input(Arc::clone(&history))).await;

        assert_eq!(
            events,
            vec![
                StageEvent::AudioReceived { byte_length: 6 },
                StageEvent::Preprocessed,
                StageEvent::Transcribed { text: "hi".into() },
                StageEvent::Responded { text: "echo: hi".into() },
                StageEvent::SynthesisChunk { audio: vec![1, 1] },
                StageEvent::SynthesisChunk { audio: vec![2, 2] },
                StageEvent::Completed {
                    final_text: "echo: hi".into(),
                    final_audio: vec![1, 1, 2, 2],
                },
            ]
        );
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert_eq!(
            *lock(&history),
            vec![ConversationTurn::user("hi"), ConversationTurn::assistant("echo: hi")]
        );
    }

    #[tokio::test]
    async fn test_flush_called_once_with_zero_chunks() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(
            FixedRecognizer(Ok("hi")),
            ScriptedSynthesizer::finishing(Vec::new()),
            Arc::clone(&flushes),
            FallbackAudio::None,
        );

        let events = run_collect(&orch, input(SharedHistory::default())).await;

        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert!(matches!(events.last(), Some(StageEvent::Completed { final_audio, .. }) if final_audio.is_empty()));
        assert!(!events.iter().any(|e| matches!(e, StageEvent::SynthesisChunk { .. })));
    }

    #[tokio::test]
    async fn test_synthesis_timeout_still_completes() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(
            FixedRecognizer(Ok("hi")),
            ScriptedSynthesizer::stalling(vec![vec![4, 4]]),
            Arc::clone(&flushes),
            FallbackAudio::None,
        );

        let events = run_collect(&orch, input(SharedHistory::default())).await;

        let chunks = events
            .iter()
            .filter(|e| matches!(e, StageEvent::SynthesisChunk { .. }))
            .count();
        assert_eq!(chunks, 1);
        assert!(matches!(events.last(), Some(StageEvent::Completed { .. })));
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recognition_failure_ends_with_error() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(
            FixedRecognizer(Err(RelayError::backend("whisper down"))),
            ScriptedSynthesizer::finishing(Vec::new()),
            flushes,
            FallbackAudio::None,
        );
        let history = SharedHistory::default();

        let events = run_collect(&orch, input(Arc::clone(&history))).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], StageEvent::Error { .. }));
        assert!(lock(&history).is_empty());
    }

    #[tokio::test]
    async fn test_closed_channel_does_not_abort_job() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(
            FixedRecognizer(Ok("hi")),
            ScriptedSynthesizer::finishing(vec![vec![1, 1]]),
            Arc::clone(&flushes),
            FallbackAudio::None,
        );
        let history = SharedHistory::default();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        orch.run(input(Arc::clone(&history)), &tx).await;

        assert_eq!(lock(&history).len(), 2);
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }
}
