//! In-process backend: runs the pipeline orchestrator for every audio job and
//! answers control messages itself.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::backend::workers::{LlmWorker, TtsWorker, WhisperWorker, WorkerClient};
use crate::backend::{
    stream_common, BackendBridge, BackendRequest, ControlMessage, EventStream, JobHandle, JobSource,
};
use crate::config::AppConfig;
use crate::error::RelayResult;
use crate::pipeline::events::{BackendEvent, ControlReply};
use crate::pipeline::orchestrator::{PipelineInput, PipelineOrchestrator, PipelineStages};
use crate::pipeline::stages::Upsampler;
use crate::pipeline::upsample::LinearUpsampler;
use crate::state::config_read;

/// Capacity of a job's event channel.
const EVENT_QUEUE: usize = 64;

pub struct LocalBackend {
    orchestrator: Arc<PipelineOrchestrator>,
}

impl LocalBackend {
    pub fn new(orchestrator: PipelineOrchestrator) -> Self {
        Self { orchestrator: Arc::new(orchestrator) }
    }

    /// Wire the orchestrator to the configured stage workers.
    ///
    /// Worker endpoints are fixed at startup; synthesis deadline and fallback
    /// follow `config` for every job.
    pub fn from_config(http: reqwest::Client, shared: Arc<RwLock<AppConfig>>) -> Self {
        let config = config_read(&shared).clone();
        let backend = &config.backend;
        let client = Arc::new(WorkerClient::new(http, backend.api_key.clone(), backend.worker_timeout()));

        let stages = PipelineStages {
            recognizer: Arc::new(WhisperWorker::new(Arc::clone(&client), backend.workers.recognition.clone())),
            responder: Arc::new(LlmWorker::new(Arc::clone(&client), backend.workers.response.clone())),
            synthesizer: Arc::new(TtsWorker::new(
                client,
                backend.workers.synthesis.clone(),
                config.synthesis.chunk_bytes,
            )),
            upsampler: Arc::new(|| Box::new(LinearUpsampler::new()) as Box<dyn Upsampler>),
        };

        Self::new(PipelineOrchestrator::with_live_config(stages, shared))
    }
}

/// The reply a control message gets.
pub fn control_reply(message: &ControlMessage) -> ControlReply {
    let text = match message {
        ControlMessage::ClearHistory => "History cleared".to_string(),
        ControlMessage::SetSpeed { speed } => format!("Speed set to {:?}", speed),
        other => format!("Control message {} processed", other.kind()),
    };
    ControlReply {
        status: "success".to_string(),
        message: text,
    }
}

#[async_trait]
impl BackendBridge for LocalBackend {
    async fn submit(&self, request: BackendRequest) -> RelayResult<JobHandle> {
        let job_id = request.job_id().to_string();
        let session_id = request.session_id().to_string();

        let source = match request {
            BackendRequest::Control(control) => {
                let mut events = VecDeque::new();
                events.push_back(BackendEvent::Control(control_reply(&control.message)));
                JobSource::Buffered(events)
            }
            BackendRequest::Audio(dispatch) => {
                let (tx, rx) = mpsc::channel(EVENT_QUEUE);
                let orchestrator = Arc::clone(&self.orchestrator);
                let input = PipelineInput {
                    audio: dispatch.audio,
                    history: dispatch.history,
                    speed: dispatch.speed,
                    stop: dispatch.stop,
                };

                tokio::spawn(async move {
                    let (stage_tx, mut stage_rx) = mpsc::channel(EVENT_QUEUE);
                    let run = async move {
                        orchestrator.run(input, &stage_tx).await;
                    };
                    let forward = async move {
                        while let Some(event) = stage_rx.recv().await {
                            // Keep draining so the run never blocks on a full queue
                            let _ = tx.send(Ok(BackendEvent::Stage(event))).await;
                        }
                    };
                    tokio::join!(run, forward);
                });

                JobSource::Channel(rx)
            }
        };

        Ok(JobHandle { job_id, session_id, source })
    }

    fn stream_events(&self, handle: JobHandle) -> EventStream {
        stream_common(handle.source).unwrap_or_else(|_| stream::empty().boxed())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ControlRequest, DispatchRequest};
    use crate::pipeline::events::StageEvent;
    use crate::pipeline::orchestrator::tests::{counting_factory, EchoResponder, FixedRecognizer};
    use crate::pipeline::stages::StopSignal;
    use crate::pipeline::synthesis::tests::ScriptedSynthesizer;
    use crate::pipeline::synthesis::{FallbackAudio, SynthesisCollector};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn stages(synthesizer: ScriptedSynthesizer) -> PipelineStages {
        PipelineStages {
            recognizer: Arc::new(FixedRecognizer(Ok("hi"))),
            responder: Arc::new(EchoResponder::default()),
            synthesizer: Arc::new(synthesizer),
            upsampler: counting_factory(Arc::new(AtomicUsize::new(0))),
        }
    }

    fn backend() -> LocalBackend {
        LocalBackend::new(PipelineOrchestrator::new(
            stages(ScriptedSynthesizer::finishing(vec![vec![1, 2]])),
            SynthesisCollector::new(Duration::from_secs(1), 4, FallbackAudio::None),
        ))
    }

    fn audio_request(job_id: &str, stop: StopSignal) -> BackendRequest {
        BackendRequest::Audio(DispatchRequest {
            session_id: "client_1".into(),
            job_id: job_id.into(),
            audio: vec![0, 1, 0, 1],
            message_type: "audio_batch",
            tts_playing: false,
            timestamp: 0,
            speed: 1.0,
            history: Default::default(),
            stop,
        })
    }

    async fn run_job(backend: &LocalBackend, job_id: &str) -> Vec<StageEvent> {
        let handle = backend.submit(audio_request(job_id, StopSignal::new())).await.unwrap();
        backend
            .stream_events(handle)
            .map(|e| match e.unwrap() {
                BackendEvent::Stage(stage) => stage,
                other => panic!("unexpected {:?}", other),
            })
            .collect()
            .await
    }

    fn chunk_count(events: &[StageEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, StageEvent::SynthesisChunk { .. }))
            .count()
    }

    #[test]
    fn test_control_reply_texts() {
        assert_eq!(control_reply(&ControlMessage::ClearHistory).message, "History cleared");
        assert_eq!(control_reply(&ControlMessage::SetSpeed { speed: 1.5 }).message, "Speed set to 1.5");
        assert_eq!(control_reply(&ControlMessage::SetSpeed { speed: 1.0 }).message, "Speed set to 1.0");
        assert_eq!(
            control_reply(&ControlMessage::TtsStart).message,
            "Control message tts_start processed"
        );
    }

    #[tokio::test]
    async fn test_audio_job_streams_pipeline_events() {
        let stages = run_job(&backend(), "job-1").await;

        assert_eq!(stages.first(), Some(&StageEvent::AudioReceived { byte_length: 4 }));
        assert!(matches!(stages.last(), Some(StageEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_synthesis_settings_follow_config_updates() {
        let config = Arc::new(RwLock::new(AppConfig::default()));
        let backend = LocalBackend::new(PipelineOrchestrator::with_live_config(
            stages(ScriptedSynthesizer::finishing(Vec::new())),
            Arc::clone(&config),
        ));

        // Fallback tone is on by default
        assert_eq!(chunk_count(&run_job(&backend, "job-1").await), 1);

        config
            .write()
            .unwrap()
            .update_from_json(r#"{"synthesis":{"fallback":{"enabled":false}}}"#)
            .unwrap();

        let events = run_job(&backend, "job-2").await;
        assert_eq!(chunk_count(&events), 0);
        assert!(matches!(events.last(), Some(StageEvent::Completed { final_audio, .. }) if final_audio.is_empty()));
    }

    #[tokio::test]
    async fn test_stop_signal_ends_synthesis_early() {
        let backend = LocalBackend::new(PipelineOrchestrator::new(
            stages(ScriptedSynthesizer::stalling(vec![vec![7, 7]])),
            SynthesisCollector::new(Duration::from_secs(30), 4, FallbackAudio::None),
        ));
        let stop = StopSignal::new();
        let handle = backend.submit(audio_request("job-1", stop.clone())).await.unwrap();

        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.set();
        });

        let events: Vec<_> = tokio::time::timeout(
            Duration::from_secs(5),
            backend.stream_events(handle).collect::<Vec<_>>(),
        )
        .await
        .expect("job should end once stopped");

        assert!(matches!(
            events.last(),
            Some(Ok(BackendEvent::Stage(StageEvent::Completed { final_audio, .. }))) if final_audio == &vec![7, 7]
        ));
    }

    #[tokio::test]
    async fn test_control_job_yields_single_reply() {
        let backend = backend();
        let handle = backend
            .submit(BackendRequest::Control(ControlRequest {
                session_id: "client_1".into(),
                job_id: "job-2".into(),
                message: ControlMessage::ClearHistory,
            }))
            .await
            .unwrap();

        let events: Vec<_> = backend.stream_events(handle).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(BackendEvent::Control(reply)) if reply.message == "History cleared"));
    }
}
