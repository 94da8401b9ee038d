//! # Backend Bridge
//!
//! The seam between the relay and whatever runs the inference pipeline.
//!
//! ## Contract:
//! - `submit` starts a job and returns a [`JobHandle`] (bounded by the submit timeout)
//! - `stream_events` turns that handle into a single-pass stream of events
//!   (bounded by the independent stream timeout)
//! - a transport failure or timeout is yielded as one `Err` item and ends the
//!   stream; nothing is retried here
//!
//! ## Implementations:
//! - **remote**: job API over HTTP, blocking (`/runsync`) or submit-then-stream
//!   (`/run` + `/stream/{id}`)
//! - **local**: runs the pipeline orchestrator in-process, with per-stage workers

pub mod local;
pub mod remote;
pub mod workers;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::audio::session::SharedHistory;
use crate::error::RelayResult;
use crate::pipeline::events::BackendEvent;
use crate::pipeline::stages::StopSignal;

/// Audio dispatched for one pipeline job.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub session_id: String,
    pub job_id: String,
    pub audio: Vec<u8>,
    /// `audio_batch` or `audio_batch_timeout`
    pub message_type: &'static str,
    pub tts_playing: bool,
    pub timestamp: u32,
    pub speed: f32,
    /// Conversation so far; the local backend appends to it on success
    pub history: SharedHistory,
    /// Raised when the client goes away; only the local backend acts on it
    pub stop: StopSignal,
}

/// Client control message, as received on the socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    TtsStart,
    TtsStop,
    ClearHistory,
    SetSpeed {
        #[serde(default = "default_speed")]
        speed: f32,
    },
}

fn default_speed() -> f32 {
    1.0
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::TtsStart => "tts_start",
            ControlMessage::TtsStop => "tts_stop",
            ControlMessage::ClearHistory => "clear_history",
            ControlMessage::SetSpeed { .. } => "set_speed",
        }
    }

    /// JSON form forwarded to the backend.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ControlMessage::SetSpeed { speed } => serde_json::json!({"type": self.kind(), "speed": speed}),
            _ => serde_json::json!({"type": self.kind()}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub session_id: String,
    pub job_id: String,
    pub message: ControlMessage,
}

#[derive(Debug, Clone)]
pub enum BackendRequest {
    Audio(DispatchRequest),
    Control(ControlRequest),
}

impl BackendRequest {
    pub fn session_id(&self) -> &str {
        match self {
            BackendRequest::Audio(r) => &r.session_id,
            BackendRequest::Control(r) => &r.session_id,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            BackendRequest::Audio(r) => &r.job_id,
            BackendRequest::Control(r) => &r.job_id,
        }
    }

    /// Submission payload in the job API's `{"input": {...}}` envelope.
    pub fn payload(&self) -> serde_json::Value {
        use base64::{engine::general_purpose::STANDARD, Engine as _};

        match self {
            BackendRequest::Audio(r) => serde_json::json!({
                "input": {
                    "audio_data": STANDARD.encode(&r.audio),
                    "client_id": r.session_id,
                    "message_type": r.message_type,
                    "audio_length": r.audio.len(),
                    "tts_playing": r.tts_playing,
                    "timestamp": r.timestamp,
                }
            }),
            BackendRequest::Control(r) => serde_json::json!({
                "input": {
                    "message": r.message.to_json(),
                    "client_id": r.session_id,
                    "message_type": "control",
                }
            }),
        }
    }
}

/// Where a job's events come from.
pub enum JobSource {
    /// Result already complete (blocking submit)
    Buffered(VecDeque<BackendEvent>),
    /// Remote job still running; poll it by id
    Remote(String),
    /// In-process producer
    Channel(mpsc::Receiver<RelayResult<BackendEvent>>),
}

/// A submitted job. Not `Clone`: a job's events can be streamed only once.
pub struct JobHandle {
    pub job_id: String,
    pub session_id: String,
    pub source: JobSource,
}

pub type EventStream = BoxStream<'static, RelayResult<BackendEvent>>;

#[async_trait]
pub trait BackendBridge: Send + Sync {
    async fn submit(&self, request: BackendRequest) -> RelayResult<JobHandle>;

    fn stream_events(&self, handle: JobHandle) -> EventStream;

    fn name(&self) -> &'static str;
}

/// Stream the sources every bridge shares. A remote job id is handed back
/// to the bridge that knows how to poll it.
pub(crate) fn stream_common(source: JobSource) -> Result<EventStream, String> {
    match source {
        JobSource::Buffered(events) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
        JobSource::Channel(rx) => Ok(ReceiverStream::new(rx).boxed()),
        JobSource::Remote(id) => Err(id),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::pipeline::events::StageEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Backend double that answers every submission with a fixed script.
    pub(crate) struct ScriptedBackend {
        pub(crate) script: Vec<RelayResult<BackendEvent>>,
        pub(crate) submit_error: Mutex<Option<RelayError>>,
        /// Delay before the stream ends, to keep a job in flight
        pub(crate) hold: Duration,
        pub(crate) submissions: Mutex<Vec<BackendRequest>>,
        pub(crate) active: AtomicUsize,
        pub(crate) max_active: AtomicUsize,
    }

    impl ScriptedBackend {
        pub(crate) fn new(script: Vec<RelayResult<BackendEvent>>) -> Self {
            Self {
                script,
                submit_error: Mutex::new(None),
                hold: Duration::ZERO,
                submissions: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        pub(crate) fn completing() -> Self {
            Self::new(vec![
                Ok(BackendEvent::Stage(StageEvent::AudioReceived { byte_length: 0 })),
                Ok(BackendEvent::Stage(StageEvent::Preprocessed)),
                Ok(BackendEvent::Stage(StageEvent::Transcribed { text: "hi".into() })),
                Ok(BackendEvent::Stage(StageEvent::Responded { text: "hello".into() })),
                Ok(BackendEvent::Stage(StageEvent::Completed {
                    final_text: "hello".into(),
                    final_audio: vec![0, 1],
                })),
            ])
        }

        pub(crate) fn submissions(&self) -> Vec<BackendRequest> {
            self.submissions.lock().unwrap().clone()
        }
    }

    fn clone_result(r: &RelayResult<BackendEvent>) -> RelayResult<BackendEvent> {
        match r {
            Ok(ev) => Ok(ev.clone()),
            Err(e) => Err(RelayError::backend(e.to_string())),
        }
    }

    #[async_trait]
    impl BackendBridge for Arc<ScriptedBackend> {
        async fn submit(&self, request: BackendRequest) -> RelayResult<JobHandle> {
            self.submissions.lock().unwrap().push(request.clone());
            if let Some(err) = self.submit_error.lock().unwrap().take() {
                return Err(err);
            }

            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            let (tx, rx) = mpsc::channel(16);
            let script: Vec<_> = self.script.iter().map(clone_result).collect();
            let hold = self.hold;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(hold).await;
                for item in script {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                this.active.fetch_sub(1, Ordering::SeqCst);
            });

            Ok(JobHandle {
                job_id: request.job_id().to_string(),
                session_id: request.session_id().to_string(),
                source: JobSource::Channel(rx),
            })
        }

        fn stream_events(&self, handle: JobHandle) -> EventStream {
            stream_common(handle.source).unwrap_or_else(|_| stream::empty().boxed())
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[test]
    fn test_audio_payload_shape() {
        let request = BackendRequest::Audio(DispatchRequest {
            session_id: "client_1".into(),
            job_id: "job".into(),
            audio: vec![1, 2, 3],
            message_type: "audio_batch_timeout",
            tts_playing: true,
            timestamp: 99,
            speed: 1.0,
            history: Default::default(),
            stop: StopSignal::new(),
        });
        let payload = request.payload();
        let input = &payload["input"];
        assert_eq!(input["audio_data"], "AQID");
        assert_eq!(input["client_id"], "client_1");
        assert_eq!(input["message_type"], "audio_batch_timeout");
        assert_eq!(input["audio_length"], 3);
        assert_eq!(input["tts_playing"], true);
        assert_eq!(input["timestamp"], 99);
    }

    #[test]
    fn test_control_payload_shape() {
        let request = BackendRequest::Control(ControlRequest {
            session_id: "client_1".into(),
            job_id: "job".into(),
            message: ControlMessage::SetSpeed { speed: 1.5 },
        });
        let payload = request.payload();
        assert_eq!(payload["input"]["message_type"], "control");
        assert_eq!(payload["input"]["message"]["type"], "set_speed");
        assert_eq!(payload["input"]["message"]["speed"], 1.5);
    }

    #[test]
    fn test_control_message_parsing() {
        let msg: ControlMessage = serde_json::from_str(r#"{"type":"set_speed"}"#).unwrap();
        assert_eq!(msg, ControlMessage::SetSpeed { speed: 1.0 });
        let msg: ControlMessage = serde_json::from_str(r#"{"type":"tts_start"}"#).unwrap();
        assert_eq!(msg, ControlMessage::TtsStart);
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"dance"}"#).is_err());
    }
}
