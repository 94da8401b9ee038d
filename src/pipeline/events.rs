//! # Stage Events
//!
//! The ordered progress notifications of one pipeline job and their JSON wire
//! form.
//!
//! ## Ordering Rules (enforced by [`PipelineJob`]):
//! - `AudioReceived` is always first (synthesized if a backend skips it)
//! - `Completed` or `Error` is always last and appears exactly once
//! - anything a backend sends after the terminal event is dropped
//!
//! ## Wire Format:
//! ```json
//! {"type": "speech_recognition", "status": "complete", "text": "hi"}
//! {"type": "tts_generation", "status": "streaming", "audio_data": "<base64>"}
//! {"type": "processing_complete", "status": "success", "final_text": "...", "final_audio": "<base64>"}
//! {"type": "error", "message": "backend stream timed out after 120000ms"}
//! ```
//! The same shape is used for events read back from a remote backend.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// One discrete, ordered progress notification of a pipeline job.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    AudioReceived { byte_length: usize },
    Preprocessed,
    Transcribed { text: String },
    Responded { text: String },
    SynthesisChunk { audio: Vec<u8> },
    Completed { final_text: String, final_audio: Vec<u8> },
    Error { message: String },
}

impl StageEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageEvent::Completed { .. } | StageEvent::Error { .. })
    }

    pub fn error(message: impl Into<String>) -> Self {
        StageEvent::Error { message: message.into() }
    }
}

/// Reply to a forwarded control message.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlReply {
    pub status: String,
    pub message: String,
}

/// Everything a backend can yield for a job.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Stage(StageEvent),
    Control(ControlReply),
}

/// Outbound (and remote inbound) event message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AudioReceived {
        #[serde(default)]
        status: String,
        audio_length: usize,
    },
    AudioPreprocessing {
        #[serde(default)]
        status: String,
        #[serde(default)]
        message: String,
    },
    SpeechRecognition {
        #[serde(default)]
        status: String,
        text: String,
    },
    LlmResponse {
        #[serde(default)]
        status: String,
        text: String,
    },
    TtsGeneration {
        #[serde(default)]
        status: String,
        audio_data: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        text: String,
    },
    ProcessingComplete {
        #[serde(default)]
        status: String,
        final_text: String,
        #[serde(default)]
        final_audio: String,
    },
    ControlResponse {
        #[serde(default)]
        status: String,
        message: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    /// Message type discriminator as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AudioReceived { .. } => "audio_received",
            ServerMessage::AudioPreprocessing { .. } => "audio_preprocessing",
            ServerMessage::SpeechRecognition { .. } => "speech_recognition",
            ServerMessage::LlmResponse { .. } => "llm_response",
            ServerMessage::TtsGeneration { .. } => "tts_generation",
            ServerMessage::ProcessingComplete { .. } => "processing_complete",
            ServerMessage::ControlResponse { .. } => "control_response",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Interpret a message produced by a remote backend.
    pub fn into_backend_event(self) -> RelayResult<BackendEvent> {
        let stage = match self {
            ServerMessage::AudioReceived { audio_length, .. } => StageEvent::AudioReceived {
                byte_length: audio_length,
            },
            ServerMessage::AudioPreprocessing { .. } => StageEvent::Preprocessed,
            ServerMessage::SpeechRecognition { text, .. } => StageEvent::Transcribed { text },
            ServerMessage::LlmResponse { text, .. } => StageEvent::Responded { text },
            ServerMessage::TtsGeneration { audio_data, .. } => StageEvent::SynthesisChunk {
                audio: decode_audio(&audio_data)?,
            },
            ServerMessage::ProcessingComplete { final_text, final_audio, .. } => StageEvent::Completed {
                final_text,
                final_audio: decode_audio(&final_audio)?,
            },
            ServerMessage::Error { message } => StageEvent::Error { message },
            ServerMessage::ControlResponse { status, message } => {
                return Ok(BackendEvent::Control(ControlReply { status, message }));
            }
        };
        Ok(BackendEvent::Stage(stage))
    }
}

fn decode_audio(encoded: &str) -> RelayResult<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| RelayError::backend(format!("invalid base64 audio from backend: {}", e)))
}

impl From<&StageEvent> for ServerMessage {
    fn from(event: &StageEvent) -> Self {
        match event {
            StageEvent::AudioReceived { byte_length } => ServerMessage::AudioReceived {
                status: "processing".to_string(),
                audio_length: *byte_length,
            },
            StageEvent::Preprocessed => ServerMessage::AudioPreprocessing {
                status: "complete".to_string(),
                message: "Audio preprocessing complete".to_string(),
            },
            StageEvent::Transcribed { text } => ServerMessage::SpeechRecognition {
                status: "complete".to_string(),
                text: text.clone(),
            },
            StageEvent::Responded { text } => ServerMessage::LlmResponse {
                status: "complete".to_string(),
                text: text.clone(),
            },
            StageEvent::SynthesisChunk { audio } => ServerMessage::TtsGeneration {
                status: "streaming".to_string(),
                audio_data: STANDARD.encode(audio),
                text: String::new(),
            },
            StageEvent::Completed { final_text, final_audio } => ServerMessage::ProcessingComplete {
                status: "success".to_string(),
                final_text: final_text.clone(),
                final_audio: STANDARD.encode(final_audio),
            },
            StageEvent::Error { message } => ServerMessage::Error { message: message.clone() },
        }
    }
}

impl From<&ControlReply> for ServerMessage {
    fn from(reply: &ControlReply) -> Self {
        ServerMessage::ControlResponse {
            status: reply.status.clone(),
            message: reply.message.clone(),
        }
    }
}

/// Client-facing outbound channel of one session.
///
/// `deliver` returns `false` when the client is gone; the caller drops the
/// rest of the job's output silently.
pub trait EventSink: Send + Sync {
    fn deliver(&self, message: ServerMessage) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Streaming,
    Complete,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed | JobState::TimedOut)
    }
}

/// One dispatch, from submission to its terminal event.
///
/// Every event destined for the client passes through [`record`](Self::record),
/// which is what keeps the ordering rules true no matter what the backend does.
#[derive(Debug)]
pub struct PipelineJob {
    pub job_id: String,
    pub session_id: String,
    audio_len: usize,
    state: JobState,
    stage_events: Vec<StageEvent>,
}

impl PipelineJob {
    pub fn new(job_id: impl Into<String>, session_id: impl Into<String>, audio_len: usize) -> Self {
        Self {
            job_id: job_id.into(),
            session_id: session_id.into(),
            audio_len,
            state: JobState::Submitted,
            stage_events: Vec::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn events(&self) -> &[StageEvent] {
        &self.stage_events
    }

    /// Accept an event from the backend and return what should be forwarded.
    pub fn record(&mut self, event: StageEvent) -> Vec<StageEvent> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(2);
        if self.stage_events.is_empty() && !matches!(event, StageEvent::AudioReceived { .. }) {
            out.push(StageEvent::AudioReceived { byte_length: self.audio_len });
        }

        self.state = match &event {
            StageEvent::Completed { .. } => JobState::Complete,
            StageEvent::Error { .. } => JobState::Failed,
            _ => JobState::Streaming,
        };
        out.push(event);

        self.stage_events.extend(out.iter().cloned());
        out
    }

    /// Close the job because the bridge failed.
    pub fn fail(&mut self, err: &RelayError) -> Vec<StageEvent> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        let out = self.record(StageEvent::error(err.to_string()));
        if err.is_timeout() {
            self.state = JobState::TimedOut;
        }
        out
    }

    /// The backend stream ended. Closes the job if no terminal event arrived.
    pub fn finish(&mut self) -> Vec<StageEvent> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.fail(&RelayError::backend("backend stream ended without a terminal event"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::BackendPhase;
    use std::sync::Mutex;

    /// Sink that keeps every delivered message.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        messages: Mutex<Vec<ServerMessage>>,
    }

    impl RecordingSink {
        pub(crate) fn messages(&self) -> Vec<ServerMessage> {
            self.messages.lock().unwrap().clone()
        }

        pub(crate) fn kinds(&self) -> Vec<&'static str> {
            self.messages().iter().map(|m| m.kind()).collect()
        }
    }

    impl EventSink for RecordingSink {
        fn deliver(&self, message: ServerMessage) -> bool {
            self.messages.lock().unwrap().push(message);
            true
        }
    }

    #[test]
    fn test_wire_format() {
        let msg = ServerMessage::from(&StageEvent::Transcribed { text: "hi".into() });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "speech_recognition");
        assert_eq!(json["text"], "hi");

        let msg = ServerMessage::from(&StageEvent::SynthesisChunk { audio: vec![1, 2, 3] });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "tts_generation");
        assert_eq!(json["audio_data"], "AQID");
        assert!(json.get("text").is_none());
    }

    #[test]
    fn test_parse_remote_events() {
        let raw = serde_json::json!({
            "type": "processing_complete",
            "status": "success",
            "final_text": "hello",
            "final_audio": "AQID"
        });
        let msg: ServerMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            msg.into_backend_event().unwrap(),
            BackendEvent::Stage(StageEvent::Completed {
                final_text: "hello".into(),
                final_audio: vec![1, 2, 3],
            })
        );

        let raw = serde_json::json!({"type": "control_response", "status": "success", "message": "History cleared"});
        let msg: ServerMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(msg.into_backend_event().unwrap(), BackendEvent::Control(_)));

        let raw = serde_json::json!({"type": "tts_generation", "audio_data": "not base64!"});
        let msg: ServerMessage = serde_json::from_value(raw).unwrap();
        assert!(msg.into_backend_event().is_err());
    }

    #[test]
    fn test_job_prepends_audio_received() {
        let mut job = PipelineJob::new("job", "client", 4096);
        let out = job.record(StageEvent::Transcribed { text: "hi".into() });
        assert_eq!(
            out,
            vec![
                StageEvent::AudioReceived { byte_length: 4096 },
                StageEvent::Transcribed { text: "hi".into() },
            ]
        );
        assert_eq!(job.state(), JobState::Streaming);
    }

    #[test]
    fn test_job_drops_events_after_terminal() {
        let mut job = PipelineJob::new("job", "client", 10);
        job.record(StageEvent::AudioReceived { byte_length: 10 });
        job.record(StageEvent::Completed { final_text: "x".into(), final_audio: vec![] });
        assert_eq!(job.state(), JobState::Complete);

        assert!(job.record(StageEvent::Responded { text: "late".into() }).is_empty());
        assert!(job.finish().is_empty());
        assert!(job.fail(&RelayError::backend("late")).is_empty());
        assert_eq!(job.events().len(), 2);
    }

    #[test]
    fn test_timeout_marks_job_timed_out() {
        let mut job = PipelineJob::new("job", "client", 10);
        let out = job.fail(&RelayError::BackendTimeout { phase: BackendPhase::Submit, elapsed_ms: 5 });
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], StageEvent::Error { .. }));
        assert_eq!(job.state(), JobState::TimedOut);
    }

    #[test]
    fn test_stream_without_terminal_event_fails_once() {
        let mut job = PipelineJob::new("job", "client", 10);
        job.record(StageEvent::AudioReceived { byte_length: 10 });
        let out = job.finish();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_terminal());
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.finish().is_empty());
    }
}
