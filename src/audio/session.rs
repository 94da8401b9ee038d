//! # Client Session Management
//!
//! One `ClientSession` exists per live socket connection. It owns the audio
//! buffer, the client's playback flags, the dispatch bookkeeping and the
//! conversation history.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: connected, nothing buffered
//! 2. **Buffering**: audio accumulating, no job outstanding
//! 3. **AwaitingResult**: a dispatch is in flight; new audio keeps buffering
//!
//! Closing the connection removes the session. Its buffer is discarded, not
//! flushed. Any in-flight job is told to stop synthesizing and finishes on
//! its own with nobody listening.
//!
//! ## Thread Safety:
//! The store is an `RwLock<HashMap<..>>` of `Arc<Mutex<ClientSession>>`. The
//! per-connection actor and the background sweep both go through the
//! per-session mutex, so every mutation of a session is serialized. Nothing
//! awaits while holding a session lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use crate::audio::buffer::AudioBuffer;
use crate::audio::frame::AudioFrame;
use crate::dispatch::policy::DispatchInputs;
use crate::error::{RelayError, RelayResult};
use crate::pipeline::events::EventSink;
use crate::pipeline::stages::StopSignal;

/// Where a session is in its buffer/dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Buffering,
    AwaitingResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Conversation history shared between a session and the pipeline job
/// currently answering it.
pub type SharedHistory = Arc<Mutex<Vec<ConversationTurn>>>;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Audio taken out of a session for one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchTake {
    pub job_id: String,
    pub audio: Vec<u8>,
    pub tts_playing: bool,
    pub timestamp: u32,
    pub speed: f32,
    pub history: SharedHistory,
    /// Set when the session goes away before the job ends
    pub stop: StopSignal,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionStats {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub dispatches: u64,
}

/// Per-connection state.
pub struct ClientSession {
    pub session_id: String,
    state: SessionState,
    tts_playing: bool,
    last_audio_timestamp: u32,
    buffer: AudioBuffer,
    last_dispatch_time: Option<Instant>,
    last_activity_time: Instant,
    history: SharedHistory,
    speed: f32,
    in_flight: Option<String>,
    job_stop: Option<StopSignal>,
    created_at: DateTime<Utc>,
    stats: SessionStats,
    sink: Arc<dyn EventSink>,
}

impl ClientSession {
    pub fn new(session_id: String, max_buffer_bytes: usize, sink: Arc<dyn EventSink>) -> Self {
        Self {
            session_id,
            state: SessionState::Idle,
            tts_playing: false,
            last_audio_timestamp: 0,
            buffer: AudioBuffer::new(max_buffer_bytes),
            last_dispatch_time: None,
            last_activity_time: Instant::now(),
            history: Arc::new(Mutex::new(Vec::new())),
            speed: 1.0,
            in_flight: None,
            job_stop: None,
            created_at: Utc::now(),
            stats: SessionStats::default(),
            sink,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tts_playing(&self) -> bool {
        self.tts_playing
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_deref()
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }

    pub fn history(&self) -> SharedHistory {
        Arc::clone(&self.history)
    }

    /// Store a validated frame: flags, timestamp, payload and activity time.
    pub fn record_frame(&mut self, frame: &AudioFrame, now: Instant, max_buffer_bytes: usize) {
        self.tts_playing = frame.tts_playing();
        self.last_audio_timestamp = frame.timestamp;
        self.last_activity_time = now;
        self.buffer.set_max_bytes(max_buffer_bytes);
        self.buffer.append(&frame.payload);

        self.stats.frames_received += 1;
        self.stats.bytes_received += frame.payload.len() as u64;

        if self.state == SessionState::Idle {
            self.state = SessionState::Buffering;
        }
    }

    /// Inputs for the dispatch policy as of `now`.
    pub fn dispatch_inputs(&self, now: Instant) -> DispatchInputs {
        DispatchInputs {
            buffer_len: self.buffer.len(),
            since_last_dispatch: self
                .last_dispatch_time
                .map(|t| now.saturating_duration_since(t)),
            idle_for: now.saturating_duration_since(self.last_activity_time),
            tts_playing: self.tts_playing,
            in_flight: self.in_flight.is_some(),
        }
    }

    /// Take the buffer for a dispatch.
    ///
    /// Copy-out, clear and timestamp happen under the caller's session lock, so
    /// a frame arriving concurrently lands either entirely before or entirely
    /// after this take. Returns `None` when a job is already in flight or there
    /// is nothing to send.
    pub fn take_for_dispatch(&mut self, now: Instant) -> Option<DispatchTake> {
        if self.in_flight.is_some() || self.buffer.is_empty() {
            return None;
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let audio = self.buffer.take();
        self.last_dispatch_time = Some(now);
        self.in_flight = Some(job_id.clone());
        let stop = StopSignal::new();
        self.job_stop = Some(stop.clone());
        self.state = SessionState::AwaitingResult;
        self.stats.dispatches += 1;

        Some(DispatchTake {
            job_id,
            audio,
            tts_playing: self.tts_playing,
            timestamp: self.last_audio_timestamp,
            speed: self.speed,
            history: Arc::clone(&self.history),
            stop,
        })
    }

    /// Release the in-flight slot once `job_id` reached a terminal state.
    pub fn finish_dispatch(&mut self, job_id: &str) {
        if self.in_flight.as_deref() != Some(job_id) {
            return;
        }
        self.in_flight = None;
        self.job_stop = None;
        self.state = if self.buffer.is_empty() {
            SessionState::Idle
        } else {
            SessionState::Buffering
        };
    }

    /// Ask the in-flight job, if any, to stop producing audio.
    pub fn cancel_in_flight(&mut self) {
        if let Some(stop) = self.job_stop.take() {
            stop.set();
        }
    }

    pub fn set_tts_playing(&mut self, playing: bool) {
        self.tts_playing = playing;
    }

    pub fn set_speed(&mut self, speed: f32) {
        self.speed = speed;
    }

    /// Forget the conversation and any audio not yet dispatched.
    ///
    /// The history is swapped for a fresh one rather than emptied: a job in
    /// flight keeps writing to the old copy, which nothing reads again.
    pub fn clear_history(&mut self) {
        self.history = SharedHistory::default();
        self.buffer.clear();
        if self.in_flight.is_none() {
            self.state = SessionState::Idle;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            state: self.state,
            tts_playing: self.tts_playing,
            last_audio_timestamp: self.last_audio_timestamp,
            buffer_bytes: self.buffer.len(),
            buffered_seconds: self.buffer.duration_seconds(16_000),
            dropped_bytes: self.buffer.dropped_bytes(),
            history_len: lock(&self.history).len(),
            speed: self.speed,
            in_flight_job: self.in_flight.clone(),
            created_at: self.created_at,
            stats: self.stats.clone(),
        }
    }
}

/// Read-only view of a session for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: SessionState,
    pub tts_playing: bool,
    pub last_audio_timestamp: u32,
    pub buffer_bytes: usize,
    pub buffered_seconds: f64,
    pub dropped_bytes: usize,
    pub history_len: usize,
    pub speed: f32,
    pub in_flight_job: Option<String>,
    pub created_at: DateTime<Utc>,
    pub stats: SessionStats,
}

pub type SessionHandle = Arc<Mutex<ClientSession>>;

/// Owns every live `ClientSession`.
///
/// ## Guarantees:
/// - at most one session per connection id at a time
/// - `open` is idempotent: opening an existing id returns the existing session
/// - `close` removes and releases the session (buffer included)
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    max_sessions: usize,
    max_buffer_bytes: usize,
}

impl SessionStore {
    pub fn new(max_sessions: usize, max_buffer_bytes: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            max_buffer_bytes,
        }
    }

    /// Create the session for `session_id`, or return the live one.
    pub fn open(&self, session_id: &str, sink: Arc<dyn EventSink>) -> RelayResult<SessionHandle> {
        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());

        if let Some(existing) = sessions.get(session_id) {
            return Ok(Arc::clone(existing));
        }

        if sessions.len() >= self.max_sessions {
            return Err(RelayError::SessionLimit(self.max_sessions));
        }

        let session = Arc::new(Mutex::new(ClientSession::new(
            session_id.to_string(),
            self.max_buffer_bytes,
            sink,
        )));
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> RelayResult<SessionHandle> {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))
    }

    /// Remove a session and stop its in-flight job. Returns whether it existed.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
            sessions.remove(session_id)
        };
        match removed {
            Some(handle) => {
                lock(&handle).cancel_in_flight();
                true
            }
            None => false,
        }
    }

    /// Run `f` with the session locked. `None` if the session is gone.
    pub fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&mut ClientSession) -> R) -> Option<R> {
        let handle = self.get(session_id).ok()?;
        let mut session = lock(&handle);
        Some(f(&mut session))
    }

    pub fn session_ids(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
            sessions.values().cloned().collect()
        };
        handles.iter().map(|h| lock(h).snapshot()).collect()
    }
}
