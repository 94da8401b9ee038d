//! # Dispatcher
//!
//! Glue between sessions, the dispatch policy and the backend bridge.
//!
//! ## Responsibilities:
//! - record every accepted frame and evaluate the threshold rule
//! - evaluate the idle rule for every session when the sweep asks
//! - take the buffer and start a job atomically (under the session lock)
//! - stream each job's events through its [`PipelineJob`] to the client
//! - release the session's in-flight slot when the job ends
//! - apply control messages locally and forward them to the backend
//!
//! Jobs run as independent tasks on the runtime captured at construction, so
//! a disconnecting client never cancels one: its results are simply dropped.

use futures_util::StreamExt;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::frame::AudioFrame;
use crate::audio::session::{lock, DispatchTake, SessionStore};
use crate::backend::{BackendBridge, BackendRequest, ControlMessage, ControlRequest, DispatchRequest};
use crate::config::AppConfig;
use crate::dispatch::policy::{DispatchDecision, DispatchPolicy, DispatchTrigger};
use crate::error::{RelayError, RelayResult};
use crate::pipeline::events::{BackendEvent, EventSink, JobState, PipelineJob, ServerMessage, StageEvent};
use crate::state::{config_read, metrics_mut, AppMetrics};

pub struct Dispatcher {
    sessions: Arc<SessionStore>,
    bridge: Arc<dyn BackendBridge>,
    config: Arc<RwLock<AppConfig>>,
    metrics: Arc<RwLock<AppMetrics>>,
    runtime: tokio::runtime::Handle,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionStore>,
        bridge: Arc<dyn BackendBridge>,
        config: Arc<RwLock<AppConfig>>,
        metrics: Arc<RwLock<AppMetrics>>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            sessions,
            bridge,
            config,
            metrics,
            runtime,
        }
    }

    /// Current thresholds; re-read on every evaluation so runtime updates apply.
    fn settings(&self) -> (DispatchPolicy, usize) {
        let config = config_read(&self.config);
        (
            DispatchPolicy::from_config(&config.dispatch),
            config.dispatch.max_buffer_bytes,
        )
    }

    /// Record a decoded frame and dispatch if the threshold rule fires.
    pub fn on_frame(&self, session_id: &str, frame: &AudioFrame, now: Instant) -> RelayResult<DispatchDecision> {
        let (policy, max_buffer_bytes) = self.settings();
        let handle = self.sessions.get(session_id)?;

        let (decision, take, sink) = {
            let mut session = lock(&handle);
            session.record_frame(frame, now, max_buffer_bytes);
            let decision = policy.evaluate_frame(&session.dispatch_inputs(now));
            let take = match decision {
                DispatchDecision::Dispatch(_) => session.take_for_dispatch(now),
                _ => None,
            };
            (decision, take, session.sink())
        };

        metrics_mut(&self.metrics).relay.frames_accepted += 1;
        self.act(session_id, decision, take, sink);
        Ok(decision)
    }

    /// Flush every session that has been idle long enough. Returns the number
    /// of dispatches started.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let (policy, _) = self.settings();
        let mut flushed = 0;

        for session_id in self.sessions.session_ids() {
            // Closed since the id list was taken
            let Ok(handle) = self.sessions.get(&session_id) else {
                continue;
            };

            let (decision, take, sink) = {
                let mut session = lock(&handle);
                let decision = policy.evaluate_idle(&session.dispatch_inputs(now));
                let take = match decision {
                    DispatchDecision::Dispatch(_) => session.take_for_dispatch(now),
                    _ => None,
                };
                (decision, take, session.sink())
            };

            if self.act(&session_id, decision, take, sink) {
                flushed += 1;
            }
        }

        if flushed > 0 {
            debug!(flushed, "Idle sweep dispatched buffered audio");
        }
        flushed
    }

    fn act(
        &self,
        session_id: &str,
        decision: DispatchDecision,
        take: Option<DispatchTake>,
        sink: Arc<dyn EventSink>,
    ) -> bool {
        match (decision, take) {
            (DispatchDecision::Dispatch(trigger), Some(take)) => {
                self.start_job(session_id, trigger, take, sink);
                true
            }
            (DispatchDecision::Deferred(trigger), _) => {
                debug!(
                    reason = %RelayError::PolicyViolation { session_id: session_id.to_string() },
                    trigger = trigger.message_type(),
                    "Dispatch deferred, audio keeps buffering"
                );
                false
            }
            _ => false,
        }
    }

    fn start_job(&self, session_id: &str, trigger: DispatchTrigger, take: DispatchTake, sink: Arc<dyn EventSink>) {
        {
            let mut metrics = metrics_mut(&self.metrics);
            metrics.relay.dispatches_total += 1;
            if trigger == DispatchTrigger::IdleFlush {
                metrics.relay.idle_flushes += 1;
            }
        }

        info!(
            session_id = %session_id,
            job_id = %take.job_id,
            bytes = take.audio.len(),
            trigger = trigger.message_type(),
            "Dispatching buffered audio"
        );

        let job = PipelineJob::new(take.job_id.clone(), session_id, take.audio.len());
        let request = BackendRequest::Audio(DispatchRequest {
            session_id: session_id.to_string(),
            job_id: take.job_id,
            audio: take.audio,
            message_type: trigger.message_type(),
            tts_playing: take.tts_playing,
            timestamp: take.timestamp,
            speed: take.speed,
            history: take.history,
            stop: take.stop,
        });

        let runner = JobRunner {
            bridge: Arc::clone(&self.bridge),
            sessions: Arc::clone(&self.sessions),
            metrics: Arc::clone(&self.metrics),
            sink,
        };
        self.runtime.spawn(runner.run(job, request));
    }

    /// Apply a control message to the session, then forward it to the backend.
    pub fn on_control(&self, session_id: &str, message: ControlMessage) -> RelayResult<()> {
        let sink = self
            .sessions
            .with_session(session_id, |session| {
                match &message {
                    ControlMessage::TtsStart => session.set_tts_playing(true),
                    ControlMessage::TtsStop => session.set_tts_playing(false),
                    ControlMessage::ClearHistory => session.clear_history(),
                    ControlMessage::SetSpeed { speed } => session.set_speed(*speed),
                }
                session.sink()
            })
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;

        debug!(session_id = %session_id, control = message.kind(), "Control message applied");

        let request = BackendRequest::Control(ControlRequest {
            session_id: session_id.to_string(),
            job_id: uuid::Uuid::new_v4().to_string(),
            message,
        });
        let bridge = Arc::clone(&self.bridge);
        let sessions = Arc::clone(&self.sessions);
        self.runtime.spawn(forward_control(bridge, sessions, sink, request));
        Ok(())
    }

    /// Drop a session. Its in-flight job, if any, finishes unobserved.
    pub fn close_session(&self, session_id: &str) -> bool {
        let closed = self.sessions.close(session_id);
        if closed {
            info!(session_id = %session_id, "Session closed");
        }
        closed
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }
}

/// Runs one audio job to its terminal event.
struct JobRunner {
    bridge: Arc<dyn BackendBridge>,
    sessions: Arc<SessionStore>,
    metrics: Arc<RwLock<AppMetrics>>,
    sink: Arc<dyn EventSink>,
}

impl JobRunner {
    async fn run(self, mut job: PipelineJob, request: BackendRequest) {
        let mut client_present = true;

        match self.bridge.submit(request).await {
            Ok(handle) => {
                let mut events = self.bridge.stream_events(handle);
                while let Some(item) = events.next().await {
                    let forwarded = match item {
                        Ok(BackendEvent::Stage(event)) => job.record(event),
                        Ok(BackendEvent::Control(reply)) => {
                            self.deliver(&job, ServerMessage::from(&reply), &mut client_present);
                            continue;
                        }
                        Err(e) => job.fail(&e),
                    };
                    self.forward(&job, &forwarded, &mut client_present);
                    if job.state().is_terminal() {
                        break;
                    }
                }
            }
            Err(e) => {
                let forwarded = job.fail(&e);
                self.forward(&job, &forwarded, &mut client_present);
            }
        }

        let forwarded = job.finish();
        self.forward(&job, &forwarded, &mut client_present);

        {
            let mut metrics = metrics_mut(&self.metrics);
            match job.state() {
                JobState::Complete => metrics.relay.jobs_completed += 1,
                JobState::TimedOut => metrics.relay.jobs_timed_out += 1,
                _ => metrics.relay.jobs_failed += 1,
            }
        }

        let released = self
            .sessions
            .with_session(&job.session_id, |session| session.finish_dispatch(&job.job_id))
            .is_some();

        match job.state() {
            JobState::Complete => info!(
                session_id = %job.session_id,
                job_id = %job.job_id,
                events = job.events().len(),
                "Job complete"
            ),
            state => warn!(
                session_id = %job.session_id,
                job_id = %job.job_id,
                state = ?state,
                "Job ended without completing"
            ),
        }
        if !released {
            debug!(job_id = %job.job_id, "Session gone, job results dropped");
        }
    }

    fn forward(&self, job: &PipelineJob, events: &[StageEvent], client_present: &mut bool) {
        for event in events {
            self.deliver(job, ServerMessage::from(event), client_present);
        }
    }

    fn deliver(&self, job: &PipelineJob, message: ServerMessage, client_present: &mut bool) {
        if !*client_present {
            return;
        }
        if self.sessions.get(&job.session_id).is_err() || !self.sink.deliver(message) {
            *client_present = false;
        }
    }
}

/// Forward a control message and relay the backend's reply.
///
/// The local state change already happened; a failed forward is only logged.
async fn forward_control(
    bridge: Arc<dyn BackendBridge>,
    sessions: Arc<SessionStore>,
    sink: Arc<dyn EventSink>,
    request: BackendRequest,
) {
    let session_id = request.session_id().to_string();
    let handle = match bridge.submit(request).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Control forward failed");
            return;
        }
    };

    let mut events = bridge.stream_events(handle);
    while let Some(item) = events.next().await {
        if sessions.get(&session_id).is_err() {
            return;
        }
        let message = match item {
            Ok(BackendEvent::Control(reply)) => ServerMessage::from(&reply),
            Ok(BackendEvent::Stage(event @ StageEvent::Error { .. })) => ServerMessage::from(&event),
            Ok(BackendEvent::Stage(_)) => continue,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Control forward failed");
                return;
            }
        };
        if !sink.deliver(message) {
            return;
        }
    }
}
