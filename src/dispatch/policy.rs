//! # Dispatch Policy
//!
//! Decides when a session's buffered audio is sent to the backend. Pure: it
//! sees a snapshot of the session plus elapsed times and never touches a clock.
//!
//! ## Rules:
//! - **Threshold**: enough audio, enough time since the last dispatch, and the
//!   client is not playing synthesized speech (so the relay does not transcribe
//!   its own output)
//! - **Idle flush**: any audio at all after `max_idle_interval` of silence,
//!   regardless of playback, so a short trailing utterance is never stranded
//! - **One in flight**: neither rule fires while a job for the session is
//!   still outstanding; the audio keeps buffering instead

use std::time::Duration;

use crate::config::DispatchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub min_buffer_bytes: usize,
    pub min_dispatch_interval: Duration,
    pub max_idle_interval: Duration,
}

/// What the policy needs to know about a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchInputs {
    pub buffer_len: usize,
    /// `None` when the session never dispatched
    pub since_last_dispatch: Option<Duration>,
    /// Time since the last accepted frame
    pub idle_for: Duration,
    pub tts_playing: bool,
    pub in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTrigger {
    Threshold,
    IdleFlush,
}

impl DispatchTrigger {
    /// `message_type` attached to the backend request.
    pub fn message_type(&self) -> &'static str {
        match self {
            DispatchTrigger::Threshold => "audio_batch",
            DispatchTrigger::IdleFlush => "audio_batch_timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    Dispatch(DispatchTrigger),
    Wait,
    /// A rule would fire but a job is already in flight
    Deferred(DispatchTrigger),
}

impl DispatchPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            min_buffer_bytes: config.min_buffer_bytes,
            min_dispatch_interval: config.min_dispatch_interval(),
            max_idle_interval: config.max_idle_interval(),
        }
    }

    /// Threshold path, evaluated after every accepted frame.
    pub fn should_dispatch(&self, inputs: &DispatchInputs) -> bool {
        let interval_elapsed = inputs
            .since_last_dispatch
            .map_or(true, |elapsed| elapsed >= self.min_dispatch_interval);

        inputs.buffer_len >= self.min_buffer_bytes && interval_elapsed && !inputs.tts_playing
    }

    /// Idle path, evaluated by the background sweep.
    pub fn should_flush_idle(&self, inputs: &DispatchInputs) -> bool {
        inputs.buffer_len > 0 && inputs.idle_for >= self.max_idle_interval
    }

    pub fn evaluate_frame(&self, inputs: &DispatchInputs) -> DispatchDecision {
        self.gate(self.should_dispatch(inputs), DispatchTrigger::Threshold, inputs)
    }

    pub fn evaluate_idle(&self, inputs: &DispatchInputs) -> DispatchDecision {
        self.gate(self.should_flush_idle(inputs), DispatchTrigger::IdleFlush, inputs)
    }

    fn gate(&self, fires: bool, trigger: DispatchTrigger, inputs: &DispatchInputs) -> DispatchDecision {
        match (fires, inputs.in_flight) {
            (false, _) => DispatchDecision::Wait,
            (true, true) => DispatchDecision::Deferred(trigger),
            (true, false) => DispatchDecision::Dispatch(trigger),
        }
    }
}
