//! # Remote Job Backend
//!
//! Talks to a serverless job API over HTTP with bearer authentication.
//!
//! ## Modes:
//! - **Blocking**: `POST {endpoint}/runsync` returns the whole output once the
//!   job finishes. If the API gives up waiting first (`IN_QUEUE`/`IN_PROGRESS`),
//!   the job is picked up by polling like a streaming job.
//! - **Streaming**: `POST {endpoint}/run` returns a job id, then
//!   `GET {endpoint}/stream/{id}` is polled until the job reaches a final status.
//!
//! ## Timeouts:
//! The submit call and the whole stream/poll phase have independent budgets.
//! Hitting either yields a single `BackendTimeout` and ends the job's stream.

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::backend::{stream_common, BackendBridge, BackendRequest, EventStream, JobHandle, JobSource};
use crate::config::{BackendConfig, BackendMode};
use crate::error::{BackendPhase, RelayError, RelayResult};
use crate::pipeline::events::{BackendEvent, ServerMessage};

/// Turn a reqwest failure into the relay's taxonomy.
pub(crate) fn transport_error(err: reqwest::Error, phase: BackendPhase, started: Instant) -> RelayError {
    if err.is_timeout() {
        RelayError::BackendTimeout {
            phase,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    } else {
        RelayError::backend(format!("{} request failed: {}", phase, err))
    }
}

/// Interpret one item (or an array of items) of job output as events.
///
/// Stream entries may be wrapped as `{"output": {...}}`. Items with an unknown
/// `type` are skipped.
pub(crate) fn parse_output(value: &Value) -> Vec<RelayResult<BackendEvent>> {
    let mut events = Vec::new();
    collect_events(value, &mut events);
    events
}

fn collect_events(value: &Value, events: &mut Vec<RelayResult<BackendEvent>>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_events(item, events);
            }
        }
        Value::Object(map) if !map.contains_key("type") => {
            if let Some(inner) = map.get("output") {
                collect_events(inner, events);
            }
        }
        Value::Object(_) => match serde_json::from_value::<ServerMessage>(value.clone()) {
            Ok(message) => events.push(message.into_backend_event()),
            Err(e) => warn!(error = %e, "Skipping unrecognized backend event"),
        },
        _ => {}
    }
}

fn job_status(body: &Value) -> &str {
    body.get("status").and_then(Value::as_str).unwrap_or("")
}

fn is_failed_status(status: &str) -> bool {
    matches!(status, "FAILED" | "CANCELLED" | "TIMED_OUT")
}

/// Decide what a `/runsync` response means for the job.
pub(crate) fn interpret_runsync(body: &Value) -> RelayResult<JobSource> {
    let status = job_status(body);
    match status {
        "COMPLETED" => {
            let output = body.get("output").cloned().unwrap_or(Value::Null);
            let mut events = VecDeque::new();
            for event in parse_output(&output) {
                events.push_back(event?);
            }
            Ok(JobSource::Buffered(events))
        }
        "IN_QUEUE" | "IN_PROGRESS" => {
            let id = job_id(body)?;
            debug!(job = %id, "Synchronous wait expired, switching to polling");
            Ok(JobSource::Remote(id))
        }
        other => Err(RelayError::backend(format!(
            "job ended with status {}{}",
            other,
            body.get("error")
                .and_then(Value::as_str)
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        ))),
    }
}

fn job_id(body: &Value) -> RelayResult<String> {
    body.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RelayError::backend("job submission response has no id"))
}

pub struct RemoteBackend {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    blocking: bool,
    submit_timeout: Duration,
    stream_timeout: Duration,
    poll_interval: Duration,
}

impl RemoteBackend {
    pub fn from_config(http: reqwest::Client, config: &BackendConfig) -> Self {
        Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            blocking: config.mode == BackendMode::Blocking,
            submit_timeout: config.submit_timeout(),
            stream_timeout: config.stream_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    async fn post_job(&self, path: &str, payload: &Value) -> RelayResult<Value> {
        let started = Instant::now();
        let response = self
            .http
            .post(format!("{}/{}", self.endpoint, path))
            .bearer_auth(&self.api_key)
            .timeout(self.submit_timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| transport_error(e, BackendPhase::Submit, started))?;

        if !response.status().is_success() {
            return Err(RelayError::backend(format!(
                "job submission returned status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| transport_error(e, BackendPhase::Submit, started))
    }
}

#[async_trait]
impl BackendBridge for RemoteBackend {
    async fn submit(&self, request: BackendRequest) -> RelayResult<JobHandle> {
        if self.endpoint.is_empty() || self.api_key.is_empty() {
            return Err(RelayError::NotConfigured);
        }

        let payload = request.payload();
        let source = if self.blocking {
            let body = self.post_job("runsync", &payload).await?;
            interpret_runsync(&body)?
        } else {
            let body = self.post_job("run", &payload).await?;
            JobSource::Remote(job_id(&body)?)
        };

        info!(
            session_id = %request.session_id(),
            job_id = %request.job_id(),
            mode = if self.blocking { "blocking" } else { "streaming" },
            "Job submitted"
        );

        Ok(JobHandle {
            job_id: request.job_id().to_string(),
            session_id: request.session_id().to_string(),
            source,
        })
    }

    fn stream_events(&self, handle: JobHandle) -> EventStream {
        match stream_common(handle.source) {
            Ok(stream) => stream,
            Err(remote_id) => {
                let (tx, rx) = mpsc::channel(32);
                let poller = StreamPoller {
                    http: self.http.clone(),
                    url: format!("{}/stream/{}", self.endpoint, remote_id),
                    api_key: self.api_key.clone(),
                    remote_id,
                    stream_timeout: self.stream_timeout,
                    poll_interval: self.poll_interval,
                };
                tokio::spawn(poller.run(tx));
                ReceiverStream::new(rx).boxed()
            }
        }
    }

    fn name(&self) -> &'static str {
        if self.blocking {
            "remote-blocking"
        } else {
            "remote-streaming"
        }
    }
}

/// Polls one remote job's stream until it finishes, fails or runs out of time.
struct StreamPoller {
    http: reqwest::Client,
    url: String,
    api_key: String,
    remote_id: String,
    stream_timeout: Duration,
    poll_interval: Duration,
}

impl StreamPoller {
    async fn run(self, tx: mpsc::Sender<RelayResult<BackendEvent>>) {
        let started = Instant::now();

        loop {
            let remaining = self.stream_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                let _ = tx
                    .send(Err(RelayError::BackendTimeout {
                        phase: BackendPhase::Stream,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }))
                    .await;
                return;
            }

            let body = match self.poll_once(remaining, started).await {
                Ok(body) => body,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            if let Some(items) = body.get("stream") {
                for event in parse_output(items) {
                    let failed = event.is_err();
                    if tx.send(event).await.is_err() || failed {
                        return;
                    }
                }
            }

            let status = job_status(&body);
            if status == "COMPLETED" {
                debug!(job = %self.remote_id, "Remote job completed");
                return;
            }
            if is_failed_status(status) {
                let _ = tx
                    .send(Err(RelayError::backend(format!(
                        "remote job {} ended with status {}",
                        self.remote_id, status
                    ))))
                    .await;
                return;
            }

            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    async fn poll_once(&self, remaining: Duration, started: Instant) -> RelayResult<Value> {
        let response = self
            .http
            .get(&self.url)
            .bearer_auth(&self.api_key)
            .timeout(remaining)
            .send()
            .await
            .map_err(|e| transport_error(e, BackendPhase::Stream, started))?;

        if !response.status().is_success() {
            return Err(RelayError::backend(format!(
                "stream poll returned status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| transport_error(e, BackendPhase::Stream, started))
    }
}
