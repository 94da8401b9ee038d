//! # Stage Workers
//!
//! Stage adapters for the local backend. Each stage is a separate serverless
//! worker reached through the job API's synchronous endpoint:
//!
//! | Stage | Input | Output field |
//! |---|---|---|
//! | recognition | `audio_base64` (16kHz mono WAV) | `transcription` |
//! | response | `messages` (`role`/`content` list) | `response` |
//! | synthesis | `text`, `speed`, `format: "wav"` | `audio_base64` |

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{LittleEndian, WriteBytesExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::audio::session::ConversationTurn;
use crate::backend::remote::transport_error;
use crate::error::{BackendPhase, RelayError, RelayResult};
use crate::pipeline::stages::{
    ChunkSender, ResponseGenerator, SpeechRecognizer, SpeechSynthesizer, StopSignal,
    SynthesisRequest,
};

const RECOGNITION_SAMPLE_RATE: u32 = 16_000;
const WAV_HEADER_BYTES: usize = 44;

/// Authenticated `/runsync` caller shared by the three stage workers.
pub struct WorkerClient {
    http: reqwest::Client,
    api_key: String,
    timeout: Duration,
}

impl WorkerClient {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            timeout,
        }
    }

    pub async fn run_sync(&self, endpoint: &str, input: Value) -> RelayResult<Value> {
        let started = Instant::now();
        let url = format!("{}/runsync", endpoint.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&json!({ "input": input }))
            .send()
            .await
            .map_err(|e| transport_error(e, BackendPhase::Submit, started))?;

        if !response.status().is_success() {
            return Err(RelayError::backend(format!(
                "worker {} returned status {}",
                url,
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| transport_error(e, BackendPhase::Submit, started))?;
        debug!(url = %url, elapsed_ms = started.elapsed().as_millis() as u64, "Worker call finished");
        extract_output(body)
    }
}

/// Pull `output` out of a finished job, surfacing failures reported in-band.
pub(crate) fn extract_output(body: Value) -> RelayResult<Value> {
    let status = body.get("status").and_then(Value::as_str).unwrap_or("COMPLETED");
    if status != "COMPLETED" {
        return Err(RelayError::backend(format!("worker job ended with status {}", status)));
    }

    let output = body.get("output").cloned().unwrap_or(Value::Null);
    if let Some(message) = output.get("error").and_then(Value::as_str) {
        return Err(RelayError::backend(message.to_string()));
    }
    Ok(output)
}

/// Wrap 16-bit mono PCM in a minimal WAV container.
pub fn wav_bytes(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let mut wav = Vec::with_capacity(WAV_HEADER_BYTES + pcm.len());

    // Writes into a Vec cannot fail
    let _ = (|| -> std::io::Result<()> {
        wav.extend_from_slice(b"RIFF");
        wav.write_u32::<LittleEndian>(36 + data_len)?;
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.write_u32::<LittleEndian>(16)?;
        wav.write_u16::<LittleEndian>(1)?; // PCM
        wav.write_u16::<LittleEndian>(1)?; // mono
        wav.write_u32::<LittleEndian>(sample_rate)?;
        wav.write_u32::<LittleEndian>(sample_rate * 2)?;
        wav.write_u16::<LittleEndian>(2)?;
        wav.write_u16::<LittleEndian>(16)?;
        wav.extend_from_slice(b"data");
        wav.write_u32::<LittleEndian>(data_len)?;
        Ok(())
    })();

    wav.extend_from_slice(pcm);
    wav
}

/// Drop a canonical 44-byte WAV header if present.
pub fn strip_wav_header(audio: &[u8]) -> &[u8] {
    if audio.len() >= WAV_HEADER_BYTES && audio.starts_with(b"RIFF") && &audio[8..12] == b"WAVE" {
        &audio[WAV_HEADER_BYTES..]
    } else {
        audio
    }
}

fn output_str<'a>(output: &'a Value, field: &str) -> Option<&'a str> {
    output.get(field).and_then(Value::as_str).or_else(|| output.as_str())
}

pub struct WhisperWorker {
    client: Arc<WorkerClient>,
    endpoint: String,
}

impl WhisperWorker {
    pub fn new(client: Arc<WorkerClient>, endpoint: impl Into<String>) -> Self {
        Self { client, endpoint: endpoint.into() }
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperWorker {
    async fn transcribe(&self, pcm: &[u8]) -> RelayResult<String> {
        let wav = wav_bytes(pcm, RECOGNITION_SAMPLE_RATE);
        let output = self
            .client
            .run_sync(
                &self.endpoint,
                json!({
                    "audio_base64": STANDARD.encode(wav),
                    "transcription": "plain_text",
                }),
            )
            .await?;

        output_str(&output, "transcription")
            .map(|text| text.trim().to_string())
            .ok_or_else(|| RelayError::stage("recognition", "worker output has no transcription"))
    }
}

pub struct LlmWorker {
    client: Arc<WorkerClient>,
    endpoint: String,
}

impl LlmWorker {
    pub fn new(client: Arc<WorkerClient>, endpoint: impl Into<String>) -> Self {
        Self { client, endpoint: endpoint.into() }
    }
}

#[async_trait]
impl ResponseGenerator for LlmWorker {
    async fn respond(&self, text: &str, history: &[ConversationTurn]) -> RelayResult<String> {
        let mut messages: Vec<Value> = history
            .iter()
            .map(|turn| json!({ "role": turn.role, "content": turn.content }))
            .collect();
        messages.push(json!({ "role": "user", "content": text }));

        let output = self
            .client
            .run_sync(&self.endpoint, json!({ "messages": messages, "max_tokens": 512 }))
            .await?;

        output_str(&output, "response")
            .map(|reply| reply.trim().to_string())
            .ok_or_else(|| RelayError::stage("response", "worker output has no response"))
    }
}

/// Synthesis worker. Blocking: runs on the collector's producer thread and
/// drives the async HTTP call on the runtime that spawned that thread.
pub struct TtsWorker {
    client: Arc<WorkerClient>,
    endpoint: String,
    chunk_bytes: usize,
}

impl TtsWorker {
    pub fn new(client: Arc<WorkerClient>, endpoint: impl Into<String>, chunk_bytes: usize) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            chunk_bytes: chunk_bytes.max(2),
        }
    }
}

impl SpeechSynthesizer for TtsWorker {
    fn synthesize(
        &self,
        request: &SynthesisRequest,
        chunks: &ChunkSender,
        stop: &StopSignal,
    ) -> RelayResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RelayError::stage("synthesis", e.to_string()))?;

        let output = runtime.block_on(self.client.run_sync(
            &self.endpoint,
            json!({ "text": request.text, "speed": request.speed, "format": "wav" }),
        ))?;

        let encoded = output_str(&output, "audio_base64")
            .ok_or_else(|| RelayError::stage("synthesis", "worker output has no audio"))?;
        let audio = STANDARD
            .decode(encoded)
            .map_err(|e| RelayError::stage("synthesis", e.to_string()))?;

        for chunk in strip_wav_header(&audio).chunks(self.chunk_bytes) {
            if stop.is_set() || !chunks.send(chunk.to_vec()) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header() {
        let wav = wav_bytes(&[1, 0, 2, 0], 16_000);
        assert_eq!(wav.len(), 48);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[4], wav[5], wav[6], wav[7]]), 40);
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16_000);
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 4);
        assert_eq!(strip_wav_header(&wav), &[1, 0, 2, 0]);
    }

    #[test]
    fn test_strip_leaves_raw_pcm_alone() {
        let raw = vec![9u8; 100];
        assert_eq!(strip_wav_header(&raw), raw.as_slice());
    }

    #[test]
    fn test_extract_output() {
        let body = json!({"status": "COMPLETED", "output": {"transcription": "hi there"}});
        let output = extract_output(body).unwrap();
        assert_eq!(output_str(&output, "transcription"), Some("hi there"));

        let failed = json!({"status": "FAILED", "error": "oom"});
        assert!(matches!(extract_output(failed), Err(RelayError::Backend { .. })));

        let in_band = json!({"status": "COMPLETED", "output": {"error": "No text provided"}});
        match extract_output(in_band) {
            Err(RelayError::Backend { message }) => assert_eq!(message, "No text provided"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
