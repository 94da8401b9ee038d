//! Stage collaborators driven by the pipeline orchestrator.
//!
//! Recognition and response generation are async network calls. Synthesis is
//! a blocking producer that runs on its own thread and hands chunks over a
//! bounded queue, watching a stop signal between chunks.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::audio::session::ConversationTurn;
use crate::error::RelayResult;

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe 16kHz 16-bit mono PCM.
    async fn transcribe(&self, pcm: &[u8]) -> RelayResult<String>;
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Produce a reply to `text` given the conversation so far.
    async fn respond(&self, text: &str, history: &[ConversationTurn]) -> RelayResult<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub speed: f32,
}

/// Blocking synthesis producer.
///
/// Implementations push raw 24kHz 16-bit mono chunks through `chunks` and
/// return once synthesis is done. They must return promptly once `stop` is
/// set or `chunks` reports the collector has gone away.
pub trait SpeechSynthesizer: Send + Sync {
    fn synthesize(
        &self,
        request: &SynthesisRequest,
        chunks: &ChunkSender,
        stop: &StopSignal,
    ) -> RelayResult<()>;
}

/// Sample-rate converter applied to each synthesized chunk.
///
/// `push` returns converted PCM ready for the client (possibly empty when the
/// converter is still holding samples back); `flush` drains the held state and
/// resets the converter for the next job.
pub trait Upsampler: Send {
    fn push(&mut self, pcm: &[u8]) -> Vec<u8>;
    fn flush(&mut self) -> Vec<u8>;
}

/// Builds a fresh upsampler for every job.
pub type UpsamplerFactory = Arc<dyn Fn() -> Box<dyn Upsampler> + Send + Sync>;

/// Producer end of the bounded chunk queue.
#[derive(Clone)]
pub struct ChunkSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChunkSender {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }

    /// Block until the chunk is queued. `false` once the collector stopped listening.
    pub fn send(&self, chunk: Vec<u8>) -> bool {
        self.tx.blocking_send(chunk).is_ok()
    }
}

/// Level-triggered stop flag shared by the collector, the producer and whoever
/// owns the job.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal_is_shared() {
        let stop = StopSignal::new();
        let clone = stop.clone();
        assert!(!clone.is_set());
        stop.set();
        assert!(clone.is_set());
        assert!(*clone.subscribe().borrow());
    }

    #[tokio::test]
    async fn test_chunk_sender_reports_closed_queue() {
        let (tx, rx) = mpsc::channel(1);
        let sender = ChunkSender::new(tx);
        drop(rx);
        let sent = tokio::task::spawn_blocking(move || sender.send(vec![1])).await.unwrap();
        assert!(!sent);
    }
}
