//! Streaming transcription: provider contract and the per-bot coordinator.
//!
//! A provider opens one streaming session per speaking participant; the
//! coordinator owns session lifecycles (open on speech, close on idle),
//! keeps every queue bounded so a slow provider can never stall media
//! ingest, and assembles word-timed utterances in meeting-relative time.

pub mod coordinator;
pub mod deepgram;
pub mod sim;

use tokio::sync::mpsc;

use qm_domain::Result;

pub use coordinator::{CoordinatorEvent, SpeakerTranscript, TranscriptionCoordinator};
pub use deepgram::DeepgramProvider;
pub use sim::SimProvider;

/// One transcribed word, session-relative milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptWord {
    pub word: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f64,
}

/// What a provider session emits.
#[derive(Debug, Clone)]
pub enum TranscriptEvent {
    /// Interim hypothesis; superseded by later events.
    Partial {
        text: String,
        start_ms: u64,
        duration_ms: u64,
        words: Vec<TranscriptWord>,
    },
    /// Committed utterance.
    Final {
        text: String,
        start_ms: u64,
        duration_ms: u64,
        words: Vec<TranscriptWord>,
    },
    /// The provider failed; the session is dead.
    Error { message: String },
    /// Clean end of stream (all finals delivered).
    Closed,
}

/// Write half of a session.
#[async_trait::async_trait]
pub trait SessionSink: Send {
    /// Push one frame of 16-bit mono PCM at the rate the session was
    /// opened with.
    async fn send(&mut self, pcm: Vec<i16>) -> Result<()>;
    /// Signal end of audio; finals continue on the event stream until
    /// [`TranscriptEvent::Closed`].
    async fn close(&mut self) -> Result<()>;
}

/// An open streaming session: a sink plus its event stream.
pub struct Session {
    pub sink: Box<dyn SessionSink>,
    pub events: mpsc::Receiver<TranscriptEvent>,
}

/// A speech-to-text provider.
#[async_trait::async_trait]
pub trait TranscriptionProvider: Send + Sync {
    async fn open(&self, language: &str, sample_rate: u32) -> Result<Session>;
    fn provider_id(&self) -> &'static str;
}

/// Clamp words into the utterance envelope and force monotonic starts,
/// the invariant persisted utterances must satisfy.
pub fn clamp_words(start_ms: u64, duration_ms: u64, words: &mut [TranscriptWord]) {
    let end = start_ms + duration_ms;
    let mut previous_start = start_ms;
    for word in words {
        word.start_ms = word.start_ms.clamp(previous_start, end);
        word.end_ms = word.end_ms.clamp(word.start_ms, end);
        previous_start = word.start_ms;
    }
}
