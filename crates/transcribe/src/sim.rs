//! Deterministic in-process transcription provider.
//!
//! Segments audio by received duration: every
//! [`SimProvider::SEGMENT_MS`] of audio commits one final utterance with
//! evenly spread word timings. Tests and local development use it to
//! exercise the whole coordinator path without network access.

use tokio::sync::mpsc;

use qm_domain::Result;

use crate::{Session, SessionSink, TranscriptEvent, TranscriptWord, TranscriptionProvider};

#[derive(Default)]
pub struct SimProvider;

impl SimProvider {
    /// Audio per committed segment.
    pub const SEGMENT_MS: u64 = 2_000;

    pub fn new() -> Self {
        Self
    }
}

struct SimSink {
    sample_rate: u32,
    events_tx: mpsc::Sender<TranscriptEvent>,
    received_ms: u64,
    segment_start_ms: u64,
    segments_emitted: u64,
}

impl SimSink {
    fn segment_event(&mut self) -> TranscriptEvent {
        self.segments_emitted += 1;
        let start_ms = self.segment_start_ms;
        let duration_ms = self.received_ms - start_ms;
        let text = format!("segment {}", self.segments_emitted);
        let mid = start_ms + duration_ms / 2;
        let words = vec![
            TranscriptWord {
                word: "segment".into(),
                start_ms,
                end_ms: mid,
                confidence: 1.0,
            },
            TranscriptWord {
                word: format!("{}", self.segments_emitted),
                start_ms: mid,
                end_ms: start_ms + duration_ms,
                confidence: 1.0,
            },
        ];
        self.segment_start_ms = self.received_ms;
        TranscriptEvent::Final {
            text,
            start_ms,
            duration_ms,
            words,
        }
    }
}

#[async_trait::async_trait]
impl SessionSink for SimSink {
    async fn send(&mut self, pcm: Vec<i16>) -> Result<()> {
        self.received_ms += pcm.len() as u64 * 1000 / self.sample_rate as u64;
        if self.received_ms - self.segment_start_ms >= SimProvider::SEGMENT_MS {
            let event = self.segment_event();
            let _ = self.events_tx.send(event).await;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.received_ms > self.segment_start_ms {
            let event = self.segment_event();
            let _ = self.events_tx.send(event).await;
        }
        let _ = self.events_tx.send(TranscriptEvent::Closed).await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TranscriptionProvider for SimProvider {
    async fn open(&self, _language: &str, sample_rate: u32) -> Result<Session> {
        let (events_tx, events_rx) = mpsc::channel(64);
        Ok(Session {
            sink: Box::new(SimSink {
                sample_rate,
                events_tx,
                received_ms: 0,
                segment_start_ms: 0,
                segments_emitted: 0,
            }),
            events: events_rx,
        })
    }

    fn provider_id(&self) -> &'static str {
        "sim"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commits_a_final_every_segment() {
        let provider = SimProvider::new();
        let mut session = provider.open("en", 48_000).await.unwrap();

        // 2.5 s of audio in 10 ms frames.
        for _ in 0..250 {
            session.sink.send(vec![0i16; 480]).await.unwrap();
        }
        let event = session.events.recv().await.unwrap();
        let TranscriptEvent::Final {
            start_ms,
            duration_ms,
            words,
            ..
        } = event
        else {
            panic!("expected a final");
        };
        assert_eq!(start_ms, 0);
        assert!(duration_ms >= SimProvider::SEGMENT_MS);
        assert_eq!(words.len(), 2);
        assert!(words[0].end_ms <= words[1].end_ms);
    }

    #[tokio::test]
    async fn close_flushes_the_tail_then_closes() {
        let provider = SimProvider::new();
        let mut session = provider.open("en", 48_000).await.unwrap();
        for _ in 0..50 {
            session.sink.send(vec![0i16; 480]).await.unwrap();
        }
        session.sink.close().await.unwrap();

        assert!(matches!(
            session.events.recv().await,
            Some(TranscriptEvent::Final { .. })
        ));
        assert!(matches!(
            session.events.recv().await,
            Some(TranscriptEvent::Closed)
        ));
    }
}
