//! Per-bot transcription coordinator.
//!
//! One session task per speaking participant. Sessions open on first
//! audio, close themselves after the idle window, and may reopen on the
//! next speech. Audio fan-in is a bounded queue per session; when a slow
//! provider fills it, frames are counted and dropped — ingest is never
//! blocked. On shutdown, [`TranscriptionCoordinator::flush`] closes all
//! sinks and waits a bounded time for the remaining finals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use qm_domain::Result;

use crate::{
    clamp_words, Session, SessionSink as _, TranscriptEvent, TranscriptWord, TranscriptionProvider,
};

/// A transcript fragment attributed to a participant, meeting-relative.
#[derive(Debug, Clone)]
pub struct SpeakerTranscript {
    pub participant_uuid: String,
    pub relative_timestamp_ms: u64,
    pub duration_ms: u64,
    pub text: String,
    pub words: Vec<TranscriptWord>,
}

/// Coordinator output consumed by the bot controller.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Utterance(SpeakerTranscript),
    Partial(SpeakerTranscript),
    /// A session died on a provider error; capture continues and the
    /// session may reopen on the participant's next speech.
    SessionFailed {
        participant_uuid: String,
        message: String,
    },
    /// Frames dropped on a full session queue (slow provider).
    AudioDropped {
        participant_uuid: String,
        frames: u64,
    },
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub language: String,
    pub sample_rate: u32,
    pub idle_close: Duration,
    pub flush: Duration,
    /// Bounded per-session queue depth, in frames.
    pub queue_frames: usize,
}

struct SessionWorker {
    audio_tx: mpsc::Sender<Vec<i16>>,
    handle: JoinHandle<()>,
    dropped_frames: u64,
}

pub struct TranscriptionCoordinator {
    provider: Arc<dyn TranscriptionProvider>,
    config: CoordinatorConfig,
    sessions: HashMap<String, SessionWorker>,
    events_tx: mpsc::Sender<CoordinatorEvent>,
}

impl TranscriptionCoordinator {
    /// Returns the coordinator and the stream of its results.
    pub fn new(
        provider: Arc<dyn TranscriptionProvider>,
        config: CoordinatorConfig,
    ) -> (Self, mpsc::Receiver<CoordinatorEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        (
            Self {
                provider,
                config,
                sessions: HashMap::new(),
                events_tx,
            },
            events_rx,
        )
    }

    /// Feed one frame of a participant's audio (house format, 16-bit
    /// mono). Never blocks: a full or dead session queue drops the frame
    /// and accounts for it.
    pub async fn feed(&mut self, participant_uuid: &str, rel_ts_ms: u64, pcm: Vec<i16>) {
        // Reap a self-closed (idle) session so the next speech reopens.
        if let Some(worker) = self.sessions.get(participant_uuid) {
            if worker.audio_tx.is_closed() {
                self.reap(participant_uuid).await;
            }
        }

        if !self.sessions.contains_key(participant_uuid) {
            match self.open_session(participant_uuid, rel_ts_ms).await {
                Ok(worker) => {
                    self.sessions.insert(participant_uuid.to_owned(), worker);
                }
                Err(e) => {
                    tracing::warn!(
                        participant = participant_uuid,
                        error = %e,
                        "failed to open transcription session"
                    );
                    let _ = self
                        .events_tx
                        .send(CoordinatorEvent::SessionFailed {
                            participant_uuid: participant_uuid.to_owned(),
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }

        let worker = self
            .sessions
            .get_mut(participant_uuid)
            .expect("inserted above");
        if worker.audio_tx.try_send(pcm).is_err() {
            worker.dropped_frames += 1;
            // Report once per 100 dropped frames; the terminal count goes
            // out at flush.
            if worker.dropped_frames % 100 == 1 {
                let _ = self
                    .events_tx
                    .send(CoordinatorEvent::AudioDropped {
                        participant_uuid: participant_uuid.to_owned(),
                        frames: worker.dropped_frames,
                    })
                    .await;
            }
        }
    }

    async fn open_session(&self, participant_uuid: &str, base_ms: u64) -> Result<SessionWorker> {
        let session = self
            .provider
            .open(&self.config.language, self.config.sample_rate)
            .await?;
        tracing::debug!(
            participant = participant_uuid,
            base_ms,
            provider = self.provider.provider_id(),
            "transcription session opened"
        );

        let (audio_tx, audio_rx) = mpsc::channel(self.config.queue_frames);
        let handle = tokio::spawn(run_session(
            session,
            audio_rx,
            participant_uuid.to_owned(),
            base_ms,
            self.config.idle_close,
            self.config.flush,
            self.events_tx.clone(),
        ));
        Ok(SessionWorker {
            audio_tx,
            handle,
            dropped_frames: 0,
        })
    }

    async fn reap(&mut self, participant_uuid: &str) {
        if let Some(worker) = self.sessions.remove(participant_uuid) {
            self.report_drops(participant_uuid, worker.dropped_frames).await;
            let _ = worker.handle.await;
        }
    }

    async fn report_drops(&self, participant_uuid: &str, frames: u64) {
        if frames > 0 {
            let _ = self
                .events_tx
                .send(CoordinatorEvent::AudioDropped {
                    participant_uuid: participant_uuid.to_owned(),
                    frames,
                })
                .await;
        }
    }

    /// Close every session and wait up to the flush window for their
    /// final utterances.
    pub async fn flush(mut self) {
        let deadline = tokio::time::Instant::now() + self.config.flush;
        let workers: Vec<(String, SessionWorker)> = self.sessions.drain().collect();

        for (participant_uuid, worker) in workers {
            self.report_drops(&participant_uuid, worker.dropped_frames).await;
            // Dropping the sender ends the session task's audio stream,
            // which triggers its close-and-drain path.
            drop(worker.audio_tx);
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, worker.handle).await.is_err() {
                tracing::warn!(
                    participant = participant_uuid,
                    "abandoning transcription session past the flush window"
                );
            }
        }
    }
}

/// One session's lifetime: pump audio in, translate events out, close on
/// idle or when the audio stream ends.
async fn run_session(
    mut session: Session,
    mut audio_rx: mpsc::Receiver<Vec<i16>>,
    participant_uuid: String,
    base_ms: u64,
    idle_close: Duration,
    drain_window: Duration,
    events_tx: mpsc::Sender<CoordinatorEvent>,
) {
    let rebase = |start_ms: u64, duration_ms: u64, mut words: Vec<TranscriptWord>| {
        let start = base_ms + start_ms;
        for word in &mut words {
            word.start_ms += base_ms;
            word.end_ms += base_ms;
        }
        clamp_words(start, duration_ms, &mut words);
        (start, words)
    };

    let failed = loop {
        tokio::select! {
            received = tokio::time::timeout(idle_close, audio_rx.recv()) => {
                match received {
                    Ok(Some(pcm)) => {
                        if let Err(e) = session.sink.send(pcm).await {
                            let _ = events_tx
                                .send(CoordinatorEvent::SessionFailed {
                                    participant_uuid: participant_uuid.clone(),
                                    message: e.to_string(),
                                })
                                .await;
                            break true;
                        }
                    }
                    // Coordinator flush: audio is over.
                    Ok(None) => break false,
                    // Idle window expired without speech.
                    Err(_) => {
                        tracing::debug!(participant = %participant_uuid, "closing idle transcription session");
                        break false;
                    }
                }
            }
            event = session.events.recv() => {
                match event {
                    Some(event) => {
                        if !forward_event(event, &participant_uuid, &rebase, &events_tx).await {
                            break true;
                        }
                    }
                    None => break true,
                }
            }
        }
    };

    if failed {
        return;
    }

    // Graceful drain: tell the provider we are done and collect finals
    // until Closed, an error, or the drain window runs out.
    if session.sink.close().await.is_err() {
        return;
    }
    let drain = async {
        while let Some(event) = session.events.recv().await {
            if matches!(event, TranscriptEvent::Closed | TranscriptEvent::Error { .. }) {
                let _ = forward_event(event, &participant_uuid, &rebase, &events_tx).await;
                break;
            }
            let _ = forward_event(event, &participant_uuid, &rebase, &events_tx).await;
        }
    };
    if tokio::time::timeout(drain_window, drain).await.is_err() {
        tracing::warn!(participant = %participant_uuid, "session drain timed out");
    }
}

/// Translate one provider event; returns `false` when the session is
/// finished (error observed).
async fn forward_event(
    event: TranscriptEvent,
    participant_uuid: &str,
    rebase: &impl Fn(u64, u64, Vec<TranscriptWord>) -> (u64, Vec<TranscriptWord>),
    events_tx: &mpsc::Sender<CoordinatorEvent>,
) -> bool {
    match event {
        TranscriptEvent::Final {
            text,
            start_ms,
            duration_ms,
            words,
        } => {
            let (relative_timestamp_ms, words) = rebase(start_ms, duration_ms, words);
            let _ = events_tx
                .send(CoordinatorEvent::Utterance(SpeakerTranscript {
                    participant_uuid: participant_uuid.to_owned(),
                    relative_timestamp_ms,
                    duration_ms,
                    text,
                    words,
                }))
                .await;
            true
        }
        TranscriptEvent::Partial {
            text,
            start_ms,
            duration_ms,
            words,
        } => {
            let (relative_timestamp_ms, words) = rebase(start_ms, duration_ms, words);
            let _ = events_tx
                .send(CoordinatorEvent::Partial(SpeakerTranscript {
                    participant_uuid: participant_uuid.to_owned(),
                    relative_timestamp_ms,
                    duration_ms,
                    text,
                    words,
                }))
                .await;
            true
        }
        TranscriptEvent::Error { message } => {
            let _ = events_tx
                .send(CoordinatorEvent::SessionFailed {
                    participant_uuid: participant_uuid.to_owned(),
                    message,
                })
                .await;
            false
        }
        TranscriptEvent::Closed => false,
    }
}
