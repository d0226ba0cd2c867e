//! Deterministic scripted adapter.
//!
//! Plays a pre-built event script against the adapter contract on real
//! (tokio) time. Tests pause the clock and auto-advance; local
//! development gets a meeting that behaves like a meeting without any
//! platform credentials.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use qm_domain::Result;

use crate::{
    AdapterControls, AdapterEvent, AudioFrame, BotAdapter, OpenContext, ParticipantInfo,
};

/// House audio format used by the generated frames.
pub const SAMPLE_RATE: u32 = 48_000;
const FRAME_MS: u64 = 10;
const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE as usize / 1000) * FRAME_MS as usize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Script
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A timed list of adapter events, offsets in milliseconds from `open`.
#[derive(Debug, Clone, Default)]
pub struct SimScript {
    events: Vec<(u64, AdapterEvent)>,
}

impl SimScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, at_ms: u64, event: AdapterEvent) -> Self {
        self.events.push((at_ms, event));
        self
    }

    pub fn push(&mut self, at_ms: u64, event: AdapterEvent) {
        self.events.push((at_ms, event));
    }

    /// Sorted playback order.
    fn into_sorted(mut self) -> Vec<(u64, AdapterEvent)> {
        self.events.sort_by_key(|(at, _)| *at);
        self.events
    }

    /// A meeting that admits immediately, has `participants` attendees
    /// taking 5-second speaking turns with audible tones, and ends at
    /// `duration_ms`.
    pub fn happy_path(participants: usize, duration_ms: u64) -> Self {
        let mut script = SimScript::new().at(0, AdapterEvent::Admitted);

        for i in 0..participants {
            script.push(
                0,
                AdapterEvent::ParticipantJoined(ParticipantInfo {
                    uuid: format!("sim-{}", i + 1),
                    full_name: format!("Sim Participant {}", i + 1),
                    user_uuid: None,
                    is_host: i == 0,
                }),
            );
        }

        if participants > 0 {
            let turn_ms: u64 = 5_000;
            let mut t = 0u64;
            let mut speaker = 0usize;
            while t < duration_ms {
                let uuid = format!("sim-{}", speaker + 1);
                let end = (t + turn_ms).min(duration_ms);
                script.push(t, AdapterEvent::SpeechStart { uuid: uuid.clone(), ts_ms: t });
                let mut frame_ts = t;
                while frame_ts < end {
                    script.push(
                        frame_ts,
                        AdapterEvent::Audio(tone_frame(&uuid, frame_ts, 220.0 * (speaker + 1) as f32)),
                    );
                    frame_ts += FRAME_MS;
                }
                script.push(end, AdapterEvent::SpeechStop { uuid, ts_ms: end });
                speaker = (speaker + 1) % participants;
                t = end;
            }
        }

        script.at(duration_ms, AdapterEvent::MeetingEnded { ts_ms: duration_ms })
    }
}

/// One 10 ms sine frame for a participant.
fn tone_frame(uuid: &str, ts_ms: u64, freq: f32) -> AudioFrame {
    let mut pcm = Vec::with_capacity(SAMPLES_PER_FRAME);
    let t0 = ts_ms as f32 / 1000.0;
    for n in 0..SAMPLES_PER_FRAME {
        let t = t0 + n as f32 / SAMPLE_RATE as f32;
        let sample = (t * freq * 2.0 * std::f32::consts::PI).sin() * 8000.0;
        pcm.push(sample as i16);
    }
    AudioFrame {
        participant_uuid: uuid.to_owned(),
        pcm,
        sample_rate: SAMPLE_RATE,
        ts_ms,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Observable side effects of control calls, for tests.
#[derive(Debug, Default)]
pub struct SimState {
    pub recording_started: AtomicBool,
    pub pause_calls: AtomicU32,
    pub resume_calls: AtomicU32,
    pub leave_called: AtomicBool,
}

pub struct SimAdapter {
    script: parking_lot::Mutex<Option<SimScript>>,
    state: Arc<SimState>,
}

impl SimAdapter {
    pub fn new(script: SimScript) -> Self {
        Self {
            script: parking_lot::Mutex::new(Some(script)),
            state: Arc::new(SimState::default()),
        }
    }

    /// Control-call observations.
    pub fn state(&self) -> Arc<SimState> {
        self.state.clone()
    }
}

struct SimControls {
    state: Arc<SimState>,
    leave: CancellationToken,
}

#[async_trait::async_trait]
impl AdapterControls for SimControls {
    async fn start_recording(&self) -> Result<()> {
        self.state.recording_started.store(true, Ordering::Release);
        Ok(())
    }

    async fn pause_recording(&self) -> Result<()> {
        self.state.pause_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn resume_recording(&self) -> Result<()> {
        self.state.resume_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        self.state.leave_called.store(true, Ordering::Release);
        self.leave.cancel();
        Ok(())
    }
}

#[async_trait::async_trait]
impl BotAdapter for SimAdapter {
    async fn open(
        &self,
        ctx: OpenContext,
    ) -> Result<(mpsc::Receiver<AdapterEvent>, Box<dyn AdapterControls>)> {
        let script = self
            .script
            .lock()
            .take()
            .unwrap_or_else(|| SimScript::happy_path(2, 30_000));
        let (tx, rx) = mpsc::channel(256);
        let leave = CancellationToken::new();

        let controls = SimControls {
            state: self.state.clone(),
            leave: leave.clone(),
        };

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            for (at_ms, event) in script.into_sorted() {
                let due = started + Duration::from_millis(at_ms);
                tokio::select! {
                    _ = tokio::time::sleep_until(due) => {}
                    _ = leave.cancelled() => {
                        // The contract demands a prompt terminal event
                        // after leave().
                        let ts_ms = started.elapsed().as_millis() as u64;
                        let _ = tx.send(AdapterEvent::MeetingEnded { ts_ms }).await;
                        return;
                    }
                    _ = cancel.cancelled() => return,
                }
                let terminal = event.is_terminal();
                if tx.send(event).await.is_err() {
                    return;
                }
                if terminal {
                    return;
                }
            }
        });

        Ok((rx, Box::new(controls)))
    }

    fn kind(&self) -> &'static str {
        "sim"
    }
}
