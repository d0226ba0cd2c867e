//! The bot controller: one long-running supervisor per bot.
//!
//! Owns the state machine from JOINING to a terminal state, the media
//! pipeline, the transcription coordinator, heartbeats and auto-leave.
//! Everything funnels through one `select!` loop; cancellation cascades
//! from the leave decision to the adapter and the ASR sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use qm_adapter::{
    AdapterControls, AdapterEvent, BotAdapter, ChatTarget, OpenContext, ParticipantInfo,
};
use qm_domain::bot::{sub, BotState, EventKind};
use qm_domain::settings::TranscriptionProviderKind;
use qm_domain::trigger::TriggerType;
use qm_domain::{Error, Result};
use qm_pipeline::clock::MeetingClock;
use qm_pipeline::Pipeline;
use qm_store::{
    Bot, ChatRecipient, CredentialProvider, NewChatMessage, NewParticipantEvent, NewRecording,
    NewUtterance, Participant, ParticipantEventKind, Recording, RecordingPatch, RecordingState,
    Store, TransitionOutcome, TransitionRequest, TranscriptionState, Word,
};
use qm_transcribe::{
    CoordinatorEvent, DeepgramProvider, SimProvider, SpeakerTranscript,
    TranscriptionCoordinator, TranscriptionProvider,
};

use crate::billing::runtime_debit;
use crate::state::AppState;
use crate::worker::autoleave::AutoLeaveTracker;
use crate::worker::uploader;

const PIPELINE_TICK: Duration = Duration::from_millis(10);
const AUTOLEAVE_TICK: Duration = Duration::from_secs(1);

/// Run the worker for a bot looked up by its opaque id (the
/// `run-worker` entry point).
pub async fn run_worker(state: AppState, bot_object_id: &str) -> Result<()> {
    let bot = state.store.bot_by_object_id(bot_object_id).await?;
    run_bot(state, bot).await
}

/// Drive one bot from STAGED to a terminal state.
pub async fn run_bot(state: AppState, bot: Bot) -> Result<()> {
    if bot.state != BotState::Staged {
        // A relaunch raced an earlier worker; whoever holds the row wins.
        tracing::warn!(bot_id = %bot.object_id, state = %bot.state, "stale launch, exiting");
        return Ok(());
    }

    let Some(bot) = transition_and_emit(
        &state,
        bot.id,
        &[BotState::Staged],
        BotState::Joining,
        EventKind::JoinStarted,
        None,
        serde_json::Value::Null,
        None,
    )
    .await?
    else {
        return Ok(());
    };

    match Controller::build(state.clone(), bot.clone()).await {
        Ok((controller, events, coordinator_events)) => {
            controller.run(events, coordinator_events).await
        }
        Err(e) => {
            tracing::error!(bot_id = %bot.object_id, error = %e, "bot setup failed");
            let sub_state = match e {
                Error::Config(_) | Error::Credential(_) => sub::CONFIG_INVALID,
                _ => sub::ADAPTER_CRASH,
            };
            transition_and_emit(
                &state,
                bot.id,
                &[BotState::Joining],
                BotState::FatalError,
                EventKind::FatalError,
                Some(sub_state),
                serde_json::json!({ "error": e.to_string() }),
                None,
            )
            .await?;
            Ok(())
        }
    }
}

/// Apply a transition and, when it sticks, emit the state-change
/// webhook. Returns the updated bot, or `None` when the request was
/// stale.
#[allow(clippy::too_many_arguments)]
pub async fn transition_and_emit(
    state: &AppState,
    bot_id: Uuid,
    sources: &[BotState],
    to: BotState,
    event: EventKind,
    sub_state: Option<&str>,
    metadata: serde_json::Value,
    debit: Option<qm_store::CreditDebit>,
) -> Result<Option<Bot>> {
    let mut request = TransitionRequest::new(sources, to, event).metadata(metadata);
    if let Some(sub_state) = sub_state {
        request = request.sub(sub_state);
    }
    if let Some(debit) = debit {
        request = request.debit(debit);
    }

    match state.store.transition(bot_id, request).await? {
        TransitionOutcome::Applied {
            bot,
            event,
            credits_low,
        } => {
            tracing::info!(
                bot_id = %bot.object_id,
                from = %event.old_state,
                to = %event.new_state,
                sub = event.sub_type.as_deref().unwrap_or(""),
                "bot state changed"
            );
            let data = serde_json::json!({
                "old_state": event.old_state,
                "new_state": event.new_state,
                "sub_state": event.sub_type,
                "created_at": event.created_at.to_rfc3339(),
            });
            if let Err(e) = state
                .emitter
                .emit(bot.project_id, Some(&bot), TriggerType::BotStateChange, data)
                .await
            {
                tracing::warn!(error = %e, "state-change webhook enqueue failed");
            }
            if credits_low {
                notify_credits_low(state, bot.project_id).await;
            }
            Ok(Some(bot))
        }
        TransitionOutcome::Stale { current } => {
            tracing::debug!(bot_id = %bot_id, current = %current, to = %to, "transition was stale");
            Ok(None)
        }
    }
}

pub async fn notify_credits_low(state: &AppState, project_id: Uuid) {
    let credits = match state.store.organization_for_project(project_id).await {
        Ok(org) => org.credits_mc as f64 / 1000.0,
        Err(_) => return,
    };
    let data = serde_json::json!({ "credits": credits });
    if let Err(e) = state
        .emitter
        .emit(project_id, None, TriggerType::CreditsLow, data)
        .await
    {
        tracing::warn!(error = %e, "credits-low webhook enqueue failed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum LoopEnd {
    /// Adapter delivered (or implied) its terminal event after a leave.
    AdapterClosed,
    /// The shutdown guard expired before the adapter closed.
    GuardExpired,
    /// The adapter died irrecoverably.
    Fatal { message: String },
}

struct Controller {
    state: AppState,
    bot: Bot,
    controls: Box<dyn AdapterControls>,
    cancel: CancellationToken,
    pipeline: Pipeline,
    coordinator: Option<TranscriptionCoordinator>,
    recording: Recording,
    clock: MeetingClock,
    tracker: AutoLeaveTracker,
    participants: HashMap<String, Participant>,
    admitted_at: Option<Instant>,
    recording_started: bool,
    leaving_sub: Option<String>,
    utterances_stored: u64,
    transcription_failures: Vec<serde_json::Value>,
}

impl Controller {
    async fn build(
        state: AppState,
        bot: Bot,
    ) -> Result<(
        Self,
        mpsc::Receiver<AdapterEvent>,
        Option<mpsc::Receiver<CoordinatorEvent>>,
    )> {
        let adapter = state.adapters.get(bot.platform)?;
        let credentials = load_credentials(&state, &bot).await?;
        let cancel = CancellationToken::new();

        let (events, controls) = adapter
            .open(OpenContext {
                meeting_url: bot.meeting_url.clone(),
                bot_name: bot.name.clone(),
                credentials,
                settings: bot.settings.clone(),
                cancel: cancel.clone(),
            })
            .await?;

        let pipeline = Pipeline::new(
            &bot.settings,
            &state.config.media,
            &state.config.worker.scratch_dir.join(&bot.object_id),
            &bot.object_id,
        )?;

        let recording = state
            .store
            .create_recording(NewRecording {
                bot_id: bot.id,
                recording_type: bot.settings.recording_type,
                format: bot.settings.format,
                is_default: true,
                participant_uuid: None,
            })
            .await?;

        let (coordinator, coordinator_events) = if bot.settings.transcription.enabled {
            let provider: Arc<dyn TranscriptionProvider> =
                match bot.settings.transcription.provider {
                    TranscriptionProviderKind::Simulated => Arc::new(SimProvider::new()),
                    TranscriptionProviderKind::Deepgram => {
                        let key = deepgram_key(&state, &bot).await?;
                        Arc::new(DeepgramProvider::new(
                            state.config.transcription.deepgram.clone(),
                            key,
                        )?)
                    }
                };
            let (coordinator, events) = TranscriptionCoordinator::new(
                provider,
                qm_transcribe::coordinator::CoordinatorConfig {
                    language: bot.settings.transcription.language.clone(),
                    sample_rate: qm_pipeline::clock::HOUSE_RATE,
                    idle_close: Duration::from_secs(state.config.transcription.idle_close_secs),
                    flush: Duration::from_secs(state.config.transcription.flush_secs),
                    queue_frames: state.config.transcription.queue_frames,
                },
            );
            (Some(coordinator), Some(events))
        } else {
            (None, None)
        };

        let tracker = AutoLeaveTracker::new(bot.settings.auto_leave);
        Ok((
            Self {
                state,
                bot,
                controls,
                cancel,
                pipeline,
                coordinator,
                recording,
                clock: MeetingClock::new(),
                tracker,
                participants: HashMap::new(),
                admitted_at: None,
                recording_started: false,
                leaving_sub: None,
                utterances_stored: 0,
                transcription_failures: Vec::new(),
            },
            events,
            coordinator_events,
        ))
    }

    async fn run(
        mut self,
        mut adapter_events: mpsc::Receiver<AdapterEvent>,
        mut coordinator_events: Option<mpsc::Receiver<CoordinatorEvent>>,
    ) -> Result<()> {
        let mut pipeline_tick = tokio::time::interval(PIPELINE_TICK);
        pipeline_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            self.state.config.worker.heartbeat_interval_secs,
        ));
        let mut autoleave = tokio::time::interval(AUTOLEAVE_TICK);
        let mut guard_deadline: Option<Instant> = None;

        let end = loop {
            tokio::select! {
                event = adapter_events.recv() => {
                    match event {
                        Some(event) => {
                            if let Some(end) = self.on_adapter_event(event).await? {
                                break end;
                            }
                        }
                        None => {
                            // Stream closed. Clean when we were leaving,
                            // fatal otherwise.
                            break if self.leaving_sub.is_some() {
                                LoopEnd::AdapterClosed
                            } else {
                                LoopEnd::Fatal {
                                    message: "adapter stream closed unexpectedly".into(),
                                }
                            };
                        }
                    }
                }
                Some(event) = recv_opt(&mut coordinator_events) => {
                    self.on_coordinator_event(event).await?;
                }
                _ = pipeline_tick.tick() => {
                    self.pipeline.tick()?;
                }
                _ = heartbeat.tick() => {
                    self.on_heartbeat().await?;
                }
                _ = autoleave.tick() => {
                    if self.leaving_sub.is_none() {
                        if let Some(reason) = self.tracker.evaluate(Instant::now()) {
                            tracing::info!(bot_id = %self.bot.object_id, reason = ?reason, "auto-leave");
                            self.begin_leave(reason.sub_state(), EventKind::AutoLeave).await?;
                            guard_deadline = Some(self.guard_deadline());
                        }
                    }
                }
                _ = sleep_opt(guard_deadline) => {
                    tracing::warn!(bot_id = %self.bot.object_id, "shutdown guard expired, forcing post-processing");
                    break LoopEnd::GuardExpired;
                }
            }

            // A leave initiated inside a handler arms the guard too.
            if self.leaving_sub.is_some() && guard_deadline.is_none() {
                guard_deadline = Some(self.guard_deadline());
            }
        };

        self.finish(end).await
    }

    fn guard_deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.state.config.worker.shutdown_guard_secs)
    }

    // ── Adapter events ───────────────────────────────────────────────

    async fn on_adapter_event(&mut self, event: AdapterEvent) -> Result<Option<LoopEnd>> {
        match event {
            AdapterEvent::Admitted => {
                self.tracker.on_admitted();
                self.admitted_at = Some(Instant::now());
                let applied = transition_and_emit(
                    &self.state,
                    self.bot.id,
                    &[BotState::Joining],
                    BotState::JoinedNotRecording,
                    EventKind::Admitted,
                    None,
                    serde_json::Value::Null,
                    None,
                )
                .await?;
                if applied.is_some() && self.bot.settings.auto_start_recording {
                    self.start_recording().await?;
                }
            }
            AdapterEvent::Rejected { reason } => {
                tracing::warn!(bot_id = %self.bot.object_id, reason = %reason, "join rejected");
                self.begin_leave(sub::REJECTED, EventKind::Rejected).await?;
            }
            AdapterEvent::ParticipantJoined(info) => {
                self.on_participant_joined(info).await?;
            }
            AdapterEvent::ParticipantLeft { uuid, ts_ms } => {
                self.tracker.on_participant_leave(&uuid);
                self.pipeline.participant_left(&uuid);
                let occurred = self.clock.relative_ms(ts_ms);
                self.record_participant_event(
                    &uuid,
                    ParticipantEventKind::Leave,
                    serde_json::Value::Null,
                    occurred,
                )
                .await?;
            }
            AdapterEvent::SpeechStart { uuid, ts_ms } => {
                self.tracker.on_speech();
                let occurred = self.clock.relative_ms(ts_ms);
                self.record_participant_event(
                    &uuid,
                    ParticipantEventKind::SpeechStart,
                    serde_json::Value::Null,
                    occurred,
                )
                .await?;
            }
            AdapterEvent::SpeechStop { uuid, ts_ms } => {
                self.tracker.on_speech();
                let occurred = self.clock.relative_ms(ts_ms);
                self.record_participant_event(
                    &uuid,
                    ParticipantEventKind::SpeechStop,
                    serde_json::Value::Null,
                    occurred,
                )
                .await?;
            }
            AdapterEvent::ScreenshareStart { uuid, ts_ms } => {
                let occurred = self.clock.relative_ms(ts_ms);
                self.record_participant_event(
                    &uuid,
                    ParticipantEventKind::ScreenshareStart,
                    serde_json::Value::Null,
                    occurred,
                )
                .await?;
            }
            AdapterEvent::ScreenshareStop { uuid, ts_ms } => {
                let occurred = self.clock.relative_ms(ts_ms);
                self.record_participant_event(
                    &uuid,
                    ParticipantEventKind::ScreenshareStop,
                    serde_json::Value::Null,
                    occurred,
                )
                .await?;
            }
            AdapterEvent::Audio(frame) => {
                let rel_ts_ms = self.clock.relative_ms(frame.ts_ms);
                self.pipeline.ingest_audio(&frame);
                if self.recording_started && !self.pipeline.is_paused() {
                    if let Some(coordinator) = &mut self.coordinator {
                        let pcm = qm_pipeline::resample::resample(
                            &frame.pcm,
                            frame.sample_rate,
                            qm_pipeline::clock::HOUSE_RATE,
                        );
                        coordinator.feed(&frame.participant_uuid, rel_ts_ms, pcm).await;
                    }
                }
            }
            AdapterEvent::Video(frame) => {
                self.pipeline.ingest_video(&frame);
            }
            AdapterEvent::Chat {
                participant_uuid,
                text,
                to,
                ts_ms: _,
            } => {
                self.on_chat(&participant_uuid, text, to).await?;
            }
            AdapterEvent::MeetingEnded { .. } => {
                self.begin_leave(sub::MEETING_ENDED, EventKind::MeetingEnded).await?;
                return Ok(Some(LoopEnd::AdapterClosed));
            }
            AdapterEvent::Kicked { .. } => {
                self.begin_leave(sub::KICKED, EventKind::Kicked).await?;
                return Ok(Some(LoopEnd::AdapterClosed));
            }
            AdapterEvent::FatalError { message } => {
                return Ok(Some(LoopEnd::Fatal { message }));
            }
        }
        Ok(None)
    }

    async fn on_participant_joined(&mut self, info: ParticipantInfo) -> Result<()> {
        self.tracker.on_participant_join(&info.uuid);
        self.pipeline.participant_joined(&info.uuid, &info.full_name);
        let participant = self
            .state
            .store
            .upsert_participant(
                self.bot.id,
                &info.uuid,
                &info.full_name,
                info.user_uuid.as_deref(),
                info.is_host,
            )
            .await?;
        self.participants.insert(info.uuid.clone(), participant);
        let occurred = self.meeting_elapsed_ms();
        self.record_participant_event(
            &info.uuid,
            ParticipantEventKind::Join,
            serde_json::json!({ "full_name": info.full_name }),
            occurred,
        )
        .await
    }

    /// Wall-clock milliseconds since admission; 0 before it.
    fn meeting_elapsed_ms(&self) -> u64 {
        self.admitted_at
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    async fn participant(&mut self, uuid: &str) -> Result<Participant> {
        if let Some(participant) = self.participants.get(uuid) {
            return Ok(participant.clone());
        }
        // Event before the join notification: register with what we have.
        let participant = self
            .state
            .store
            .upsert_participant(self.bot.id, uuid, "", None, false)
            .await?;
        self.participants.insert(uuid.to_owned(), participant.clone());
        Ok(participant)
    }

    async fn record_participant_event(
        &mut self,
        uuid: &str,
        kind: ParticipantEventKind,
        event_data: serde_json::Value,
        occurred_at_ms: u64,
    ) -> Result<()> {
        let participant = self.participant(uuid).await?;
        let event = self
            .state
            .store
            .append_participant_event(NewParticipantEvent {
                bot_id: self.bot.id,
                participant_id: participant.id,
                kind,
                event_data,
                occurred_at_ms,
            })
            .await?;
        let data = serde_json::json!({
            "participant_uuid": uuid,
            "kind": event.kind,
            "occurred_at_ms": event.occurred_at_ms,
            "event_data": event.event_data,
        });
        if let Err(e) = self
            .state
            .emitter
            .emit(self.bot.project_id, Some(&self.bot), kind.trigger(), data)
            .await
        {
            tracing::warn!(error = %e, "participant-event webhook enqueue failed");
        }
        Ok(())
    }

    async fn on_chat(
        &mut self,
        participant_uuid: &str,
        text: String,
        to: ChatTarget,
    ) -> Result<()> {
        let participant = self.participant(participant_uuid).await?;
        let message = self
            .state
            .store
            .append_chat_message(NewChatMessage {
                bot_id: self.bot.id,
                participant_id: participant.id,
                text,
                to: match to {
                    ChatTarget::Everyone => ChatRecipient::Everyone,
                    ChatTarget::OnlyBot => ChatRecipient::OnlyBot,
                },
                additional_data: serde_json::Value::Null,
            })
            .await?;
        let data = serde_json::json!({
            "message_id": message.object_id,
            "participant_uuid": participant_uuid,
            "text": message.text,
            "to": message.to,
        });
        if let Err(e) = self
            .state
            .emitter
            .emit(
                self.bot.project_id,
                Some(&self.bot),
                TriggerType::ChatMessagesUpdate,
                data,
            )
            .await
        {
            tracing::warn!(error = %e, "chat webhook enqueue failed");
        }
        Ok(())
    }

    // ── Recording control ────────────────────────────────────────────

    async fn start_recording(&mut self) -> Result<()> {
        let applied = transition_and_emit(
            &self.state,
            self.bot.id,
            &[BotState::JoinedNotRecording],
            BotState::JoinedRecording,
            EventKind::RecordingStarted,
            None,
            serde_json::Value::Null,
            None,
        )
        .await?;
        if applied.is_none() {
            return Ok(());
        }
        self.recording_started = true;
        self.pipeline.start_recording();
        self.controls.start_recording().await?;
        self.recording = self
            .state
            .store
            .update_recording(
                self.recording.id,
                RecordingPatch {
                    state: Some(RecordingState::InProgress),
                    started_at: Some(chrono::Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn pause_recording(&mut self) -> Result<()> {
        let applied = transition_and_emit(
            &self.state,
            self.bot.id,
            &[BotState::JoinedRecording],
            BotState::Paused,
            EventKind::RecordingPaused,
            None,
            serde_json::Value::Null,
            None,
        )
        .await?;
        if applied.is_none() {
            return Ok(());
        }
        self.pipeline.pause();
        self.controls.pause_recording().await?;
        self.recording = self
            .state
            .store
            .update_recording(
                self.recording.id,
                RecordingPatch {
                    state: Some(RecordingState::Paused),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn resume_recording(&mut self) -> Result<()> {
        let applied = transition_and_emit(
            &self.state,
            self.bot.id,
            &[BotState::Paused],
            BotState::JoinedRecording,
            EventKind::RecordingResumed,
            None,
            serde_json::Value::Null,
            None,
        )
        .await?;
        if applied.is_none() {
            return Ok(());
        }
        self.pipeline.resume();
        self.controls.resume_recording().await?;
        self.recording = self
            .state
            .store
            .update_recording(
                self.recording.id,
                RecordingPatch {
                    state: Some(RecordingState::InProgress),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    // ── Heartbeat & desired actions ──────────────────────────────────

    async fn on_heartbeat(&mut self) -> Result<()> {
        self.state.store.heartbeat(self.bot.id).await?;
        let current = self.state.store.bot(self.bot.id).await?;
        let Some(action) = current.desired_action else {
            return Ok(());
        };
        self.state.store.set_desired_action(self.bot.id, None).await?;
        match action {
            qm_store::DesiredAction::Leave => {
                self.begin_leave(sub::LEAVE_REQUESTED, EventKind::LeaveRequested).await?;
            }
            qm_store::DesiredAction::PauseRecording => self.pause_recording().await?,
            qm_store::DesiredAction::ResumeRecording => self.resume_recording().await?,
        }
        Ok(())
    }

    // ── Transcription results ────────────────────────────────────────

    async fn on_coordinator_event(&mut self, event: CoordinatorEvent) -> Result<()> {
        match event {
            CoordinatorEvent::Utterance(utterance) => self.store_utterance(utterance).await?,
            CoordinatorEvent::Partial(partial) => {
                self.state.partials.update(self.bot.id, partial);
            }
            CoordinatorEvent::SessionFailed {
                participant_uuid,
                message,
            } => {
                tracing::warn!(participant = %participant_uuid, message = %message, "transcription session failed");
                self.transcription_failures.push(serde_json::json!({
                    "participant_uuid": participant_uuid,
                    "error": message,
                }));
            }
            CoordinatorEvent::AudioDropped {
                participant_uuid,
                frames,
            } => {
                self.transcription_failures.push(serde_json::json!({
                    "participant_uuid": participant_uuid,
                    "dropped_frames": frames,
                }));
            }
        }
        Ok(())
    }

    async fn store_utterance(&mut self, utterance: SpeakerTranscript) -> Result<()> {
        let participant = self.participant(&utterance.participant_uuid).await?;
        let words = utterance
            .words
            .iter()
            .map(|w| Word {
                word: w.word.clone(),
                start_ms: w.start_ms,
                end_ms: w.end_ms,
                confidence: w.confidence,
            })
            .collect();
        self.state
            .store
            .append_utterance(NewUtterance {
                recording_id: self.recording.id,
                participant_id: participant.id,
                relative_timestamp_ms: utterance.relative_timestamp_ms,
                duration_ms: utterance.duration_ms,
                transcript: utterance.text.clone(),
                words,
            })
            .await?;
        self.utterances_stored += 1;
        self.state
            .partials
            .clear_participant(self.bot.id, &utterance.participant_uuid);

        if self.utterances_stored == 1 {
            self.state
                .store
                .update_recording(
                    self.recording.id,
                    RecordingPatch {
                        transcription_state: Some(TranscriptionState::InProgress),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let data = serde_json::json!({
            "participant_uuid": utterance.participant_uuid,
            "relative_timestamp_ms": utterance.relative_timestamp_ms,
            "duration_ms": utterance.duration_ms,
            "transcript": utterance.text,
        });
        if let Err(e) = self
            .state
            .emitter
            .emit(
                self.bot.project_id,
                Some(&self.bot),
                TriggerType::TranscriptUpdate,
                data,
            )
            .await
        {
            tracing::warn!(error = %e, "transcript webhook enqueue failed");
        }
        Ok(())
    }

    // ── Leave & shutdown ─────────────────────────────────────────────

    async fn begin_leave(&mut self, sub_state: &str, event: EventKind) -> Result<()> {
        if self.leaving_sub.is_some() {
            return Ok(());
        }
        let applied = transition_and_emit(
            &self.state,
            self.bot.id,
            &[
                BotState::Joining,
                BotState::JoinedNotRecording,
                BotState::JoinedRecording,
                BotState::Paused,
            ],
            BotState::Leaving,
            event,
            Some(sub_state),
            serde_json::Value::Null,
            None,
        )
        .await?;
        if applied.is_none() {
            return Ok(());
        }
        self.leaving_sub = Some(sub_state.to_owned());
        if let Err(e) = self.controls.leave().await {
            tracing::warn!(error = %e, "adapter leave failed; relying on the shutdown guard");
        }
        Ok(())
    }

    /// Post-processing: flush, upload, debit, terminal transition.
    async fn finish(self, end: LoopEnd) -> Result<()> {
        let Self {
            state,
            bot,
            controls: _controls,
            cancel,
            pipeline,
            coordinator,
            recording,
            clock: _,
            tracker: _,
            participants: _,
            admitted_at,
            recording_started,
            mut leaving_sub,
            utterances_stored,
            transcription_failures,
        } = self;

        let fatal_message = match end {
            LoopEnd::Fatal { message } => Some(message),
            LoopEnd::AdapterClosed => None,
            LoopEnd::GuardExpired => {
                leaving_sub = Some(sub::SHUTDOWN_GUARD_EXPIRED.to_owned());
                None
            }
        };

        // Fatal adapter deaths still finalize whatever was captured; a
        // debug screenshot goes out first while the compositor state is
        // warm.
        if let Some(message) = &fatal_message {
            if let Some(png) = pipeline.snapshot_png() {
                uploader::upload_debug_screenshot(&state, &bot, Uuid::new_v4(), png).await;
            }
            tracing::error!(bot_id = %bot.object_id, message = %message, "adapter fatal error");
        }

        // Stop the adapter I/O and wind down the ASR sessions within the
        // flush budget.
        cancel.cancel();
        if let Some(coordinator) = coordinator {
            coordinator.flush().await;
        }

        let duration_ms = admitted_at
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let output = pipeline.finalize()?;

        if fatal_message.is_none() {
            // LEAVING (or forced) → POST_PROCESSING → ENDED.
            transition_and_emit(
                &state,
                bot.id,
                &[BotState::Leaving],
                BotState::PostProcessing,
                EventKind::AdapterClosed,
                leaving_sub.as_deref(),
                serde_json::Value::Null,
                None,
            )
            .await?;
        }

        let recording =
            uploader::finalize_recording(&state, &bot, &recording, output, recording_started)
                .await?;
        settle_transcription_state(
            &state,
            &recording,
            bot.settings.transcription.enabled,
            utterances_stored,
            &transcription_failures,
        )
        .await?;

        let debit = runtime_debit(
            &state.config.billing,
            bot.platform,
            bot.settings.recording_type,
            duration_ms,
        );

        match fatal_message {
            None => {
                let metadata = serde_json::json!({
                    "duration_ms": duration_ms,
                    "recording_state": recording.state,
                    "frames_dropped": recording.frames_dropped,
                });
                transition_and_emit(
                    &state,
                    bot.id,
                    &[BotState::PostProcessing],
                    BotState::Ended,
                    EventKind::ArtifactsFinalized,
                    leaving_sub.as_deref(),
                    metadata,
                    debit,
                )
                .await?;
            }
            Some(message) => {
                let metadata = serde_json::json!({
                    "duration_ms": duration_ms,
                    "recording_state": recording.state,
                    "error": message,
                });
                transition_and_emit(
                    &state,
                    bot.id,
                    &[
                        BotState::Joining,
                        BotState::JoinedNotRecording,
                        BotState::JoinedRecording,
                        BotState::Paused,
                        BotState::Leaving,
                    ],
                    BotState::FatalError,
                    EventKind::FatalError,
                    Some(sub::ADAPTER_CRASH),
                    metadata,
                    debit,
                )
                .await?;
            }
        }

        state.partials.clear_bot(bot.id);
        Ok(())
    }
}

async fn settle_transcription_state(
    state: &AppState,
    recording: &Recording,
    enabled: bool,
    utterances_stored: u64,
    failures: &[serde_json::Value],
) -> Result<()> {
    let transcription_state = if !enabled {
        TranscriptionState::NotStarted
    } else if utterances_stored > 0 {
        TranscriptionState::Complete
    } else if failures.is_empty() {
        TranscriptionState::NotStarted
    } else {
        TranscriptionState::Failed
    };
    let failure_data =
        (!failures.is_empty()).then(|| serde_json::json!({ "transcription": failures }));
    state
        .store
        .update_recording(
            recording.id,
            RecordingPatch {
                transcription_state: Some(transcription_state),
                failure_data,
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

// ── select! helpers ─────────────────────────────────────────────────

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn load_credentials(state: &AppState, bot: &Bot) -> Result<serde_json::Value> {
    let provider = match bot.platform {
        qm_domain::platform::Platform::ZoomNative
        | qm_domain::platform::Platform::ZoomWeb
        | qm_domain::platform::Platform::ZoomRtms => CredentialProvider::ZoomOauth,
        qm_domain::platform::Platform::Teams => CredentialProvider::TeamsBot,
        qm_domain::platform::Platform::GoogleMeet => return Ok(serde_json::Value::Null),
    };
    let Some(credential) = state.store.credential(bot.project_id, provider).await? else {
        return Ok(serde_json::Value::Null);
    };
    let Some(cipher) = &state.credential_cipher else {
        return Err(Error::Credential(
            "credential present but no credential key is configured".into(),
        ));
    };
    cipher.open(&credential.ciphertext)
}

async fn deepgram_key(state: &AppState, bot: &Bot) -> Result<Option<String>> {
    let Some(credential) = state
        .store
        .credential(bot.project_id, CredentialProvider::Deepgram)
        .await?
    else {
        return Ok(None);
    };
    let Some(cipher) = &state.credential_cipher else {
        return Err(Error::Credential(
            "credential present but no credential key is configured".into(),
        ));
    };
    let secret = cipher.open(&credential.ciphertext)?;
    Ok(secret["api_key"].as_str().map(str::to_owned))
}
