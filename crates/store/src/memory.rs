//! In-memory reference implementation of [`Store`].
//!
//! Used by tests and local development. Bot-row locking is a map of
//! per-bot async mutexes; the shared maps sit behind one `parking_lot`
//! RwLock held only for short synchronous sections. Bot events can be
//! mirrored to an append-only JSONL file for post-mortem debugging.

use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use qm_domain::bot::{BotKind, BotState};
use qm_domain::{ids, Error, Result};

use crate::model::*;
use crate::store::*;

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    organizations: HashMap<Uuid, Organization>,
    projects: HashMap<Uuid, Project>,
    credentials: HashMap<(Uuid, CredentialProvider), Credential>,
    bots: HashMap<Uuid, Bot>,
    bots_by_object_id: HashMap<String, Uuid>,
    bot_events: HashMap<Uuid, Vec<BotEvent>>,
    recordings: HashMap<Uuid, Recording>,
    participants: HashMap<Uuid, Participant>,
    participant_events: HashMap<Uuid, Vec<ParticipantEvent>>,
    utterances: HashMap<Uuid, Vec<Utterance>>,
    chat_messages: HashMap<Uuid, Vec<ChatMessage>>,
    subscriptions: HashMap<Uuid, WebhookSubscription>,
    deliveries: HashMap<Uuid, WebhookDeliveryAttempt>,
    /// Delivery ids handed out by `claim_due_deliveries` and not yet
    /// resolved (the skip-locked set).
    claimed_deliveries: HashSet<Uuid>,
    debug_artifacts: Vec<DebugArtifact>,
    leases: HashMap<u32, Lease>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// Per-bot row locks; transitions serialize here before touching the
    /// shared maps.
    row_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    /// Monotonic enqueue sequence for delivery ordering.
    delivery_seq: AtomicU64,
    /// Optional JSONL mirror of the bot-event log.
    event_log: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            row_locks: Mutex::new(HashMap::new()),
            delivery_seq: AtomicU64::new(1),
            event_log: None,
        }
    }

    /// Mirror bot events to `dir/events.jsonl`.
    pub fn with_event_log(dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut store = Self::new();
        store.event_log = Some(dir.join("events.jsonl"));
        Ok(store)
    }

    fn row_lock(&self, bot_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.row_locks
            .lock()
            .entry(bot_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn persist_event(&self, event: &BotEvent) {
        let Some(path) = &self.event_log else {
            return;
        };
        if let Ok(json) = serde_json::to_string(event) {
            if let Ok(mut f) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                let _ = writeln!(f, "{json}");
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    // ── Tenancy ──────────────────────────────────────────────────────

    async fn create_organization(&self, name: &str, credits_mc: i64) -> Result<Organization> {
        let org = Organization {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            credits_mc,
            allow_negative_credits: false,
            low_credit_threshold_mc: 10_000,
            low_credit_notified: false,
            created_at: Utc::now(),
        };
        self.inner.write().organizations.insert(org.id, org.clone());
        Ok(org)
    }

    async fn organization(&self, id: Uuid) -> Result<Organization> {
        self.inner
            .read()
            .organizations
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("organization {id}")))
    }

    async fn organization_for_project(&self, project_id: Uuid) -> Result<Organization> {
        let inner = self.inner.read();
        let project = inner
            .projects
            .get(&project_id)
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
        inner
            .organizations
            .get(&project.organization_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("organization {}", project.organization_id)))
    }

    async fn adjust_credits(&self, organization_id: Uuid, delta_mc: i64) -> Result<i64> {
        let mut inner = self.inner.write();
        let org = inner
            .organizations
            .get_mut(&organization_id)
            .ok_or_else(|| Error::NotFound(format!("organization {organization_id}")))?;
        org.credits_mc += delta_mc;
        if org.credits_mc > org.low_credit_threshold_mc {
            org.low_credit_notified = false;
        }
        Ok(org.credits_mc)
    }

    async fn set_allow_negative_credits(&self, organization_id: Uuid, allow: bool) -> Result<()> {
        let mut inner = self.inner.write();
        let org = inner
            .organizations
            .get_mut(&organization_id)
            .ok_or_else(|| Error::NotFound(format!("organization {organization_id}")))?;
        org.allow_negative_credits = allow;
        Ok(())
    }

    async fn create_project(&self, organization_id: Uuid, name: &str) -> Result<Project> {
        let mut inner = self.inner.write();
        if !inner.organizations.contains_key(&organization_id) {
            return Err(Error::NotFound(format!("organization {organization_id}")));
        }
        let project = Project {
            id: Uuid::new_v4(),
            organization_id,
            name: name.to_owned(),
            created_at: Utc::now(),
        };
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn project(&self, id: Uuid) -> Result<Project> {
        self.inner
            .read()
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("project {id}")))
    }

    // ── Credentials ──────────────────────────────────────────────────

    async fn put_credential(
        &self,
        project_id: Uuid,
        provider: CredentialProvider,
        ciphertext: String,
    ) -> Result<Credential> {
        let mut inner = self.inner.write();
        if !inner.projects.contains_key(&project_id) {
            return Err(Error::NotFound(format!("project {project_id}")));
        }
        let credential = Credential {
            id: Uuid::new_v4(),
            project_id,
            provider,
            ciphertext,
            created_at: Utc::now(),
        };
        inner
            .credentials
            .insert((project_id, provider), credential.clone());
        Ok(credential)
    }

    async fn credential(
        &self,
        project_id: Uuid,
        provider: CredentialProvider,
    ) -> Result<Option<Credential>> {
        Ok(self
            .inner
            .read()
            .credentials
            .get(&(project_id, provider))
            .cloned())
    }

    // ── Bots ─────────────────────────────────────────────────────────

    async fn create_bot(&self, new: NewBot) -> Result<Created> {
        let mut inner = self.inner.write();
        if !inner.projects.contains_key(&new.project_id) {
            return Err(Error::NotFound(format!("project {}", new.project_id)));
        }

        // Dedup: a non-terminal bot with the same key in the same project
        // is returned as-is, with no side effects.
        if let Some(key) = &new.deduplication_key {
            if let Some(existing) = inner.bots.values().find(|b| {
                b.project_id == new.project_id
                    && !b.state.is_terminal()
                    && b.deduplication_key.as_deref() == Some(key.as_str())
            }) {
                return Ok(Created::Existing(existing.clone()));
            }
        }

        let platform = qm_domain::platform::Platform::from_meeting_url(
            &new.meeting_url,
            new.settings.prefer_zoom_web,
        )
        .ok_or_else(|| Error::Config(format!("unsupported meeting URL: {}", new.meeting_url)))?;

        let now = Utc::now();
        let state = if new.join_at.is_some() {
            BotState::Scheduled
        } else {
            BotState::Ready
        };
        let object_id = match new.kind {
            BotKind::Meeting => ids::bot_object_id(),
            BotKind::AppSession => ids::app_session_object_id(),
        };

        let bot = Bot {
            id: Uuid::new_v4(),
            object_id: object_id.clone(),
            project_id: new.project_id,
            kind: new.kind,
            meeting_url: new.meeting_url,
            platform,
            name: new.name,
            state,
            sub_state: None,
            join_at: new.join_at,
            deduplication_key: new.deduplication_key,
            settings: new.settings,
            metadata: new.metadata,
            desired_action: None,
            heartbeat_at: None,
            first_ready_at: (state == BotState::Ready).then_some(now),
            launch_attempts: 0,
            created_at: now,
            updated_at: now,
        };
        inner.bots.insert(bot.id, bot.clone());
        inner.bots_by_object_id.insert(object_id, bot.id);
        inner.bot_events.insert(bot.id, Vec::new());
        Ok(Created::New(bot))
    }

    async fn bot(&self, id: Uuid) -> Result<Bot> {
        self.inner
            .read()
            .bots
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("bot {id}")))
    }

    async fn bot_by_object_id(&self, object_id: &str) -> Result<Bot> {
        let inner = self.inner.read();
        let id = inner
            .bots_by_object_id
            .get(object_id)
            .ok_or_else(|| Error::NotFound(format!("bot {object_id}")))?;
        Ok(inner.bots[id].clone())
    }

    async fn list_bots(&self, project_id: Uuid) -> Result<Vec<Bot>> {
        let mut bots: Vec<Bot> = self
            .inner
            .read()
            .bots
            .values()
            .filter(|b| b.project_id == project_id)
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.created_at);
        Ok(bots)
    }

    async fn transition(&self, bot_id: Uuid, req: TransitionRequest) -> Result<TransitionOutcome> {
        // Row lock first, then the shared maps: the same order everywhere,
        // so concurrent transitions on one bot serialize here.
        let lock = self.row_lock(bot_id);
        let _guard = lock.lock().await;

        let (event, credits_low);
        {
            let mut inner = self.inner.write();
            let bot = inner
                .bots
                .get(&bot_id)
                .ok_or_else(|| Error::NotFound(format!("bot {bot_id}")))?;

            let from = bot.state;
            if !req.expected_sources.contains(&from) || !from.can_transition(req.to) {
                tracing::debug!(
                    bot_id = %bot_id,
                    from = %from,
                    to = %req.to,
                    "dropping stale transition"
                );
                return Ok(TransitionOutcome::Stale { current: from });
            }

            let now = Utc::now();
            event = BotEvent {
                id: Uuid::new_v4(),
                bot_id,
                old_state: from,
                new_state: req.to,
                event_type: req.event,
                sub_type: req.sub_state.clone(),
                metadata: req.metadata.clone(),
                created_at: now,
            };

            let project_id = bot.project_id;
            let bot = inner.bots.get_mut(&bot_id).expect("checked above");
            bot.state = req.to;
            bot.sub_state = req.sub_state;
            bot.updated_at = now;
            if req.to == BotState::Ready && bot.first_ready_at.is_none() {
                bot.first_ready_at = Some(now);
            }
            inner
                .bot_events
                .get_mut(&bot_id)
                .expect("event log exists for every bot")
                .push(event.clone());

            // Terminal debit, in the same critical section as the event
            // append.
            credits_low = match (&req.debit, req.to.is_terminal()) {
                (Some(debit), true) => {
                    let org_id = inner
                        .projects
                        .get(&project_id)
                        .map(|p| p.organization_id)
                        .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
                    let org = inner
                        .organizations
                        .get_mut(&org_id)
                        .ok_or_else(|| Error::NotFound(format!("organization {org_id}")))?;
                    org.credits_mc -= debit.amount_mc;
                    let crossed =
                        org.credits_mc <= org.low_credit_threshold_mc && !org.low_credit_notified;
                    if crossed {
                        org.low_credit_notified = true;
                    }
                    crossed
                }
                (Some(_), false) => {
                    return Err(Error::Store(
                        "credit debit requires a terminal transition".into(),
                    ))
                }
                (None, _) => false,
            };
        }

        self.persist_event(&event);
        let bot = self.inner.read().bots[&bot_id].clone();
        Ok(TransitionOutcome::Applied {
            bot,
            event,
            credits_low,
        })
    }

    async fn bot_events(&self, bot_id: Uuid) -> Result<Vec<BotEvent>> {
        Ok(self
            .inner
            .read()
            .bot_events
            .get(&bot_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn heartbeat(&self, bot_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        let bot = inner
            .bots
            .get_mut(&bot_id)
            .ok_or_else(|| Error::NotFound(format!("bot {bot_id}")))?;
        bot.heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn set_desired_action(&self, bot_id: Uuid, action: Option<DesiredAction>) -> Result<()> {
        let mut inner = self.inner.write();
        let bot = inner
            .bots
            .get_mut(&bot_id)
            .ok_or_else(|| Error::NotFound(format!("bot {bot_id}")))?;
        bot.desired_action = action;
        Ok(())
    }

    async fn record_launch_attempt(&self, bot_id: Uuid) -> Result<u32> {
        let mut inner = self.inner.write();
        let bot = inner
            .bots
            .get_mut(&bot_id)
            .ok_or_else(|| Error::NotFound(format!("bot {bot_id}")))?;
        bot.launch_attempts += 1;
        Ok(bot.launch_attempts)
    }

    // ── Dispatcher queries ───────────────────────────────────────────

    async fn due_scheduled(&self, now: DateTime<Utc>, pre_roll: Duration) -> Result<Vec<Bot>> {
        let threshold = now + chrono::Duration::from_std(pre_roll).unwrap_or_default();
        let mut due: Vec<Bot> = self
            .inner
            .read()
            .bots
            .values()
            .filter(|b| {
                b.state == BotState::Scheduled
                    && b.join_at.map(|at| at <= threshold).unwrap_or(true)
            })
            .cloned()
            .collect();
        due.sort_by_key(|b| b.join_at);
        Ok(due)
    }

    async fn ready_bots(&self) -> Result<Vec<Bot>> {
        let mut ready: Vec<Bot> = self
            .inner
            .read()
            .bots
            .values()
            .filter(|b| b.state == BotState::Ready)
            .cloned()
            .collect();
        ready.sort_by_key(|b| b.first_ready_at);
        Ok(ready)
    }

    async fn stale_heartbeats(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<Bot>> {
        let cutoff = now - chrono::Duration::from_std(timeout).unwrap_or_default();
        Ok(self
            .inner
            .read()
            .bots
            .values()
            .filter(|b| {
                b.state.expects_heartbeat()
                    && b.heartbeat_at.map(|at| at < cutoff).unwrap_or_else(|| {
                        // Never heartbeated: measure from the transition
                        // into the current state.
                        b.updated_at < cutoff
                    })
            })
            .cloned()
            .collect())
    }

    // ── Leases ───────────────────────────────────────────────────────

    async fn try_acquire_lease(&self, shard: u32, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let lease = inner.leases.get(&shard);
        let free = match lease {
            None => true,
            Some(l) => l.holder == holder || l.expires_at <= now,
        };
        if free {
            inner.leases.insert(
                shard,
                Lease {
                    holder: holder.to_owned(),
                    expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
                },
            );
        }
        Ok(free)
    }

    async fn release_lease(&self, shard: u32, holder: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner
            .leases
            .get(&shard)
            .map(|l| l.holder == holder)
            .unwrap_or(false)
        {
            inner.leases.remove(&shard);
        }
        Ok(())
    }

    // ── Recordings ───────────────────────────────────────────────────

    async fn create_recording(&self, new: NewRecording) -> Result<Recording> {
        let mut inner = self.inner.write();
        if !inner.bots.contains_key(&new.bot_id) {
            return Err(Error::NotFound(format!("bot {}", new.bot_id)));
        }
        let recording = Recording {
            id: Uuid::new_v4(),
            bot_id: new.bot_id,
            state: RecordingState::NotStarted,
            transcription_state: TranscriptionState::NotStarted,
            recording_type: new.recording_type,
            format: new.format,
            is_default: new.is_default,
            participant_uuid: new.participant_uuid,
            storage_key: None,
            bytes: 0,
            duration_ms: 0,
            frames_dropped: 0,
            failure_data: None,
            started_at: None,
            completed_at: None,
        };
        inner.recordings.insert(recording.id, recording.clone());
        inner.utterances.insert(recording.id, Vec::new());
        Ok(recording)
    }

    async fn update_recording(&self, id: Uuid, patch: RecordingPatch) -> Result<Recording> {
        let mut inner = self.inner.write();
        let recording = inner
            .recordings
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("recording {id}")))?;
        if let Some(state) = patch.state {
            recording.state = state;
        }
        if let Some(state) = patch.transcription_state {
            recording.transcription_state = state;
        }
        if let Some(key) = patch.storage_key {
            recording.storage_key = Some(key);
        }
        if let Some(bytes) = patch.bytes {
            recording.bytes = bytes;
        }
        if let Some(duration) = patch.duration_ms {
            recording.duration_ms = duration;
        }
        if let Some(dropped) = patch.frames_dropped {
            recording.frames_dropped = dropped;
        }
        if let Some(failure) = patch.failure_data {
            recording.failure_data = Some(failure);
        }
        if let Some(at) = patch.started_at {
            recording.started_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            recording.completed_at = Some(at);
        }
        Ok(recording.clone())
    }

    async fn recordings_for_bot(&self, bot_id: Uuid) -> Result<Vec<Recording>> {
        let mut recordings: Vec<Recording> = self
            .inner
            .read()
            .recordings
            .values()
            .filter(|r| r.bot_id == bot_id)
            .cloned()
            .collect();
        recordings.sort_by_key(|r| (!r.is_default, r.participant_uuid.clone()));
        Ok(recordings)
    }

    // ── Participants / utterances / chat ─────────────────────────────

    async fn upsert_participant(
        &self,
        bot_id: Uuid,
        uuid: &str,
        full_name: &str,
        user_uuid: Option<&str>,
        is_host: bool,
    ) -> Result<Participant> {
        let mut inner = self.inner.write();
        if !inner.bots.contains_key(&bot_id) {
            return Err(Error::NotFound(format!("bot {bot_id}")));
        }
        if let Some(existing) = inner
            .participants
            .values_mut()
            .find(|p| p.bot_id == bot_id && p.uuid == uuid)
        {
            existing.full_name = full_name.to_owned();
            if let Some(user_uuid) = user_uuid {
                existing.user_uuid = Some(user_uuid.to_owned());
            }
            existing.is_host = is_host;
            return Ok(existing.clone());
        }
        let participant = Participant {
            id: Uuid::new_v4(),
            bot_id,
            uuid: uuid.to_owned(),
            full_name: full_name.to_owned(),
            user_uuid: user_uuid.map(str::to_owned),
            is_host,
            created_at: Utc::now(),
        };
        inner.participants.insert(participant.id, participant.clone());
        Ok(participant)
    }

    async fn participants(&self, bot_id: Uuid) -> Result<Vec<Participant>> {
        let mut participants: Vec<Participant> = self
            .inner
            .read()
            .participants
            .values()
            .filter(|p| p.bot_id == bot_id)
            .cloned()
            .collect();
        participants.sort_by_key(|p| p.created_at);
        Ok(participants)
    }

    async fn append_participant_event(
        &self,
        new: NewParticipantEvent,
    ) -> Result<ParticipantEvent> {
        let mut inner = self.inner.write();
        if !inner.participants.contains_key(&new.participant_id) {
            return Err(Error::NotFound(format!("participant {}", new.participant_id)));
        }
        let event = ParticipantEvent {
            id: Uuid::new_v4(),
            bot_id: new.bot_id,
            participant_id: new.participant_id,
            kind: new.kind,
            event_data: new.event_data,
            occurred_at_ms: new.occurred_at_ms,
            created_at: Utc::now(),
        };
        inner
            .participant_events
            .entry(new.bot_id)
            .or_default()
            .push(event.clone());
        Ok(event)
    }

    async fn participant_events(&self, bot_id: Uuid) -> Result<Vec<ParticipantEvent>> {
        Ok(self
            .inner
            .read()
            .participant_events
            .get(&bot_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_utterance(&self, new: NewUtterance) -> Result<Utterance> {
        let mut inner = self.inner.write();
        if !inner.recordings.contains_key(&new.recording_id) {
            return Err(Error::NotFound(format!("recording {}", new.recording_id)));
        }
        let utterance = Utterance {
            id: Uuid::new_v4(),
            recording_id: new.recording_id,
            participant_id: new.participant_id,
            relative_timestamp_ms: new.relative_timestamp_ms,
            duration_ms: new.duration_ms,
            transcript: new.transcript,
            words: new.words,
            created_at: Utc::now(),
        };
        inner
            .utterances
            .get_mut(&new.recording_id)
            .expect("utterance list exists for every recording")
            .push(utterance.clone());
        Ok(utterance)
    }

    async fn utterances(&self, recording_id: Uuid) -> Result<Vec<Utterance>> {
        let inner = self.inner.read();
        let mut utterances = inner
            .utterances
            .get(&recording_id)
            .cloned()
            .unwrap_or_default();
        // Meeting order, not arrival order; ties broken by the speaker's
        // platform uuid.
        utterances.sort_by(|a, b| {
            a.relative_timestamp_ms
                .cmp(&b.relative_timestamp_ms)
                .then_with(|| {
                    let ua = inner.participants.get(&a.participant_id).map(|p| &p.uuid);
                    let ub = inner.participants.get(&b.participant_id).map(|p| &p.uuid);
                    ua.cmp(&ub)
                })
        });
        Ok(utterances)
    }

    async fn append_chat_message(&self, new: NewChatMessage) -> Result<ChatMessage> {
        let mut inner = self.inner.write();
        if !inner.bots.contains_key(&new.bot_id) {
            return Err(Error::NotFound(format!("bot {}", new.bot_id)));
        }
        let message = ChatMessage {
            id: Uuid::new_v4(),
            object_id: ids::chat_message_object_id(),
            bot_id: new.bot_id,
            participant_id: new.participant_id,
            text: new.text,
            to: new.to,
            additional_data: new.additional_data,
            created_at: Utc::now(),
        };
        inner
            .chat_messages
            .entry(new.bot_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn chat_messages(&self, bot_id: Uuid) -> Result<Vec<ChatMessage>> {
        Ok(self
            .inner
            .read()
            .chat_messages
            .get(&bot_id)
            .cloned()
            .unwrap_or_default())
    }

    // ── Debug artifacts ──────────────────────────────────────────────

    async fn record_debug_artifact(
        &self,
        bot_id: Uuid,
        event_id: Uuid,
        storage_key: &str,
        content_type: &str,
    ) -> Result<DebugArtifact> {
        let artifact = DebugArtifact {
            id: Uuid::new_v4(),
            bot_id,
            event_id,
            storage_key: storage_key.to_owned(),
            content_type: content_type.to_owned(),
            created_at: Utc::now(),
        };
        self.inner.write().debug_artifacts.push(artifact.clone());
        Ok(artifact)
    }

    // ── Webhooks ─────────────────────────────────────────────────────

    async fn create_subscription(&self, new: NewSubscription) -> Result<WebhookSubscription> {
        let mut inner = self.inner.write();
        if !inner.projects.contains_key(&new.project_id) {
            return Err(Error::NotFound(format!("project {}", new.project_id)));
        }
        let subscription = WebhookSubscription {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            url: new.url,
            triggers: new.triggers,
            secret: new.secret,
            is_active: true,
            created_at: Utc::now(),
        };
        inner
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn subscriptions_for_project(
        &self,
        project_id: Uuid,
        active_only: bool,
    ) -> Result<Vec<WebhookSubscription>> {
        let mut subscriptions: Vec<WebhookSubscription> = self
            .inner
            .read()
            .subscriptions
            .values()
            .filter(|s| s.project_id == project_id && (!active_only || s.is_active))
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.created_at);
        Ok(subscriptions)
    }

    async fn subscription(&self, id: Uuid) -> Result<WebhookSubscription> {
        self.inner
            .read()
            .subscriptions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("subscription {id}")))
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .subscriptions
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("subscription {id}")))?;
        Ok(())
    }

    async fn enqueue_delivery(&self, new: NewDelivery) -> Result<WebhookDeliveryAttempt> {
        let mut inner = self.inner.write();
        if !inner.subscriptions.contains_key(&new.subscription_id) {
            return Err(Error::NotFound(format!("subscription {}", new.subscription_id)));
        }
        let attempt = WebhookDeliveryAttempt {
            id: Uuid::new_v4(),
            subscription_id: new.subscription_id,
            bot_id: new.bot_id,
            trigger: new.trigger,
            payload: new.payload,
            idempotency_key: new.idempotency_key,
            seq: self.delivery_seq.fetch_add(1, Ordering::SeqCst),
            attempt_count: 0,
            status: DeliveryStatus::Pending,
            response_body_list: Vec::new(),
            last_attempt_at: None,
            next_attempt_at: Utc::now(),
            succeeded_at: None,
            created_at: Utc::now(),
        };
        inner.deliveries.insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDeliveryAttempt>> {
        let mut inner = self.inner.write();
        let Inner {
            deliveries,
            claimed_deliveries,
            ..
        } = &mut *inner;

        let mut due: Vec<&WebhookDeliveryAttempt> = deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Pending
                    && d.next_attempt_at <= now
                    && !claimed_deliveries.contains(&d.id)
            })
            .collect();
        due.sort_by_key(|d| d.seq);

        let mut claimed = Vec::new();
        for candidate in due {
            if claimed.len() >= limit {
                break;
            }
            if candidate.trigger.is_ordered() {
                let key = (candidate.subscription_id, candidate.bot_id);
                // Ordered triggers go out one at a time, oldest first, per
                // (subscription, bot).
                let blocked = deliveries.values().any(|other| {
                    other.id != candidate.id
                        && other.trigger.is_ordered()
                        && (other.subscription_id, other.bot_id) == key
                        && other.status == DeliveryStatus::Pending
                        && (claimed_deliveries.contains(&other.id) || other.seq < candidate.seq)
                }) || claimed.iter().any(|c: &WebhookDeliveryAttempt| {
                    c.trigger.is_ordered() && (c.subscription_id, c.bot_id) == key
                });
                if blocked {
                    continue;
                }
            }
            claimed_deliveries.insert(candidate.id);
            claimed.push(candidate.clone());
        }
        Ok(claimed)
    }

    async fn record_delivery_result(&self, id: Uuid, result: DeliveryResult) -> Result<()> {
        let mut inner = self.inner.write();
        let attempt = inner
            .deliveries
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("delivery attempt {id}")))?;

        let now = Utc::now();
        attempt.attempt_count += 1;
        attempt.last_attempt_at = Some(now);
        attempt.response_body_list.push(result.response_body);

        if result.success {
            attempt.status = DeliveryStatus::Success;
            attempt.succeeded_at = Some(now);
        } else if result.exhausted {
            attempt.status = DeliveryStatus::Failure;
        } else if let Some(next) = result.next_attempt_at {
            attempt.next_attempt_at = next;
        }

        inner.claimed_deliveries.remove(&id);
        Ok(())
    }

    async fn delivery_attempts_for_bot(
        &self,
        bot_id: Uuid,
    ) -> Result<Vec<WebhookDeliveryAttempt>> {
        let mut attempts: Vec<WebhookDeliveryAttempt> = self
            .inner
            .read()
            .deliveries
            .values()
            .filter(|d| d.bot_id == Some(bot_id))
            .cloned()
            .collect();
        attempts.sort_by_key(|d| d.seq);
        Ok(attempts)
    }

    async fn delivery_attempts_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<WebhookDeliveryAttempt>> {
        let mut attempts: Vec<WebhookDeliveryAttempt> = self
            .inner
            .read()
            .deliveries
            .values()
            .filter(|d| d.subscription_id == subscription_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|d| d.seq);
        Ok(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qm_domain::bot::{sub, EventKind};
    use qm_domain::settings::BotSettings;

    async fn fixture(store: &MemoryStore) -> (Organization, Project) {
        let org = store.create_organization("acme", 100_000).await.unwrap();
        let project = store.create_project(org.id, "default").await.unwrap();
        (org, project)
    }

    fn new_bot(project_id: Uuid) -> NewBot {
        NewBot {
            project_id,
            kind: BotKind::Meeting,
            meeting_url: "https://zoom.us/j/123".into(),
            name: "Notetaker".into(),
            join_at: None,
            deduplication_key: None,
            settings: BotSettings::default(),
            metadata: serde_json::Value::Null,
        }
    }

    async fn drive_to(store: &MemoryStore, bot_id: Uuid, path: &[(BotState, BotState, EventKind)]) {
        for (from, to, event) in path {
            let outcome = store
                .transition(bot_id, TransitionRequest::new(&[*from], *to, *event))
                .await
                .unwrap();
            assert!(outcome.applied().is_some(), "{from} -> {to} rejected");
        }
    }

    #[tokio::test]
    async fn create_bot_without_join_at_is_ready() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let created = store.create_bot(new_bot(project.id)).await.unwrap();
        assert!(created.is_new());
        assert_eq!(created.bot().state, BotState::Ready);
        assert!(created.bot().object_id.starts_with("bot_"));
    }

    #[tokio::test]
    async fn create_bot_with_join_at_is_scheduled() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let mut new = new_bot(project.id);
        new.join_at = Some(Utc::now() + chrono::Duration::minutes(10));
        let created = store.create_bot(new).await.unwrap();
        assert_eq!(created.bot().state, BotState::Scheduled);
    }

    #[tokio::test]
    async fn dedup_returns_existing_non_terminal_bot() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let mut new = new_bot(project.id);
        new.deduplication_key = Some("standup".into());

        let first = store.create_bot(new.clone()).await.unwrap();
        let second = store.create_bot(new.clone()).await.unwrap();
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.bot().object_id, second.bot().object_id);

        // Only one event chain exists.
        assert_eq!(store.list_bots(project.id).await.unwrap().len(), 1);

        // Once terminal, the key becomes reusable.
        store
            .transition(
                first.bot().id,
                TransitionRequest::new(&[BotState::Ready], BotState::FatalError, EventKind::FatalError),
            )
            .await
            .unwrap();
        let third = store.create_bot(new).await.unwrap();
        assert!(third.is_new());
    }

    #[tokio::test]
    async fn unsupported_url_is_a_config_error() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let mut new = new_bot(project.id);
        new.meeting_url = "https://example.com/call".into();
        assert!(matches!(store.create_bot(new).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn stale_transition_is_dropped_silently() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let bot = store.create_bot(new_bot(project.id)).await.unwrap().into_bot();

        let outcome = store
            .transition(
                bot.id,
                TransitionRequest::new(&[BotState::Joining], BotState::JoinedNotRecording, EventKind::Admitted),
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TransitionOutcome::Stale { current: BotState::Ready }
        ));
        assert!(store.bot_events(bot.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn event_log_is_a_valid_state_machine_path() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let bot = store.create_bot(new_bot(project.id)).await.unwrap().into_bot();

        drive_to(
            &store,
            bot.id,
            &[
                (BotState::Ready, BotState::Staged, EventKind::Claimed),
                (BotState::Staged, BotState::Joining, EventKind::JoinStarted),
                (BotState::Joining, BotState::JoinedNotRecording, EventKind::Admitted),
                (BotState::JoinedNotRecording, BotState::JoinedRecording, EventKind::RecordingStarted),
                (BotState::JoinedRecording, BotState::Leaving, EventKind::MeetingEnded),
                (BotState::Leaving, BotState::PostProcessing, EventKind::AdapterClosed),
                (BotState::PostProcessing, BotState::Ended, EventKind::ArtifactsFinalized),
            ],
        )
        .await;

        let events = store.bot_events(bot.id).await.unwrap();
        assert_eq!(events.len(), 7);
        for pair in events.windows(2) {
            assert_eq!(pair[0].new_state, pair[1].old_state, "event chain must be contiguous");
        }
        for event in &events {
            assert!(event.old_state.can_transition(event.new_state));
        }
    }

    #[tokio::test]
    async fn concurrent_transitions_serialize_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let (_, project) = fixture(&store).await;
        let bot = store.create_bot(new_bot(project.id)).await.unwrap().into_bot();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let bot_id = bot.id;
            tasks.push(tokio::spawn(async move {
                store
                    .transition(
                        bot_id,
                        TransitionRequest::new(&[BotState::Ready], BotState::Staged, EventKind::Claimed),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        for task in tasks {
            if task.await.unwrap().applied().is_some() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1, "exactly one claim may win");
        assert_eq!(store.bot_events(bot.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_debit_is_atomic_and_flags_low_credits() {
        let store = MemoryStore::new();
        let org = store.create_organization("acme", 12_000).await.unwrap();
        let project = store.create_project(org.id, "p").await.unwrap();
        let bot = store.create_bot(new_bot(project.id)).await.unwrap().into_bot();

        let outcome = store
            .transition(
                bot.id,
                TransitionRequest::new(&[BotState::Ready], BotState::FatalError, EventKind::FatalError)
                    .sub(sub::LAUNCH_FAILED)
                    .debit(CreditDebit {
                        amount_mc: 5_000,
                        description: "runtime".into(),
                    }),
            )
            .await
            .unwrap();

        let TransitionOutcome::Applied { credits_low, .. } = outcome else {
            panic!("transition must apply");
        };
        assert!(credits_low, "12000 - 5000 crosses the 10000 threshold");
        assert_eq!(store.organization(org.id).await.unwrap().credits_mc, 7_000);

        // The flag fires once; a later adjustment above the threshold
        // re-arms it.
        assert!(store.organization(org.id).await.unwrap().low_credit_notified);
        store.adjust_credits(org.id, 10_000).await.unwrap();
        assert!(!store.organization(org.id).await.unwrap().low_credit_notified);
    }

    #[tokio::test]
    async fn debit_on_non_terminal_transition_is_rejected() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let bot = store.create_bot(new_bot(project.id)).await.unwrap().into_bot();

        let result = store
            .transition(
                bot.id,
                TransitionRequest::new(&[BotState::Ready], BotState::Staged, EventKind::Claimed)
                    .debit(CreditDebit {
                        amount_mc: 1,
                        description: "nope".into(),
                    }),
            )
            .await;
        assert!(matches!(result, Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn due_scheduled_honors_pre_roll() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let mut new = new_bot(project.id);
        new.join_at = Some(Utc::now() + chrono::Duration::seconds(45));
        let bot = store.create_bot(new).await.unwrap().into_bot();

        let none = store
            .due_scheduled(Utc::now(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(none.is_empty(), "45s out, 10s pre-roll: not yet due");

        let due = store
            .due_scheduled(Utc::now(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, bot.id);
    }

    #[tokio::test]
    async fn stale_heartbeats_only_in_worker_states() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let bot = store.create_bot(new_bot(project.id)).await.unwrap().into_bot();

        // READY bots never show up regardless of heartbeat age.
        let stale = store
            .stale_heartbeats(Utc::now() + chrono::Duration::hours(1), Duration::from_secs(120))
            .await
            .unwrap();
        assert!(stale.is_empty());

        drive_to(
            &store,
            bot.id,
            &[
                (BotState::Ready, BotState::Staged, EventKind::Claimed),
                (BotState::Staged, BotState::Joining, EventKind::JoinStarted),
            ],
        )
        .await;
        store.heartbeat(bot.id).await.unwrap();

        let fresh = store
            .stale_heartbeats(Utc::now(), Duration::from_secs(120))
            .await
            .unwrap();
        assert!(fresh.is_empty());

        let stale = store
            .stale_heartbeats(Utc::now() + chrono::Duration::seconds(150), Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn lease_exclusivity_and_expiry() {
        let store = MemoryStore::new();
        assert!(store
            .try_acquire_lease(0, "a", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .try_acquire_lease(0, "b", Duration::from_secs(60))
            .await
            .unwrap());
        // The holder renews freely.
        assert!(store
            .try_acquire_lease(0, "a", Duration::from_secs(60))
            .await
            .unwrap());
        // Other shards are independent.
        assert!(store
            .try_acquire_lease(1, "b", Duration::from_secs(60))
            .await
            .unwrap());
        // Release frees it.
        store.release_lease(0, "a").await.unwrap();
        assert!(store
            .try_acquire_lease(0, "b", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn utterances_sort_by_meeting_time_then_speaker() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let bot = store.create_bot(new_bot(project.id)).await.unwrap().into_bot();
        let recording = store
            .create_recording(NewRecording {
                bot_id: bot.id,
                recording_type: qm_domain::settings::RecordingType::AudioOnly,
                format: qm_domain::settings::RecordingFormat::Wav,
                is_default: true,
                participant_uuid: None,
            })
            .await
            .unwrap();
        let alice = store
            .upsert_participant(bot.id, "uuid-a", "Alice", None, false)
            .await
            .unwrap();
        let bob = store
            .upsert_participant(bot.id, "uuid-b", "Bob", None, false)
            .await
            .unwrap();

        for (participant, at, text) in [
            (bob.id, 2000u64, "second"),
            (alice.id, 1000, "first"),
            (bob.id, 1000, "first-tie"),
        ] {
            store
                .append_utterance(NewUtterance {
                    recording_id: recording.id,
                    participant_id: participant,
                    relative_timestamp_ms: at,
                    duration_ms: 500,
                    transcript: text.into(),
                    words: vec![],
                })
                .await
                .unwrap();
        }

        let ordered = store.utterances(recording.id).await.unwrap();
        let texts: Vec<&str> = ordered.iter().map(|u| u.transcript.as_str()).collect();
        assert_eq!(texts, vec!["first", "first-tie", "second"]);
    }

    #[tokio::test]
    async fn delivery_claims_skip_claimed_and_keep_order_per_key() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let bot = store.create_bot(new_bot(project.id)).await.unwrap().into_bot();
        let subscription = store
            .create_subscription(NewSubscription {
                project_id: project.id,
                url: "https://example.com/hook".into(),
                triggers: vec![qm_domain::trigger::TriggerType::BotStateChange],
                secret: "c2VjcmV0".into(),
            })
            .await
            .unwrap();

        for i in 0..3 {
            store
                .enqueue_delivery(NewDelivery {
                    subscription_id: subscription.id,
                    bot_id: Some(bot.id),
                    trigger: qm_domain::trigger::TriggerType::BotStateChange,
                    payload: serde_json::json!({ "n": i }),
                    idempotency_key: format!("key-{i}"),
                })
                .await
                .unwrap();
        }

        // Ordered trigger: only the oldest is claimable at a time.
        let first = store.claim_due_deliveries(Utc::now(), 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload["n"], 0);

        // While claimed, nothing else for the key goes out.
        let while_claimed = store.claim_due_deliveries(Utc::now(), 10).await.unwrap();
        assert!(while_claimed.is_empty());

        store
            .record_delivery_result(
                first[0].id,
                DeliveryResult {
                    success: true,
                    response_body: "ok".into(),
                    next_attempt_at: None,
                    exhausted: false,
                },
            )
            .await
            .unwrap();

        let second = store.claim_due_deliveries(Utc::now(), 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload["n"], 1);
    }

    #[tokio::test]
    async fn delivery_retry_then_success_bookkeeping() {
        let store = MemoryStore::new();
        let (_, project) = fixture(&store).await;
        let subscription = store
            .create_subscription(NewSubscription {
                project_id: project.id,
                url: "https://example.com/hook".into(),
                triggers: vec![qm_domain::trigger::TriggerType::TranscriptUpdate],
                secret: "c2VjcmV0".into(),
            })
            .await
            .unwrap();
        let attempt = store
            .enqueue_delivery(NewDelivery {
                subscription_id: subscription.id,
                bot_id: None,
                trigger: qm_domain::trigger::TriggerType::TranscriptUpdate,
                payload: serde_json::json!({}),
                idempotency_key: "k".into(),
            })
            .await
            .unwrap();

        store
            .record_delivery_result(
                attempt.id,
                DeliveryResult {
                    success: false,
                    response_body: "500 whoops".into(),
                    next_attempt_at: Some(Utc::now() + chrono::Duration::seconds(30)),
                    exhausted: false,
                },
            )
            .await
            .unwrap();

        // Not due again until next_attempt_at.
        assert!(store
            .claim_due_deliveries(Utc::now(), 10)
            .await
            .unwrap()
            .is_empty());

        let later = Utc::now() + chrono::Duration::seconds(31);
        let retried = store.claim_due_deliveries(later, 10).await.unwrap();
        assert_eq!(retried.len(), 1);

        store
            .record_delivery_result(
                attempt.id,
                DeliveryResult {
                    success: true,
                    response_body: "ok".into(),
                    next_attempt_at: None,
                    exhausted: false,
                },
            )
            .await
            .unwrap();

        let final_state = store
            .delivery_attempts_for_subscription(subscription.id)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(final_state.status, DeliveryStatus::Success);
        assert_eq!(final_state.attempt_count, 2);
        assert_eq!(final_state.response_body_list.len(), 2);
        assert!(final_state.succeeded_at.is_some());
    }

    #[tokio::test]
    async fn event_log_mirrors_to_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_event_log(dir.path()).unwrap();
        let (_, project) = fixture(&store).await;
        let bot = store.create_bot(new_bot(project.id)).await.unwrap().into_bot();
        store
            .transition(
                bot.id,
                TransitionRequest::new(&[BotState::Ready], BotState::Staged, EventKind::Claimed),
            )
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 1);
        let event: BotEvent = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(event.bot_id, bot.id);
    }
}
