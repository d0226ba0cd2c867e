//! The transactional store contract.
//!
//! Implementations must provide, per bot row, the equivalent of
//! `SELECT … FOR UPDATE`: [`Store::transition`] serializes concurrent
//! callers, applies the state update and the [`BotEvent`] append in one
//! critical section, and applies an optional credit debit in the same
//! section when the transition is terminal. Delivery claims behave like
//! `FOR UPDATE SKIP LOCKED`: a claimed attempt is invisible to concurrent
//! claimers until its result is recorded.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use qm_domain::bot::{BotKind, BotState, EventKind};
use qm_domain::settings::BotSettings;
use qm_domain::trigger::TriggerType;
use qm_domain::Result;

use crate::model::*;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs & outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything needed to create a bot (or app session) row.
#[derive(Debug, Clone)]
pub struct NewBot {
    pub project_id: Uuid,
    pub kind: BotKind,
    pub meeting_url: String,
    pub name: String,
    pub join_at: Option<DateTime<Utc>>,
    pub deduplication_key: Option<String>,
    pub settings: BotSettings,
    pub metadata: serde_json::Value,
}

/// Result of [`Store::create_bot`]: the dedup invariant may hand back an
/// existing row instead of creating one.
#[derive(Debug, Clone)]
pub enum Created {
    New(Bot),
    Existing(Bot),
}

impl Created {
    pub fn bot(&self) -> &Bot {
        match self {
            Created::New(b) | Created::Existing(b) => b,
        }
    }

    pub fn into_bot(self) -> Bot {
        match self {
            Created::New(b) | Created::Existing(b) => b,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Created::New(_))
    }
}

/// A credit debit applied atomically with a terminal transition.
#[derive(Debug, Clone)]
pub struct CreditDebit {
    pub amount_mc: i64,
    pub description: String,
}

/// A requested state transition.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    /// States the bot must currently be in; anything else is a stale
    /// request and is dropped silently.
    pub expected_sources: Vec<BotState>,
    pub to: BotState,
    pub sub_state: Option<String>,
    pub event: EventKind,
    pub metadata: serde_json::Value,
    /// Only meaningful when `to` is terminal.
    pub debit: Option<CreditDebit>,
}

impl TransitionRequest {
    pub fn new(expected_sources: &[BotState], to: BotState, event: EventKind) -> Self {
        Self {
            expected_sources: expected_sources.to_vec(),
            to,
            sub_state: None,
            event,
            metadata: serde_json::Value::Null,
            debit: None,
        }
    }

    pub fn sub(mut self, sub_state: &str) -> Self {
        self.sub_state = Some(sub_state.to_owned());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn debit(mut self, debit: CreditDebit) -> Self {
        self.debit = Some(debit);
        self
    }
}

/// What a transition request did.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied {
        bot: Bot,
        event: BotEvent,
        /// The debit crossed the organization's low-credit threshold and
        /// the caller must emit the warning webhook.
        credits_low: bool,
    },
    /// The bot was not in an expected source state (or the edge is not in
    /// the transition table); nothing happened.
    Stale { current: BotState },
}

impl TransitionOutcome {
    pub fn applied(&self) -> Option<&Bot> {
        match self {
            TransitionOutcome::Applied { bot, .. } => Some(bot),
            TransitionOutcome::Stale { .. } => None,
        }
    }
}

/// Inputs for appending child rows.
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub bot_id: Uuid,
    pub recording_type: qm_domain::settings::RecordingType,
    pub format: qm_domain::settings::RecordingFormat,
    pub is_default: bool,
    pub participant_uuid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewParticipantEvent {
    pub bot_id: Uuid,
    pub participant_id: Uuid,
    pub kind: ParticipantEventKind,
    pub event_data: serde_json::Value,
    pub occurred_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct NewUtterance {
    pub recording_id: Uuid,
    pub participant_id: Uuid,
    pub relative_timestamp_ms: u64,
    pub duration_ms: u64,
    pub transcript: String,
    pub words: Vec<Word>,
}

#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub bot_id: Uuid,
    pub participant_id: Uuid,
    pub text: String,
    pub to: ChatRecipient,
    pub additional_data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub project_id: Uuid,
    pub url: String,
    pub triggers: Vec<TriggerType>,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub subscription_id: Uuid,
    pub bot_id: Option<Uuid>,
    pub trigger: TriggerType,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
}

/// Result of one HTTP delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// 2xx response observed.
    pub success: bool,
    /// Response body (already truncated) or error description.
    pub response_body: String,
    /// When the next attempt is due; ignored on success or when attempts
    /// are exhausted.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// No further attempts remain; a failed attempt becomes terminal.
    pub exhausted: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // ── Tenancy ──────────────────────────────────────────────────────
    async fn create_organization(&self, name: &str, credits_mc: i64) -> Result<Organization>;
    async fn organization(&self, id: Uuid) -> Result<Organization>;
    async fn organization_for_project(&self, project_id: Uuid) -> Result<Organization>;
    /// Manual balance adjustment; returns the new balance. Raising the
    /// balance above the threshold re-arms the low-credit notification.
    async fn adjust_credits(&self, organization_id: Uuid, delta_mc: i64) -> Result<i64>;
    async fn set_allow_negative_credits(&self, organization_id: Uuid, allow: bool) -> Result<()>;

    async fn create_project(&self, organization_id: Uuid, name: &str) -> Result<Project>;
    async fn project(&self, id: Uuid) -> Result<Project>;

    // ── Credentials ──────────────────────────────────────────────────
    async fn put_credential(
        &self,
        project_id: Uuid,
        provider: CredentialProvider,
        ciphertext: String,
    ) -> Result<Credential>;
    async fn credential(
        &self,
        project_id: Uuid,
        provider: CredentialProvider,
    ) -> Result<Option<Credential>>;

    // ── Bots ─────────────────────────────────────────────────────────
    async fn create_bot(&self, new: NewBot) -> Result<Created>;
    async fn bot(&self, id: Uuid) -> Result<Bot>;
    async fn bot_by_object_id(&self, object_id: &str) -> Result<Bot>;
    async fn list_bots(&self, project_id: Uuid) -> Result<Vec<Bot>>;

    /// Apply a state transition under the bot row lock. See
    /// [`TransitionRequest`] / [`TransitionOutcome`].
    async fn transition(&self, bot_id: Uuid, req: TransitionRequest) -> Result<TransitionOutcome>;

    async fn bot_events(&self, bot_id: Uuid) -> Result<Vec<BotEvent>>;
    async fn heartbeat(&self, bot_id: Uuid) -> Result<()>;
    async fn set_desired_action(&self, bot_id: Uuid, action: Option<DesiredAction>) -> Result<()>;
    /// Bump the launch-attempt counter and return its new value.
    async fn record_launch_attempt(&self, bot_id: Uuid) -> Result<u32>;

    // ── Dispatcher queries ───────────────────────────────────────────
    /// SCHEDULED bots whose `join_at − pre_roll` has passed.
    async fn due_scheduled(&self, now: DateTime<Utc>, pre_roll: Duration) -> Result<Vec<Bot>>;
    /// All READY bots (launch backoff is the dispatcher's concern).
    async fn ready_bots(&self) -> Result<Vec<Bot>>;
    /// Bots expected to heartbeat whose heartbeat is older than `timeout`.
    async fn stale_heartbeats(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<Bot>>;

    // ── Dispatcher leases ────────────────────────────────────────────
    /// Take or renew the leader lease for a shard. Returns `false` when
    /// another live holder owns it.
    async fn try_acquire_lease(&self, shard: u32, holder: &str, ttl: Duration) -> Result<bool>;
    async fn release_lease(&self, shard: u32, holder: &str) -> Result<()>;

    // ── Recordings ───────────────────────────────────────────────────
    async fn create_recording(&self, new: NewRecording) -> Result<Recording>;
    async fn update_recording(&self, id: Uuid, patch: RecordingPatch) -> Result<Recording>;
    async fn recordings_for_bot(&self, bot_id: Uuid) -> Result<Vec<Recording>>;

    // ── Participants / utterances / chat ─────────────────────────────
    /// Insert or update by `(bot, platform uuid)`.
    async fn upsert_participant(
        &self,
        bot_id: Uuid,
        uuid: &str,
        full_name: &str,
        user_uuid: Option<&str>,
        is_host: bool,
    ) -> Result<Participant>;
    async fn participants(&self, bot_id: Uuid) -> Result<Vec<Participant>>;

    async fn append_participant_event(&self, new: NewParticipantEvent)
        -> Result<ParticipantEvent>;
    async fn participant_events(&self, bot_id: Uuid) -> Result<Vec<ParticipantEvent>>;

    async fn append_utterance(&self, new: NewUtterance) -> Result<Utterance>;
    /// Ordered by `(relative_timestamp_ms, participant uuid)`.
    async fn utterances(&self, recording_id: Uuid) -> Result<Vec<Utterance>>;

    async fn append_chat_message(&self, new: NewChatMessage) -> Result<ChatMessage>;
    async fn chat_messages(&self, bot_id: Uuid) -> Result<Vec<ChatMessage>>;

    // ── Debug artifacts ──────────────────────────────────────────────
    async fn record_debug_artifact(
        &self,
        bot_id: Uuid,
        event_id: Uuid,
        storage_key: &str,
        content_type: &str,
    ) -> Result<DebugArtifact>;

    // ── Webhooks ─────────────────────────────────────────────────────
    async fn create_subscription(&self, new: NewSubscription) -> Result<WebhookSubscription>;
    async fn subscriptions_for_project(
        &self,
        project_id: Uuid,
        active_only: bool,
    ) -> Result<Vec<WebhookSubscription>>;
    async fn subscription(&self, id: Uuid) -> Result<WebhookSubscription>;
    async fn delete_subscription(&self, id: Uuid) -> Result<()>;

    async fn enqueue_delivery(&self, new: NewDelivery) -> Result<WebhookDeliveryAttempt>;
    /// Claim up to `limit` due deliveries. Ordered triggers are claimed
    /// oldest-first per `(subscription, bot)` and never concurrently for
    /// the same key.
    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDeliveryAttempt>>;
    async fn record_delivery_result(&self, id: Uuid, result: DeliveryResult) -> Result<()>;
    async fn delivery_attempts_for_bot(&self, bot_id: Uuid)
        -> Result<Vec<WebhookDeliveryAttempt>>;
    async fn delivery_attempts_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<WebhookDeliveryAttempt>>;
}
