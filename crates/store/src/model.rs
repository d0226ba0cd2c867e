//! Stored entities.
//!
//! Row ids are [`Uuid`]s; the opaque `object_id` strings are what external
//! callers see. Bot ↔ Recording ↔ Utterance form a tree rooted at the bot:
//! children carry their parent's row id, never the other way around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use qm_domain::bot::{BotKind, BotState, EventKind};
use qm_domain::platform::Platform;
use qm_domain::settings::{BotSettings, RecordingFormat, RecordingType};
use qm_domain::trigger::TriggerType;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tenancy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    /// Signed balance in millicredits (1 credit = 1000 mc). May go
    /// negative after overruns.
    pub credits_mc: i64,
    /// Launches are allowed at ≤ 0 balance when set.
    pub allow_negative_credits: bool,
    /// Balance at or below which the low-credit webhook fires.
    pub low_credit_threshold_mc: i64,
    /// Set once the low-credit webhook has fired; cleared when the balance
    /// rises back above the threshold.
    pub low_credit_notified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Which external service a sealed credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialProvider {
    ZoomOauth,
    TeamsBot,
    Deepgram,
    ObjectStorage,
}

/// An AES-256-GCM sealed secret, unique per `(project, provider)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub project_id: Uuid,
    pub provider: CredentialProvider,
    /// Base64(nonce ‖ ciphertext); see [`crate::credential`].
    pub ciphertext: String,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A command the API wants the owning worker to execute. The worker polls
/// this on its heartbeat tick and clears it once honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredAction {
    Leave,
    PauseRecording,
    ResumeRecording,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: Uuid,
    /// Opaque public id (`bot_…` / `sess_…`).
    pub object_id: String,
    pub project_id: Uuid,
    pub kind: BotKind,
    pub meeting_url: String,
    pub platform: Platform,
    /// Display name the bot joins with.
    pub name: String,
    pub state: BotState,
    pub sub_state: Option<String>,
    /// Scheduled join time; `None` means join immediately.
    pub join_at: Option<DateTime<Utc>>,
    /// Unique per project among non-terminal bots.
    pub deduplication_key: Option<String>,
    pub settings: BotSettings,
    /// Caller-owned opaque key/value blob.
    pub metadata: serde_json::Value,
    pub desired_action: Option<DesiredAction>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// When the bot first reached READY; anchors launch-retry backoff.
    pub first_ready_at: Option<DateTime<Utc>>,
    pub launch_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bot {
    pub fn is_app_session(&self) -> bool {
        self.kind == BotKind::AppSession
    }
}

/// Append-only transition log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotEvent {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub old_state: BotState,
    pub new_state: BotState,
    pub event_type: EventKind,
    pub sub_type: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recordings & transcription
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    #[default]
    NotStarted,
    InProgress,
    Paused,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionState {
    #[default]
    NotStarted,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub state: RecordingState,
    pub transcription_state: TranscriptionState,
    pub recording_type: RecordingType,
    pub format: RecordingFormat,
    /// The default (mixed) recording, as opposed to per-participant
    /// variants.
    pub is_default: bool,
    /// Set on per-participant variants.
    pub participant_uuid: Option<String>,
    /// Object-storage key once uploaded.
    pub storage_key: Option<String>,
    pub bytes: u64,
    pub duration_ms: u64,
    /// Video frames discarded under encode backpressure.
    pub frames_dropped: u64,
    /// Structured diagnostics when state is `failed` (also carries
    /// dropped-audio records from the transcription coordinator).
    pub failure_data: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Mutable subset of a recording row; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordingPatch {
    pub state: Option<RecordingState>,
    pub transcription_state: Option<TranscriptionState>,
    pub storage_key: Option<String>,
    pub bytes: Option<u64>,
    pub duration_ms: Option<u64>,
    pub frames_dropped: Option<u64>,
    pub failure_data: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Participants, utterances, chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub bot_id: Uuid,
    /// Platform-assigned attendee uuid.
    pub uuid: String,
    pub full_name: String,
    /// Stable cross-meeting user id when the platform provides one.
    pub user_uuid: Option<String>,
    pub is_host: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantEventKind {
    Join,
    Leave,
    SpeechStart,
    SpeechStop,
    ScreenshareStart,
    ScreenshareStop,
}

impl ParticipantEventKind {
    /// The webhook trigger class this event belongs to.
    pub fn trigger(self) -> TriggerType {
        match self {
            Self::Join | Self::Leave => TriggerType::ParticipantJoinLeave,
            Self::SpeechStart | Self::SpeechStop => TriggerType::ParticipantSpeech,
            Self::ScreenshareStart | Self::ScreenshareStop => TriggerType::ParticipantScreenshare,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantEvent {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub participant_id: Uuid,
    pub kind: ParticipantEventKind,
    pub event_data: serde_json::Value,
    /// Meeting-relative milliseconds.
    pub occurred_at_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// One transcribed word with meeting-relative timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub word: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub id: Uuid,
    pub recording_id: Uuid,
    pub participant_id: Uuid,
    pub relative_timestamp_ms: u64,
    pub duration_ms: u64,
    pub transcript: String,
    pub words: Vec<Word>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatRecipient {
    #[default]
    Everyone,
    OnlyBot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    /// Opaque public id (`msg_…`).
    pub object_id: String,
    pub bot_id: Uuid,
    pub participant_id: Uuid,
    pub text: String,
    pub to: ChatRecipient,
    pub additional_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Webhooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub project_id: Uuid,
    pub url: String,
    pub triggers: Vec<TriggerType>,
    /// Base64 shared secret used for HMAC signing.
    pub secret: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryAttempt {
    pub id: Uuid,
    pub subscription_id: Uuid,
    /// Absent for organization-level triggers.
    pub bot_id: Option<Uuid>,
    pub trigger: TriggerType,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    /// Monotonic per-store enqueue sequence; orders deliveries per
    /// `(subscription, bot)` for ordered triggers.
    pub seq: u64,
    pub attempt_count: u32,
    pub status: DeliveryStatus,
    /// One entry per failed attempt, truncated to the configured cap.
    pub response_body_list: Vec<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub succeeded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Debug artifacts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A diagnostic screenshot captured around an adapter failure and uploaded
/// under `debug/{bot_object_id}/…`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugArtifact {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub event_id: Uuid,
    pub storage_key: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}
