//! The Bot Adapter contract.
//!
//! An adapter owns all platform-specific I/O for one meeting: the join
//! handshake, credential refresh, raw media frames, participant events and
//! chat. Behind this trait the implementation may drive a headless
//! browser, host a native SDK subprocess, or consume a server-pushed
//! stream; the controller never knows the difference.
//!
//! Contract points the controller relies on:
//! - frame timestamps are monotonic and meeting-relative (milliseconds);
//! - after [`AdapterControls::leave`], a terminal event ([`AdapterEvent::MeetingEnded`]
//!   or [`AdapterEvent::FatalError`]) arrives within 60 seconds;
//! - platform errors are translated into the event stream, never panics.

pub mod registry;
pub mod rtms;
pub mod sim;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use qm_domain::settings::BotSettings;
use qm_domain::Result;

pub use registry::AdapterRegistry;
pub use rtms::RtmsAdapter;
pub use sim::{SimAdapter, SimScript};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A meeting attendee as the platform reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    /// Platform-assigned uuid, stable for the duration of the meeting.
    pub uuid: String,
    pub full_name: String,
    /// Stable cross-meeting user id when the platform exposes one.
    pub user_uuid: Option<String>,
    #[serde(default)]
    pub is_host: bool,
}

/// One chunk of a participant's audio.
///
/// Sample rates vary by platform; the pipeline resamples to the house
/// format. `ts_ms` is meeting-relative.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub participant_uuid: String,
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
    pub ts_ms: u64,
}

/// Payload of a video frame: decoded RGB from browser platforms,
/// pre-encoded H.264 access units from native SDKs.
#[derive(Debug, Clone, PartialEq)]
pub enum VideoContent {
    Rgb {
        width: u32,
        height: u32,
        /// Tightly packed RGB8, row-major.
        data: Vec<u8>,
    },
    H264 {
        data: Vec<u8>,
        keyframe: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub participant_uuid: String,
    pub content: VideoContent,
    pub ts_ms: u64,
}

/// Who a chat message was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatTarget {
    #[default]
    Everyone,
    OnlyBot,
}

/// Everything an adapter can tell the controller.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// The platform admitted us into the meeting.
    Admitted,
    /// The platform refused us (bad link, locked meeting, host denial).
    Rejected { reason: String },
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft { uuid: String, ts_ms: u64 },
    SpeechStart { uuid: String, ts_ms: u64 },
    SpeechStop { uuid: String, ts_ms: u64 },
    ScreenshareStart { uuid: String, ts_ms: u64 },
    ScreenshareStop { uuid: String, ts_ms: u64 },
    Audio(AudioFrame),
    Video(VideoFrame),
    Chat {
        participant_uuid: String,
        text: String,
        to: ChatTarget,
        ts_ms: u64,
    },
    /// Terminal: the meeting ended (or we left cleanly).
    MeetingEnded { ts_ms: u64 },
    /// Terminal: the host removed us.
    Kicked { ts_ms: u64 },
    /// Terminal: the platform layer died and cannot recover.
    FatalError { message: String },
}

impl AdapterEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AdapterEvent::MeetingEnded { .. }
                | AdapterEvent::Kicked { .. }
                | AdapterEvent::FatalError { .. }
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inputs to [`BotAdapter::open`].
#[derive(Clone)]
pub struct OpenContext {
    pub meeting_url: String,
    /// Display name the bot joins under.
    pub bot_name: String,
    /// Decrypted provider credentials for this project, or `Null`.
    pub credentials: serde_json::Value,
    pub settings: BotSettings,
    /// Cancelled when the worker is shutting down; the adapter must wind
    /// down its I/O when this fires.
    pub cancel: CancellationToken,
}

/// Commands the controller can send into the meeting.
#[async_trait::async_trait]
pub trait AdapterControls: Send + Sync {
    async fn start_recording(&self) -> Result<()>;
    async fn pause_recording(&self) -> Result<()>;
    async fn resume_recording(&self) -> Result<()>;
    /// Ask the platform layer to leave. Terminal event follows on the
    /// stream within 60 seconds.
    async fn leave(&self) -> Result<()>;
}

/// Platform-specific I/O behind a fixed interface.
#[async_trait::async_trait]
pub trait BotAdapter: Send + Sync {
    /// Join the meeting and return the event stream plus controls. The
    /// returned receiver yields events until a terminal event, after
    /// which it closes.
    async fn open(
        &self,
        ctx: OpenContext,
    ) -> Result<(mpsc::Receiver<AdapterEvent>, Box<dyn AdapterControls>)>;

    /// Short identifier for logs (`"sim"`, `"rtms"`, …).
    fn kind(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_event_classification() {
        assert!(AdapterEvent::MeetingEnded { ts_ms: 0 }.is_terminal());
        assert!(AdapterEvent::Kicked { ts_ms: 0 }.is_terminal());
        assert!(AdapterEvent::FatalError { message: "x".into() }.is_terminal());
        assert!(!AdapterEvent::Admitted.is_terminal());
        assert!(!AdapterEvent::SpeechStart { uuid: "u".into(), ts_ms: 1 }.is_terminal());
    }
}
