//! Per-bot settings supplied at creation time.
//!
//! Everything is optional on the wire; defaults here are the service-wide
//! defaults. `normalize` is applied once at creation so every later reader
//! sees a canonical value.

use serde::{Deserialize, Serialize};

/// What the bot captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingType {
    #[default]
    AudioAndVideo,
    AudioOnly,
    NoRecording,
}

/// Output container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingFormat {
    #[default]
    Mp4,
    /// Accepted for compatibility; normalized to [`RecordingFormat::Wav`]
    /// because no MP3 encoder is shipped.
    Mp3,
    Webm,
    Wav,
    None,
}

impl RecordingFormat {
    pub fn extension(self) -> &'static str {
        match self {
            RecordingFormat::Mp4 => "mp4",
            RecordingFormat::Mp3 => "mp3",
            RecordingFormat::Webm => "webm",
            RecordingFormat::Wav => "wav",
            RecordingFormat::None => "",
        }
    }
}

/// Video composition layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ViewLayout {
    #[default]
    SpeakerView,
    GalleryView,
}

/// Auto-leave thresholds, all in seconds. Zero disables a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoLeaveSettings {
    /// Leave after being the only participant for this long.
    #[serde(default = "d_only_participant")]
    pub only_participant_secs: u64,
    /// Leave after nobody has spoken for this long.
    #[serde(default = "d_silence")]
    pub silence_secs: u64,
    /// Hard cap on total in-meeting time.
    #[serde(default = "d_max_duration")]
    pub max_duration_secs: u64,
    /// Give up if stuck in the waiting room for this long.
    #[serde(default = "d_waiting_room")]
    pub waiting_room_secs: u64,
}

impl Default for AutoLeaveSettings {
    fn default() -> Self {
        Self {
            only_participant_secs: d_only_participant(),
            silence_secs: d_silence(),
            max_duration_secs: d_max_duration(),
            waiting_room_secs: d_waiting_room(),
        }
    }
}

/// Which ASR provider transcribes this bot's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionProviderKind {
    #[default]
    Deepgram,
    /// Deterministic in-process provider for tests and local development.
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default)]
    pub provider: TranscriptionProviderKind,
    #[serde(default = "d_language")]
    pub language: String,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: TranscriptionProviderKind::default(),
            language: d_language(),
        }
    }
}

/// The full per-bot settings blob stored on the bot row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSettings {
    #[serde(default)]
    pub recording_type: RecordingType,
    #[serde(default)]
    pub format: RecordingFormat,
    #[serde(default)]
    pub view: ViewLayout,
    #[serde(default)]
    pub auto_leave: AutoLeaveSettings,
    #[serde(default)]
    pub transcription: TranscriptionSettings,
    /// Start recording as soon as the bot is admitted.
    #[serde(default = "d_true")]
    pub auto_start_recording: bool,
    /// Also upload one audio file per participant.
    #[serde(default)]
    pub per_participant_audio: bool,
    /// Use the Zoom web client instead of the native SDK.
    #[serde(default)]
    pub prefer_zoom_web: bool,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            recording_type: RecordingType::default(),
            format: RecordingFormat::default(),
            view: ViewLayout::default(),
            auto_leave: AutoLeaveSettings::default(),
            transcription: TranscriptionSettings::default(),
            auto_start_recording: true,
            per_participant_audio: false,
            prefer_zoom_web: false,
        }
    }
}

impl BotSettings {
    /// Canonicalize settings at creation time.
    ///
    /// `mp3` downgrades to `wav` (no MP3 encoder is shipped); a
    /// `no_recording` bot gets format `none`; an `audio_only` bot asking
    /// for a video container gets `wav`.
    pub fn normalize(mut self) -> Self {
        if self.format == RecordingFormat::Mp3 {
            tracing::warn!("recording format mp3 is not encodable, normalizing to wav");
            self.format = RecordingFormat::Wav;
        }
        match self.recording_type {
            RecordingType::NoRecording => self.format = RecordingFormat::None,
            RecordingType::AudioOnly => {
                if matches!(self.format, RecordingFormat::Mp4 | RecordingFormat::Webm) {
                    self.format = RecordingFormat::Wav;
                }
            }
            RecordingType::AudioAndVideo => {
                if self.format == RecordingFormat::Wav {
                    self.recording_type = RecordingType::AudioOnly;
                }
            }
        }
        self
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_only_participant() -> u64 {
    60
}
fn d_silence() -> u64 {
    600
}
fn d_max_duration() -> u64 {
    4 * 60 * 60
}
fn d_waiting_room() -> u64 {
    900
}
fn d_language() -> String {
    "en".into()
}
fn d_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_policy() {
        let s = BotSettings::default();
        assert_eq!(s.auto_leave.only_participant_secs, 60);
        assert_eq!(s.auto_leave.silence_secs, 600);
        assert_eq!(s.auto_leave.max_duration_secs, 14_400);
        assert_eq!(s.recording_type, RecordingType::AudioAndVideo);
        assert_eq!(s.format, RecordingFormat::Mp4);
        assert!(s.auto_start_recording);
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let s: BotSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s, BotSettings::default());
    }

    #[test]
    fn mp3_normalizes_to_wav_audio_only() {
        let s = BotSettings {
            recording_type: RecordingType::AudioOnly,
            format: RecordingFormat::Mp3,
            ..Default::default()
        }
        .normalize();
        assert_eq!(s.format, RecordingFormat::Wav);
    }

    #[test]
    fn wav_with_video_downgrades_to_audio_only() {
        let s = BotSettings {
            format: RecordingFormat::Wav,
            ..Default::default()
        }
        .normalize();
        assert_eq!(s.recording_type, RecordingType::AudioOnly);
    }

    #[test]
    fn no_recording_clears_format() {
        let s = BotSettings {
            recording_type: RecordingType::NoRecording,
            ..Default::default()
        }
        .normalize();
        assert_eq!(s.format, RecordingFormat::None);
    }
}
