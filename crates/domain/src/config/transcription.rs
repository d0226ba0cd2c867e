use serde::{Deserialize, Serialize};

/// Transcription coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Close a participant session after this much silence.
    #[serde(default = "d_idle_close")]
    pub idle_close_secs: u64,
    /// On shutdown, wait this long for final utterances.
    #[serde(default = "d_flush")]
    pub flush_secs: u64,
    /// Per-session queue depth in 10 ms frames. Overflow drops audio and
    /// records a failure instead of stalling ingest.
    #[serde(default = "d_queue_frames")]
    pub queue_frames: usize,
    #[serde(default)]
    pub deepgram: DeepgramConfig,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            idle_close_secs: d_idle_close(),
            flush_secs: d_flush(),
            queue_frames: d_queue_frames(),
            deepgram: DeepgramConfig::default(),
        }
    }
}

/// Deepgram live-streaming endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepgramConfig {
    #[serde(default = "d_ws_url")]
    pub ws_url: String,
    /// Environment variable holding the API key. The per-project credential
    /// table takes precedence when a row exists.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    /// Keepalive interval while a session is open.
    #[serde(default = "d_keepalive")]
    pub keepalive_secs: u64,
}

impl Default for DeepgramConfig {
    fn default() -> Self {
        Self {
            ws_url: d_ws_url(),
            api_key_env: d_api_key_env(),
            keepalive_secs: d_keepalive(),
        }
    }
}

fn d_idle_close() -> u64 {
    10
}
fn d_flush() -> u64 {
    30
}
fn d_queue_frames() -> usize {
    100
}
fn d_ws_url() -> String {
    "wss://api.deepgram.com/v1/listen".into()
}
fn d_api_key_env() -> String {
    "DEEPGRAM_API_KEY".into()
}
fn d_keepalive() -> u64 {
    8
}
