use serde::{Deserialize, Serialize};

/// Media pipeline tuning. The house audio format (48 kHz mono i16, 10 ms
/// frames) is fixed; these knobs size the buffers around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Per-participant audio ring capacity in seconds.
    #[serde(default = "d_ring_secs")]
    pub ring_secs: u64,
    /// Encode-queue lag beyond which the oldest video frames are dropped.
    #[serde(default = "d_backpressure_ms")]
    pub backpressure_lag_ms: u64,
    /// Window over which speaker RMS is measured.
    #[serde(default = "d_speaker_window_ms")]
    pub speaker_window_ms: u64,
    /// Minimum time between active-speaker switches.
    #[serde(default = "d_speaker_hysteresis_ms")]
    pub speaker_hysteresis_ms: u64,
    /// Composited output width in pixels.
    #[serde(default = "d_width")]
    pub width: u32,
    /// Composited output height in pixels.
    #[serde(default = "d_height")]
    pub height: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ring_secs: d_ring_secs(),
            backpressure_lag_ms: d_backpressure_ms(),
            speaker_window_ms: d_speaker_window_ms(),
            speaker_hysteresis_ms: d_speaker_hysteresis_ms(),
            width: d_width(),
            height: d_height(),
        }
    }
}

fn d_ring_secs() -> u64 {
    2
}
fn d_backpressure_ms() -> u64 {
    500
}
fn d_speaker_window_ms() -> u64 {
    500
}
fn d_speaker_hysteresis_ms() -> u64 {
    1000
}
fn d_width() -> u32 {
    1280
}
fn d_height() -> u32 {
    720
}
