use serde::{Deserialize, Serialize};

use crate::platform::PlatformClass;
use crate::settings::RecordingType;

/// Credit billing rates in **millicredits per started minute** of bot
/// runtime (1 credit = 1000 mc), keyed by platform class and what was
/// captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Organizations at or below this balance get the low-credit warning
    /// webhook (once per crossing).
    #[serde(default = "d_low_threshold")]
    pub low_credit_threshold_mc: i64,

    #[serde(default = "d_native_av")]
    pub native_audio_video_mc: i64,
    #[serde(default = "d_native_audio")]
    pub native_audio_only_mc: i64,
    #[serde(default = "d_browser_av")]
    pub browser_audio_video_mc: i64,
    #[serde(default = "d_browser_audio")]
    pub browser_audio_only_mc: i64,
    #[serde(default = "d_ingest_av")]
    pub ingest_audio_video_mc: i64,
    #[serde(default = "d_ingest_audio")]
    pub ingest_audio_only_mc: i64,
    /// Flat attendance rate when nothing is recorded.
    #[serde(default = "d_no_recording")]
    pub no_recording_mc: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            low_credit_threshold_mc: d_low_threshold(),
            native_audio_video_mc: d_native_av(),
            native_audio_only_mc: d_native_audio(),
            browser_audio_video_mc: d_browser_av(),
            browser_audio_only_mc: d_browser_audio(),
            ingest_audio_video_mc: d_ingest_av(),
            ingest_audio_only_mc: d_ingest_audio(),
            no_recording_mc: d_no_recording(),
        }
    }
}

impl BillingConfig {
    /// Millicredits per started minute for a bot of this shape.
    pub fn rate_mc_per_minute(&self, class: PlatformClass, recording: RecordingType) -> i64 {
        if recording == RecordingType::NoRecording {
            return self.no_recording_mc;
        }
        let audio_only = recording == RecordingType::AudioOnly;
        match class {
            PlatformClass::Native => {
                if audio_only {
                    self.native_audio_only_mc
                } else {
                    self.native_audio_video_mc
                }
            }
            PlatformClass::Browser => {
                if audio_only {
                    self.browser_audio_only_mc
                } else {
                    self.browser_audio_video_mc
                }
            }
            PlatformClass::Ingest => {
                if audio_only {
                    self.ingest_audio_only_mc
                } else {
                    self.ingest_audio_video_mc
                }
            }
        }
    }

    /// All rates with display labels, for validation and operator output.
    pub fn rates_table(&self) -> Vec<(&'static str, i64)> {
        vec![
            ("native/audio_video", self.native_audio_video_mc),
            ("native/audio_only", self.native_audio_only_mc),
            ("browser/audio_video", self.browser_audio_video_mc),
            ("browser/audio_only", self.browser_audio_only_mc),
            ("ingest/audio_video", self.ingest_audio_video_mc),
            ("ingest/audio_only", self.ingest_audio_only_mc),
            ("no_recording", self.no_recording_mc),
        ]
    }
}

fn d_low_threshold() -> i64 {
    10_000
}
fn d_native_av() -> i64 {
    1000
}
fn d_native_audio() -> i64 {
    600
}
fn d_browser_av() -> i64 {
    800
}
fn d_browser_audio() -> i64 {
    500
}
fn d_ingest_av() -> i64 {
    300
}
fn d_ingest_audio() -> i64 {
    200
}
fn d_no_recording() -> i64 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_recording_rate_ignores_platform() {
        let billing = BillingConfig::default();
        for class in [
            PlatformClass::Native,
            PlatformClass::Browser,
            PlatformClass::Ingest,
        ] {
            assert_eq!(
                billing.rate_mc_per_minute(class, RecordingType::NoRecording),
                billing.no_recording_mc
            );
        }
    }

    #[test]
    fn native_video_is_the_most_expensive() {
        let billing = BillingConfig::default();
        let native = billing.rate_mc_per_minute(PlatformClass::Native, RecordingType::AudioAndVideo);
        for (_, rate) in billing.rates_table() {
            assert!(rate <= native);
        }
    }
}
