//! Meeting platform detection.
//!
//! The platform is a pure function of the meeting URL (plus the bot's
//! `prefer_zoom_web` setting, which picks the browser client over the
//! native SDK for Zoom links). Unknown URLs are a configuration error
//! surfaced before launch, never at join time.

use serde::{Deserialize, Serialize};

/// Closed set of supported meeting platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    ZoomNative,
    ZoomWeb,
    GoogleMeet,
    Teams,
    /// Zoom Realtime Media Streams: no participant joins; Zoom pushes the
    /// meeting media to us over a websocket.
    ZoomRtms,
}

/// Coarse resource/billing class of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformClass {
    /// Native SDK host process (heaviest).
    Native,
    /// Headless-browser based.
    Browser,
    /// Server-side stream ingest only (lightest).
    Ingest,
}

impl Platform {
    /// Detect the platform from a meeting URL.
    ///
    /// `prefer_zoom_web` selects the browser client for Zoom links.
    /// Returns `None` for URLs no adapter can handle.
    pub fn from_meeting_url(url: &str, prefer_zoom_web: bool) -> Option<Platform> {
        let trimmed = url.trim();
        if trimmed.starts_with("rtms://") {
            return Some(Platform::ZoomRtms);
        }

        let host = host_of(trimmed)?;
        if host == "zoom.us" || host.ends_with(".zoom.us") {
            return Some(if prefer_zoom_web {
                Platform::ZoomWeb
            } else {
                Platform::ZoomNative
            });
        }
        if host == "meet.google.com" {
            return Some(Platform::GoogleMeet);
        }
        if host == "teams.microsoft.com"
            || host == "teams.live.com"
            || host.ends_with(".teams.microsoft.com")
        {
            return Some(Platform::Teams);
        }
        None
    }

    pub fn class(self) -> PlatformClass {
        match self {
            Platform::ZoomNative => PlatformClass::Native,
            Platform::ZoomWeb | Platform::GoogleMeet | Platform::Teams => PlatformClass::Browser,
            Platform::ZoomRtms => PlatformClass::Ingest,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Platform::ZoomNative => "zoom_native",
            Platform::ZoomWeb => "zoom_web",
            Platform::GoogleMeet => "google_meet",
            Platform::Teams => "teams",
            Platform::ZoomRtms => "zoom_rtms",
        };
        f.write_str(s)
    }
}

/// Extract the lowercased host from an http(s) URL without a URL crate.
fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let end = rest
        .find(|c| c == '/' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    let authority = &rest[..end];
    // Drop userinfo and port.
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}
