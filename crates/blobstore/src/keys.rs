//! Artifact key layout.
//!
//! `recordings/{bot_object_id}.{ext}` for the default mixed recording,
//! `recordings/{bot_object_id}/{participant_uuid}.{ext}` for variants,
//! `debug/{bot_object_id}/{event_id}.{ext}` for diagnostics. A
//! `file_name` metadata entry overrides the computed stem of the default
//! recording (legacy alias; the extension still follows the format).

/// Key for the default mixed recording.
pub fn recording_key(bot_object_id: &str, metadata: &serde_json::Value, ext: &str) -> String {
    let stem = metadata
        .get("file_name")
        .and_then(|v| v.as_str())
        .map(sanitize_stem)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| bot_object_id.to_owned());
    format!("recordings/{stem}.{ext}")
}

/// Key for a per-participant recording variant.
pub fn participant_recording_key(bot_object_id: &str, participant_uuid: &str, ext: &str) -> String {
    format!(
        "recordings/{bot_object_id}/{}.{ext}",
        sanitize_stem(participant_uuid)
    )
}

/// Key for a debug artifact attached to a bot event.
pub fn debug_key(bot_object_id: &str, event_id: &str, ext: &str) -> String {
    format!("debug/{bot_object_id}/{event_id}.{ext}")
}

/// Strip path separators and control characters from caller-supplied
/// stems.
fn sanitize_stem(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '/' | '\\') && !c.is_control())
        .collect::<String>()
        .trim()
        .trim_matches('.')
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_recording_key() {
        let key = recording_key("bot_abc123", &serde_json::Value::Null, "mp4");
        assert_eq!(key, "recordings/bot_abc123.mp4");
    }

    #[test]
    fn file_name_metadata_overrides_stem() {
        let metadata = serde_json::json!({ "file_name": "board-meeting-july" });
        let key = recording_key("bot_abc123", &metadata, "mp4");
        assert_eq!(key, "recordings/board-meeting-july.mp4");
    }

    #[test]
    fn file_name_with_path_tricks_is_sanitized() {
        let metadata = serde_json::json!({ "file_name": "../../etc/passwd" });
        let key = recording_key("bot_abc123", &metadata, "mp4");
        assert_eq!(key, "recordings/etcpasswd.mp4");
    }

    #[test]
    fn empty_file_name_falls_back() {
        let metadata = serde_json::json!({ "file_name": "  " });
        let key = recording_key("bot_abc123", &metadata, "wav");
        assert_eq!(key, "recordings/bot_abc123.wav");
    }

    #[test]
    fn participant_and_debug_keys() {
        assert_eq!(
            participant_recording_key("bot_a", "uuid-1", "wav"),
            "recordings/bot_a/uuid-1.wav"
        );
        assert_eq!(
            debug_key("bot_a", "ev-9", "png"),
            "debug/bot_a/ev-9.png"
        );
    }
}
