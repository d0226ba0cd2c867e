//! Webhook trigger classes.

use serde::{Deserialize, Serialize};

/// A named event class a project can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    #[serde(rename = "bot.state_change")]
    BotStateChange,
    #[serde(rename = "transcript.update")]
    TranscriptUpdate,
    #[serde(rename = "chat_messages.update")]
    ChatMessagesUpdate,
    #[serde(rename = "participant_events.join_leave")]
    ParticipantJoinLeave,
    #[serde(rename = "participant_events.speech")]
    ParticipantSpeech,
    #[serde(rename = "participant_events.screenshare")]
    ParticipantScreenshare,
    #[serde(rename = "organization.credits_low")]
    CreditsLow,
}

impl TriggerType {
    pub const ALL: &'static [TriggerType] = &[
        TriggerType::BotStateChange,
        TriggerType::TranscriptUpdate,
        TriggerType::ChatMessagesUpdate,
        TriggerType::ParticipantJoinLeave,
        TriggerType::ParticipantSpeech,
        TriggerType::ParticipantScreenshare,
        TriggerType::CreditsLow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::BotStateChange => "bot.state_change",
            TriggerType::TranscriptUpdate => "transcript.update",
            TriggerType::ChatMessagesUpdate => "chat_messages.update",
            TriggerType::ParticipantJoinLeave => "participant_events.join_leave",
            TriggerType::ParticipantSpeech => "participant_events.speech",
            TriggerType::ParticipantScreenshare => "participant_events.screenshare",
            TriggerType::CreditsLow => "organization.credits_low",
        }
    }

    /// Deliveries for this trigger must arrive in emission order per
    /// `(subscription, bot)`.
    pub fn is_ordered(self) -> bool {
        matches!(self, TriggerType::BotStateChange)
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_dotted() {
        let json = serde_json::to_string(&TriggerType::BotStateChange).unwrap();
        assert_eq!(json, "\"bot.state_change\"");
        let t: TriggerType = serde_json::from_str("\"transcript.update\"").unwrap();
        assert_eq!(t, TriggerType::TranscriptUpdate);
    }

    #[test]
    fn as_str_round_trips_serde() {
        for &t in TriggerType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn only_state_changes_are_ordered() {
        assert!(TriggerType::BotStateChange.is_ordered());
        assert!(!TriggerType::TranscriptUpdate.is_ordered());
    }
}
