//! Read-through cache of interim transcripts.
//!
//! Partials are never persisted; the owning worker overwrites its
//! participants' entries as interim hypotheses arrive and clears the bot
//! on terminal transition. API transcript reads merge this cache over
//! the persisted finals.

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use qm_transcribe::SpeakerTranscript;

#[derive(Default)]
pub struct PartialCache {
    /// bot row id → participant uuid → latest interim.
    inner: RwLock<HashMap<Uuid, HashMap<String, SpeakerTranscript>>>,
}

impl PartialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, bot_id: Uuid, partial: SpeakerTranscript) {
        self.inner
            .write()
            .entry(bot_id)
            .or_default()
            .insert(partial.participant_uuid.clone(), partial);
    }

    /// A participant's final superseded any cached interim.
    pub fn clear_participant(&self, bot_id: Uuid, participant_uuid: &str) {
        if let Some(partials) = self.inner.write().get_mut(&bot_id) {
            partials.remove(participant_uuid);
        }
    }

    pub fn clear_bot(&self, bot_id: Uuid) {
        self.inner.write().remove(&bot_id);
    }

    /// Current interims for a bot, ordered by meeting time.
    pub fn for_bot(&self, bot_id: Uuid) -> Vec<SpeakerTranscript> {
        let mut partials: Vec<SpeakerTranscript> = self
            .inner
            .read()
            .get(&bot_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        partials.sort_by_key(|p| (p.relative_timestamp_ms, p.participant_uuid.clone()));
        partials
    }
}
