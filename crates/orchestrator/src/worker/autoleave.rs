//! Auto-leave policy evaluation.
//!
//! The controller feeds meeting observations in; `evaluate` answers
//! whether any enabled policy says it is time to go. A threshold of zero
//! disables its policy.

use std::collections::HashSet;

use tokio::time::Instant;

use qm_domain::bot::sub;
use qm_domain::settings::AutoLeaveSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    OnlyParticipant,
    Silence,
    MaxDuration,
    WaitingRoom,
}

impl LeaveReason {
    pub fn sub_state(self) -> &'static str {
        match self {
            LeaveReason::OnlyParticipant => sub::ONLY_PARTICIPANT,
            LeaveReason::Silence => sub::SILENCE,
            LeaveReason::MaxDuration => sub::MAX_DURATION,
            LeaveReason::WaitingRoom => sub::WAITING_ROOM_TIMEOUT,
        }
    }
}

pub struct AutoLeaveTracker {
    settings: AutoLeaveSettings,
    join_started: Instant,
    admitted_at: Option<Instant>,
    participants: HashSet<String>,
    /// When the meeting last had a non-bot participant while we were in
    /// it; `None` while populated.
    alone_since: Option<Instant>,
    last_speech: Instant,
}

impl AutoLeaveTracker {
    pub fn new(settings: AutoLeaveSettings) -> Self {
        let now = Instant::now();
        Self {
            settings,
            join_started: now,
            admitted_at: None,
            participants: HashSet::new(),
            alone_since: None,
            last_speech: now,
        }
    }

    pub fn on_admitted(&mut self) {
        let now = Instant::now();
        self.admitted_at = Some(now);
        self.last_speech = now;
        self.alone_since = self.participants.is_empty().then_some(now);
    }

    pub fn on_participant_join(&mut self, uuid: &str) {
        self.participants.insert(uuid.to_owned());
        self.alone_since = None;
    }

    pub fn on_participant_leave(&mut self, uuid: &str) {
        self.participants.remove(uuid);
        if self.participants.is_empty() && self.admitted_at.is_some() {
            self.alone_since = Some(Instant::now());
        }
    }

    pub fn on_speech(&mut self) {
        self.last_speech = Instant::now();
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Evaluate all policies at `now`.
    pub fn evaluate(&self, now: Instant) -> Option<LeaveReason> {
        let Some(admitted_at) = self.admitted_at else {
            // Still in the waiting room.
            if self.settings.waiting_room_secs > 0
                && now.duration_since(self.join_started).as_secs() >= self.settings.waiting_room_secs
            {
                return Some(LeaveReason::WaitingRoom);
            }
            return None;
        };

        if self.settings.max_duration_secs > 0
            && now.duration_since(admitted_at).as_secs() >= self.settings.max_duration_secs
        {
            return Some(LeaveReason::MaxDuration);
        }

        if self.settings.only_participant_secs > 0 {
            if let Some(alone_since) = self.alone_since {
                if now.duration_since(alone_since).as_secs() >= self.settings.only_participant_secs
                {
                    return Some(LeaveReason::OnlyParticipant);
                }
            }
        }

        if self.settings.silence_secs > 0
            && now.duration_since(self.last_speech).as_secs() >= self.settings.silence_secs
        {
            return Some(LeaveReason::Silence);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> AutoLeaveSettings {
        AutoLeaveSettings {
            only_participant_secs: 10,
            silence_secs: 60,
            max_duration_secs: 3600,
            waiting_room_secs: 30,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_room_timeout_fires_before_admission() {
        let tracker = AutoLeaveTracker::new(settings());
        assert_eq!(tracker.evaluate(Instant::now()), None);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(tracker.evaluate(Instant::now()), Some(LeaveReason::WaitingRoom));
    }

    #[tokio::test(start_paused = true)]
    async fn only_participant_after_everyone_leaves() {
        let mut tracker = AutoLeaveTracker::new(settings());
        tracker.on_admitted();
        tracker.on_participant_join("a");
        tracker.on_speech();

        tokio::time::advance(Duration::from_secs(30)).await;
        tracker.on_speech();
        tracker.on_participant_leave("a");

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(tracker.evaluate(Instant::now()), None);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            tracker.evaluate(Instant::now()),
            Some(LeaveReason::OnlyParticipant)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_resets_the_alone_clock() {
        let mut tracker = AutoLeaveTracker::new(settings());
        tracker.on_admitted();
        tracker.on_participant_join("a");
        tracker.on_participant_leave("a");
        tokio::time::advance(Duration::from_secs(8)).await;
        tracker.on_participant_join("b");
        tracker.on_speech();
        tokio::time::advance(Duration::from_secs(8)).await;
        tracker.on_speech();
        assert_eq!(tracker.evaluate(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_threshold() {
        let mut tracker = AutoLeaveTracker::new(settings());
        tracker.on_admitted();
        tracker.on_participant_join("a");
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(tracker.evaluate(Instant::now()), None);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tracker.evaluate(Instant::now()), Some(LeaveReason::Silence));

        tracker.on_speech();
        assert_eq!(tracker.evaluate(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_beats_other_policies() {
        let mut tracker = AutoLeaveTracker::new(AutoLeaveSettings {
            only_participant_secs: 10,
            silence_secs: 10,
            max_duration_secs: 20,
            waiting_room_secs: 30,
        });
        tracker.on_admitted();
        tracker.on_participant_join("a");
        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(tracker.evaluate(Instant::now()), Some(LeaveReason::MaxDuration));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_disables_a_policy() {
        let mut tracker = AutoLeaveTracker::new(AutoLeaveSettings {
            only_participant_secs: 0,
            silence_secs: 0,
            max_duration_secs: 0,
            waiting_room_secs: 0,
        });
        tracker.on_admitted();
        tokio::time::advance(Duration::from_secs(100_000)).await;
        assert_eq!(tracker.evaluate(Instant::now()), None);
    }
}
