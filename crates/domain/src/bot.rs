//! Bot lifecycle states and the legal-transition table.
//!
//! Every state change a bot row ever sees must be an edge in
//! [`BotState::can_transition`]. The store enforces this under the bot row
//! lock; callers that race simply lose and their transition is dropped.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a bot (or app session) row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    /// Created with a future `join_at`; not yet due.
    Scheduled,
    /// Due for launch (or created without `join_at`).
    Ready,
    /// Claimed by a dispatcher; a worker is being spawned.
    Staged,
    /// Worker is up and attempting to join the meeting.
    Joining,
    /// Admitted to the meeting, not recording.
    JoinedNotRecording,
    /// Admitted and recording.
    JoinedRecording,
    /// Recording paused; the output file keeps running on silence/freeze.
    Paused,
    /// Leave initiated (command, auto-leave policy, meeting end, or kick).
    Leaving,
    /// Adapter closed; finalizing artifacts and flushing transcription.
    PostProcessing,
    /// Terminal success.
    Ended,
    /// Terminal failure.
    FatalError,
}

impl BotState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::FatalError)
    }

    /// `true` while a worker process is expected to be heartbeating.
    pub fn expects_heartbeat(self) -> bool {
        matches!(
            self,
            Self::Joining
                | Self::JoinedNotRecording
                | Self::JoinedRecording
                | Self::Paused
                | Self::Leaving
        )
    }

    pub fn in_meeting(self) -> bool {
        matches!(
            self,
            Self::JoinedNotRecording | Self::JoinedRecording | Self::Paused
        )
    }

    /// Whether `self -> to` is a legal edge.
    ///
    /// Any non-terminal state may fall to [`BotState::FatalError`]; every
    /// other edge is explicit.
    pub fn can_transition(self, to: BotState) -> bool {
        if to == Self::FatalError {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Self::Scheduled, Self::Ready)
                | (Self::Ready, Self::Staged)
                | (Self::Staged, Self::Joining)
                // Retryable launch failure: the claim is rolled back and
                // the dispatcher backs off in READY.
                | (Self::Staged, Self::Ready)
                | (Self::Joining, Self::JoinedNotRecording)
                | (Self::Joining, Self::Leaving)
                | (Self::JoinedNotRecording, Self::JoinedRecording)
                | (Self::JoinedNotRecording, Self::Leaving)
                | (Self::JoinedRecording, Self::Paused)
                | (Self::JoinedRecording, Self::Leaving)
                | (Self::Paused, Self::JoinedRecording)
                | (Self::Paused, Self::Leaving)
                | (Self::Leaving, Self::PostProcessing)
                | (Self::PostProcessing, Self::Ended)
        )
    }
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Ready => "ready",
            Self::Staged => "staged",
            Self::Joining => "joining",
            Self::JoinedNotRecording => "joined_not_recording",
            Self::JoinedRecording => "joined_recording",
            Self::Paused => "paused",
            Self::Leaving => "leaving",
            Self::PostProcessing => "post_processing",
            Self::Ended => "ended",
            Self::FatalError => "fatal_error",
        };
        f.write_str(s)
    }
}

/// Discriminator between ordinary meeting bots and RTMS app sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BotKind {
    #[default]
    Meeting,
    AppSession,
}

/// What caused a transition; stored on every [`BotEvent`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Due,
    Claimed,
    LaunchFailed,
    Launched,
    JoinStarted,
    Admitted,
    Rejected,
    RecordingStarted,
    RecordingPaused,
    RecordingResumed,
    LeaveRequested,
    AutoLeave,
    MeetingEnded,
    Kicked,
    AdapterClosed,
    ArtifactsFinalized,
    FatalError,
    HeartbeatTimeout,
}

/// Well-known sub-state values carried next to a state for diagnostics
/// (`leaving.meeting_ended`, `fatal_error.adapter_crash`, …).
pub mod sub {
    pub const MEETING_ENDED: &str = "meeting_ended";
    pub const KICKED: &str = "kicked";
    pub const REJECTED: &str = "rejected";
    pub const LEAVE_REQUESTED: &str = "leave_requested";
    pub const ONLY_PARTICIPANT: &str = "only_participant";
    pub const SILENCE: &str = "silence";
    pub const MAX_DURATION: &str = "max_duration";
    pub const WAITING_ROOM_TIMEOUT: &str = "waiting_room_timeout";

    pub const ADAPTER_CRASH: &str = "adapter_crash";
    pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
    pub const CONFIG_INVALID: &str = "config_invalid";
    pub const LAUNCH_FAILED: &str = "launch_failed";
    pub const STALE_LAUNCH: &str = "stale_launch";
    pub const SHUTDOWN_GUARD_EXPIRED: &str = "shutdown_guard_expired";
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[BotState] = &[
        BotState::Scheduled,
        BotState::Ready,
        BotState::Staged,
        BotState::Joining,
        BotState::JoinedNotRecording,
        BotState::JoinedRecording,
        BotState::Paused,
        BotState::Leaving,
        BotState::PostProcessing,
        BotState::Ended,
        BotState::FatalError,
    ];

    #[test]
    fn happy_path_is_legal() {
        let path = [
            BotState::Scheduled,
            BotState::Ready,
            BotState::Staged,
            BotState::Joining,
            BotState::JoinedNotRecording,
            BotState::JoinedRecording,
            BotState::Leaving,
            BotState::PostProcessing,
            BotState::Ended,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn pause_resume_cycle() {
        assert!(BotState::JoinedRecording.can_transition(BotState::Paused));
        assert!(BotState::Paused.can_transition(BotState::JoinedRecording));
        assert!(BotState::Paused.can_transition(BotState::Leaving));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for &from in &[BotState::Ended, BotState::FatalError] {
            for &to in ALL {
                assert!(!from.can_transition(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn any_non_terminal_may_go_fatal() {
        for &from in ALL {
            if !from.is_terminal() {
                assert!(from.can_transition(BotState::FatalError));
            }
        }
    }

    #[test]
    fn launch_failure_rolls_back_to_ready() {
        assert!(BotState::Staged.can_transition(BotState::Ready));
        assert!(!BotState::Joining.can_transition(BotState::Ready));
    }

    #[test]
    fn no_skipping_join_handshake() {
        assert!(!BotState::Staged.can_transition(BotState::JoinedRecording));
        assert!(!BotState::Joining.can_transition(BotState::JoinedRecording));
        assert!(!BotState::Ready.can_transition(BotState::Joining));
    }

    #[test]
    fn heartbeat_window_matches_worker_lifetime() {
        assert!(!BotState::Staged.expects_heartbeat());
        assert!(BotState::Joining.expects_heartbeat());
        assert!(BotState::Leaving.expects_heartbeat());
        assert!(!BotState::PostProcessing.expects_heartbeat());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&BotState::JoinedNotRecording).unwrap();
        assert_eq!(json, "\"joined_not_recording\"");
    }
}
