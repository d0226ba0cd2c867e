//! The dispatcher: materializes scheduled bots, launches workers, and
//! reaps the dead.
//!
//! Single-writer per tenant shard via store leases; every phase is a CAS
//! transition, so replaying a tick is harmless and two dispatchers never
//! double-launch. Launch failures back off in READY and only go fatal
//! once the retry budget is spent.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use qm_domain::bot::{sub, BotState, EventKind};
use qm_domain::Result;
use qm_store::{Bot, Store};

use crate::billing::runtime_debit;
use crate::launcher::Launcher;
use crate::state::AppState;
use crate::worker::controller::{notify_credits_low, transition_and_emit};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub matured: usize,
    pub launched: usize,
    pub launch_failures: usize,
    pub reaped: usize,
}

pub struct Dispatcher {
    state: AppState,
    launcher: Arc<dyn Launcher>,
    /// Lease holder identity for this dispatcher instance.
    holder: String,
    /// Organizations already warned about empty balances by this
    /// instance (the launch gate; threshold crossings during debits are
    /// flagged by the store).
    warned_organizations: Mutex<HashSet<Uuid>>,
}

impl Dispatcher {
    pub fn new(state: AppState, launcher: Arc<dyn Launcher>) -> Self {
        let holder = format!(
            "{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        );
        Self {
            state,
            launcher,
            holder,
            warned_organizations: Mutex::new(HashSet::new()),
        }
    }

    /// Tick forever until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let tick = Duration::from_secs(self.state.config.dispatcher.tick_secs);
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(stats) if stats != TickStats::default() => {
                            tracing::info!(
                                matured = stats.matured,
                                launched = stats.launched,
                                launch_failures = stats.launch_failures,
                                reaped = stats.reaped,
                                "dispatcher tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "dispatcher tick failed"),
                    }
                }
                _ = cancel.cancelled() => {
                    for shard in 0..self.state.config.dispatcher.shards {
                        let _ = self.state.store.release_lease(shard, &self.holder).await;
                    }
                    return;
                }
            }
        }
    }

    /// One idempotent pass over every shard this instance can lease.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickStats> {
        let config = &self.state.config.dispatcher;
        let mut stats = TickStats::default();
        let shards = config.shards.max(1);
        let ttl = Duration::from_secs(config.lease_ttl_secs);

        let mut held = HashSet::new();
        for shard in 0..shards {
            if self
                .state
                .store
                .try_acquire_lease(shard, &self.holder, ttl)
                .await?
            {
                held.insert(shard);
            }
        }
        if held.is_empty() {
            return Ok(stats);
        }

        self.mature_scheduled(now, shards, &held, &mut stats).await?;
        self.launch_ready(now, shards, &held, &mut stats).await?;
        self.reap_stale(now, shards, &held, &mut stats).await?;
        Ok(stats)
    }

    fn owns(&self, shards: u32, held: &HashSet<u32>, project_id: Uuid) -> bool {
        held.contains(&shard_of(project_id, shards))
    }

    // ── Phase 1: SCHEDULED → READY ───────────────────────────────────

    async fn mature_scheduled(
        &self,
        now: DateTime<Utc>,
        shards: u32,
        held: &HashSet<u32>,
        stats: &mut TickStats,
    ) -> Result<()> {
        let pre_roll = Duration::from_secs(self.state.config.dispatcher.pre_roll_secs);
        for bot in self.state.store.due_scheduled(now, pre_roll).await? {
            if !self.owns(shards, held, bot.project_id) {
                continue;
            }
            if transition_and_emit(
                &self.state,
                bot.id,
                &[BotState::Scheduled],
                BotState::Ready,
                EventKind::Due,
                None,
                serde_json::Value::Null,
                None,
            )
            .await?
            .is_some()
            {
                stats.matured += 1;
            }
        }
        Ok(())
    }

    // ── Phase 2: READY → STAGED → launch ─────────────────────────────

    async fn launch_ready(
        &self,
        now: DateTime<Utc>,
        shards: u32,
        held: &HashSet<u32>,
        stats: &mut TickStats,
    ) -> Result<()> {
        let config = &self.state.config.dispatcher;
        for bot in self.state.store.ready_bots().await? {
            if !self.owns(shards, held, bot.project_id) {
                continue;
            }

            // Launch-retry backoff anchored at first readiness.
            let first_ready = bot.first_ready_at.unwrap_or(bot.created_at);
            if bot.launch_attempts > 0 {
                let backoff = config.launch_backoff_base_secs
                    * (2u64.saturating_pow(bot.launch_attempts - 1));
                let allowed = first_ready + chrono::Duration::seconds(backoff.min(86_400) as i64);
                if now < allowed {
                    continue;
                }
                if now - first_ready
                    > chrono::Duration::seconds(config.launch_retry_cap_secs as i64)
                {
                    transition_and_emit(
                        &self.state,
                        bot.id,
                        &[BotState::Ready],
                        BotState::FatalError,
                        EventKind::FatalError,
                        Some(sub::LAUNCH_FAILED),
                        serde_json::json!({ "launch_attempts": bot.launch_attempts }),
                        None,
                    )
                    .await?;
                    stats.launch_failures += 1;
                    continue;
                }
            }

            // Credit gate: exhausted organizations keep the bot in READY.
            let organization = self
                .state
                .store
                .organization_for_project(bot.project_id)
                .await?;
            if organization.credits_mc <= 0 && !organization.allow_negative_credits {
                if self.warned_organizations.lock().insert(organization.id) {
                    tracing::warn!(
                        organization = %organization.name,
                        credits_mc = organization.credits_mc,
                        "credits exhausted; holding launches"
                    );
                    notify_credits_low(&self.state, bot.project_id).await;
                }
                continue;
            }

            // CAS claim; losing the race is fine.
            let Some(claimed) = transition_and_emit(
                &self.state,
                bot.id,
                &[BotState::Ready],
                BotState::Staged,
                EventKind::Claimed,
                None,
                serde_json::Value::Null,
                None,
            )
            .await?
            else {
                continue;
            };

            match self.launcher.launch(&claimed).await {
                Ok(handle) => {
                    tracing::debug!(bot_id = %claimed.object_id, worker = %handle.description, "launched");
                    stats.launched += 1;
                }
                Err(e) => {
                    tracing::warn!(bot_id = %claimed.object_id, error = %e, "launch failed");
                    let attempts = self.state.store.record_launch_attempt(bot.id).await?;
                    stats.launch_failures += 1;
                    // Roll the claim back and back off in READY; the
                    // retry-cap check above turns this fatal eventually.
                    transition_and_emit(
                        &self.state,
                        bot.id,
                        &[BotState::Staged],
                        BotState::Ready,
                        EventKind::LaunchFailed,
                        None,
                        serde_json::json!({ "error": e.to_string(), "attempts": attempts }),
                        None,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    // ── Phase 3: janitor ─────────────────────────────────────────────

    async fn reap_stale(
        &self,
        now: DateTime<Utc>,
        shards: u32,
        held: &HashSet<u32>,
        stats: &mut TickStats,
    ) -> Result<()> {
        let timeout = Duration::from_secs(self.state.config.dispatcher.heartbeat_timeout_secs);
        for bot in self.state.store.stale_heartbeats(now, timeout).await? {
            if !self.owns(shards, held, bot.project_id) {
                continue;
            }
            let duration_ms = observed_runtime_ms(&self.state, &bot).await?;
            let debit = runtime_debit(
                &self.state.config.billing,
                bot.platform,
                bot.settings.recording_type,
                duration_ms,
            );
            if transition_and_emit(
                &self.state,
                bot.id,
                &[
                    BotState::Joining,
                    BotState::JoinedNotRecording,
                    BotState::JoinedRecording,
                    BotState::Paused,
                    BotState::Leaving,
                ],
                BotState::FatalError,
                EventKind::HeartbeatTimeout,
                Some(sub::HEARTBEAT_TIMEOUT),
                serde_json::json!({
                    "last_heartbeat": bot.heartbeat_at.map(|t| t.to_rfc3339()),
                    "duration_ms": duration_ms,
                }),
                debit,
            )
            .await?
            .is_some()
            {
                tracing::warn!(bot_id = %bot.object_id, "reaped dead worker");
                stats.reaped += 1;
            }
        }
        Ok(())
    }
}

/// Best-known runtime of a dead bot: admission event to last heartbeat.
async fn observed_runtime_ms(state: &AppState, bot: &Bot) -> Result<u64> {
    let events = state.store.bot_events(bot.id).await?;
    Ok(runtime_from_events(
        &events,
        bot.heartbeat_at.unwrap_or(bot.updated_at),
    ))
}

fn runtime_from_events(events: &[qm_store::BotEvent], end: DateTime<Utc>) -> u64 {
    let Some(admitted) = events
        .iter()
        .find(|e| e.new_state == BotState::JoinedNotRecording)
    else {
        return 0;
    };
    (end - admitted.created_at).num_milliseconds().max(0) as u64
}

/// Stable project → shard assignment.
pub fn shard_of(project_id: Uuid, shards: u32) -> u32 {
    let bytes = project_id.as_bytes();
    let hash = bytes
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u32));
    hash % shards.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qm_domain::bot::BotKind;
    use qm_domain::config::Config;
    use qm_domain::settings::BotSettings;
    use qm_domain::Error;
    use qm_store::{MemoryStore, NewBot, Store};

    use crate::launcher::WorkerHandle;

    /// Launcher that records launches and can be told to fail.
    struct FakeLauncher {
        launched: Mutex<Vec<String>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl FakeLauncher {
        fn new() -> Self {
            Self {
                launched: Mutex::new(Vec::new()),
                fail: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self, bot: &Bot) -> Result<WorkerHandle> {
            if self.fail.load(std::sync::atomic::Ordering::Acquire) {
                return Err(Error::Other("quota exceeded".into()));
            }
            self.launched.lock().push(bot.object_id.clone());
            Ok(WorkerHandle {
                description: "fake".into(),
            })
        }
    }

    async fn fixture(
        credits_mc: i64,
    ) -> (AppState, Arc<FakeLauncher>, Dispatcher, Uuid, Uuid) {
        let config = Arc::new(Config::default());
        let store = Arc::new(MemoryStore::new());
        let state = AppState::with_store(config, store).unwrap();
        let org = state.store.create_organization("acme", credits_mc).await.unwrap();
        let project = state.store.create_project(org.id, "p").await.unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let dispatcher = Dispatcher::new(state.clone(), launcher.clone());
        (state, launcher, dispatcher, org.id, project.id)
    }

    fn new_bot(project_id: Uuid, join_at: Option<DateTime<Utc>>) -> NewBot {
        NewBot {
            project_id,
            kind: BotKind::Meeting,
            meeting_url: "https://zoom.us/j/1".into(),
            name: "Notetaker".into(),
            join_at,
            deduplication_key: None,
            settings: BotSettings::default(),
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn scheduled_bot_matures_inside_pre_roll_then_launches() {
        let (state, launcher, dispatcher, _, project_id) = fixture(100_000).await;
        let join_at = Utc::now() + chrono::Duration::seconds(120);
        let bot = state
            .store
            .create_bot(new_bot(project_id, Some(join_at)))
            .await
            .unwrap()
            .into_bot();

        // Too early: join_at - pre_roll (60s) has not passed.
        let stats = dispatcher.tick(Utc::now()).await.unwrap();
        assert_eq!(stats.matured, 0);
        assert_eq!(state.store.bot(bot.id).await.unwrap().state, BotState::Scheduled);

        // At join_at - 60s the bot matures, is claimed and launched in
        // one tick.
        let stats = dispatcher
            .tick(Utc::now() + chrono::Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(stats.matured, 1);
        assert_eq!(stats.launched, 1);
        assert_eq!(state.store.bot(bot.id).await.unwrap().state, BotState::Staged);
        assert_eq!(launcher.launched.lock().len(), 1);
    }

    #[tokio::test]
    async fn tick_is_idempotent_no_double_launch() {
        let (state, launcher, dispatcher, _, project_id) = fixture(100_000).await;
        state
            .store
            .create_bot(new_bot(project_id, None))
            .await
            .unwrap();

        let now = Utc::now();
        let first = dispatcher.tick(now).await.unwrap();
        assert_eq!(first.launched, 1);
        let second = dispatcher.tick(now).await.unwrap();
        assert_eq!(second.launched, 0, "replayed tick must not double-launch");
        assert_eq!(launcher.launched.lock().len(), 1);
    }

    #[tokio::test]
    async fn launch_failure_backs_off_then_goes_fatal() {
        let (state, launcher, dispatcher, _, project_id) = fixture(100_000).await;
        launcher.fail.store(true, std::sync::atomic::Ordering::Release);
        let bot = state
            .store
            .create_bot(new_bot(project_id, None))
            .await
            .unwrap()
            .into_bot();

        let now = Utc::now();
        let stats = dispatcher.tick(now).await.unwrap();
        assert_eq!(stats.launch_failures, 1);
        let after = state.store.bot(bot.id).await.unwrap();
        assert_eq!(after.state, BotState::Ready, "rolled back for retry");
        assert_eq!(after.launch_attempts, 1);

        // Within the backoff window nothing happens.
        let stats = dispatcher.tick(now + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(stats.launch_failures, 0);

        // Past the retry cap (10 min) the bot goes fatal.
        let stats = dispatcher
            .tick(now + chrono::Duration::seconds(601))
            .await
            .unwrap();
        assert_eq!(stats.launch_failures, 1);
        let after = state.store.bot(bot.id).await.unwrap();
        assert_eq!(after.state, BotState::FatalError);
        assert_eq!(after.sub_state.as_deref(), Some(sub::LAUNCH_FAILED));
    }

    #[tokio::test]
    async fn exhausted_credits_hold_the_bot_in_ready() {
        let (state, launcher, dispatcher, org_id, project_id) = fixture(0).await;
        let bot = state
            .store
            .create_bot(new_bot(project_id, None))
            .await
            .unwrap()
            .into_bot();

        let stats = dispatcher.tick(Utc::now()).await.unwrap();
        assert_eq!(stats.launched, 0);
        assert_eq!(state.store.bot(bot.id).await.unwrap().state, BotState::Ready);
        assert!(launcher.launched.lock().is_empty());

        // Allow-negative flips the gate open.
        state.store.set_allow_negative_credits(org_id, true).await.unwrap();
        let stats = dispatcher.tick(Utc::now()).await.unwrap();
        assert_eq!(stats.launched, 1);
    }

    #[test]
    fn reaped_runtime_is_admission_to_last_heartbeat() {
        use qm_domain::settings::RecordingType;
        use qm_store::BotEvent;

        let admitted_at = Utc::now();
        let events = vec![BotEvent {
            id: Uuid::new_v4(),
            bot_id: Uuid::new_v4(),
            old_state: BotState::Joining,
            new_state: BotState::JoinedNotRecording,
            event_type: EventKind::Admitted,
            sub_type: None,
            metadata: serde_json::Value::Null,
            created_at: admitted_at,
        }];

        // Worker died 20 s in: billed as one started minute.
        let last_heartbeat = admitted_at + chrono::Duration::seconds(20);
        let duration_ms = runtime_from_events(&events, last_heartbeat);
        assert_eq!(duration_ms, 20_000);
        let billing = qm_domain::config::BillingConfig::default();
        let debit = runtime_debit(
            &billing,
            qm_domain::platform::Platform::ZoomNative,
            RecordingType::AudioAndVideo,
            duration_ms,
        )
        .unwrap();
        assert_eq!(debit.amount_mc, billing.native_audio_video_mc);

        // Never admitted: nothing to bill.
        assert_eq!(runtime_from_events(&[], last_heartbeat), 0);
    }

    #[tokio::test]
    async fn janitor_reaps_stale_worker_and_debits_runtime() {
        let (state, _launcher, dispatcher, org_id, project_id) = fixture(100_000).await;
        let bot = state
            .store
            .create_bot(new_bot(project_id, None))
            .await
            .unwrap()
            .into_bot();

        // Simulate a worker that joined, recorded a heartbeat, then died.
        for (from, to, event) in [
            (BotState::Ready, BotState::Staged, EventKind::Claimed),
            (BotState::Staged, BotState::Joining, EventKind::JoinStarted),
            (BotState::Joining, BotState::JoinedNotRecording, EventKind::Admitted),
            (BotState::JoinedNotRecording, BotState::JoinedRecording, EventKind::RecordingStarted),
        ] {
            state
                .store
                .transition(
                    bot.id,
                    qm_store::TransitionRequest::new(&[from], to, event),
                )
                .await
                .unwrap();
        }
        state.store.heartbeat(bot.id).await.unwrap();

        // Two minutes later, with no fresh heartbeat, the janitor fires.
        let stats = dispatcher
            .tick(Utc::now() + chrono::Duration::seconds(125))
            .await
            .unwrap();
        assert_eq!(stats.reaped, 1);
        let after = state.store.bot(bot.id).await.unwrap();
        assert_eq!(after.state, BotState::FatalError);
        assert_eq!(after.sub_state.as_deref(), Some(sub::HEARTBEAT_TIMEOUT));

        // The terminal event records the observed runtime; with admission
        // and heartbeat microseconds apart here, the billed amount is the
        // (zero-duration) floor, so only the bookkeeping is asserted.
        let events = state.store.bot_events(bot.id).await.unwrap();
        let terminal = events.last().unwrap();
        assert!(terminal.metadata.get("duration_ms").is_some());
        let org = state.store.organization(org_id).await.unwrap();
        assert!(org.credits_mc <= 100_000);

        // A second tick finds nothing: the bot is terminal.
        let stats = dispatcher
            .tick(Utc::now() + chrono::Duration::seconds(130))
            .await
            .unwrap();
        assert_eq!(stats.reaped, 0);
    }

    #[tokio::test]
    async fn lease_blocks_a_second_dispatcher() {
        let (state, _launcher, dispatcher_a, _, project_id) = fixture(100_000).await;
        let launcher_b = Arc::new(FakeLauncher::new());
        let dispatcher_b = Dispatcher::new(state.clone(), launcher_b.clone());

        state
            .store
            .create_bot(new_bot(project_id, None))
            .await
            .unwrap();

        let now = Utc::now();
        let stats_a = dispatcher_a.tick(now).await.unwrap();
        assert_eq!(stats_a.launched, 1);
        // B cannot acquire the lease while A holds it, so its tick is a
        // no-op even with work visible.
        let stats_b = dispatcher_b.tick(now).await.unwrap();
        assert_eq!(stats_b, TickStats::default());
    }

    #[test]
    fn shard_assignment_is_stable_and_in_range() {
        let id = Uuid::new_v4();
        let a = shard_of(id, 8);
        let b = shard_of(id, 8);
        assert_eq!(a, b);
        assert!(a < 8);
        assert_eq!(shard_of(id, 1), 0);
    }
}
