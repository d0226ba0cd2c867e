//! Worker launchers.
//!
//! A launcher spawns the isolation unit for one bot and returns once the
//! worker has accepted the id; it never waits for JOINING. Spawn
//! failures surface as errors and the dispatcher decides between backoff
//! and FATAL.

use std::sync::Arc;

use qm_domain::config::{ContainerLauncherConfig, LauncherConfig};
use qm_domain::platform::PlatformClass;
use qm_domain::{Error, Result};
use qm_store::Bot;

use crate::state::AppState;

/// Handle to a spawned worker; informational only, the store is the
/// source of truth for liveness.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub description: String,
}

#[async_trait::async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, bot: &Bot) -> Result<WorkerHandle>;
}

/// Build the configured launcher for standalone dispatchers.
pub fn from_config(config: &LauncherConfig) -> Arc<dyn Launcher> {
    match config {
        LauncherConfig::Process => Arc::new(ProcessLauncher),
        LauncherConfig::Container(container) => Arc::new(ContainerLauncher::new(container.clone())),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process launcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Forks the current executable with `run-worker --bot-id …`. Requires a
/// store implementation shared across processes.
pub struct ProcessLauncher;

#[async_trait::async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, bot: &Bot) -> Result<WorkerHandle> {
        let exe = std::env::current_exe()?;
        let child = tokio::process::Command::new(&exe)
            .arg("run-worker")
            .arg("--bot-id")
            .arg(&bot.object_id)
            .env("QUORUM_BOT_ID", &bot.object_id)
            .spawn()
            .map_err(|e| Error::Other(format!("spawning worker: {e}")))?;
        let pid = child.id().unwrap_or_default();
        tracing::info!(bot_id = %bot.object_id, pid, "worker process spawned");
        Ok(WorkerHandle {
            description: format!("process {pid}"),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Container launcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Submits a job manifest to a container orchestrator endpoint. Resource
/// requests are tuned per platform class: native SDK hosts get the most,
/// stream ingest the least.
pub struct ContainerLauncher {
    config: ContainerLauncherConfig,
    client: reqwest::Client,
}

impl ContainerLauncher {
    pub fn new(config: ContainerLauncherConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn resources(class: PlatformClass) -> (&'static str, &'static str) {
        match class {
            PlatformClass::Native => ("2000m", "4Gi"),
            PlatformClass::Browser => ("1000m", "2Gi"),
            PlatformClass::Ingest => ("250m", "512Mi"),
        }
    }

    fn manifest(&self, bot: &Bot) -> serde_json::Value {
        let (cpu, memory) = Self::resources(bot.platform.class());
        serde_json::json!({
            "name": format!("quorum-worker-{}", bot.object_id),
            "namespace": self.config.namespace,
            "image": self.config.image,
            "command": ["quorum", "run-worker", "--bot-id", bot.object_id],
            "env": { "QUORUM_BOT_ID": bot.object_id },
            "resources": { "cpu": cpu, "memory": memory },
            "restart_policy": "Never",
        })
    }
}

#[async_trait::async_trait]
impl Launcher for ContainerLauncher {
    async fn launch(&self, bot: &Bot) -> Result<WorkerHandle> {
        let manifest = self.manifest(bot);
        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&manifest)
            .send()
            .await
            .map_err(|e| Error::Http(format!("submitting job: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "orchestrator rejected job: {}",
                response.status()
            )));
        }
        tracing::info!(bot_id = %bot.object_id, "worker job submitted");
        Ok(WorkerHandle {
            description: format!("job quorum-worker-{}", bot.object_id),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process launcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs the controller as a tokio task in this process. Used by the
/// embedded dispatcher (dev mode, in-memory store) and by tests; gives
/// up process isolation in exchange for a shared store.
pub struct TaskLauncher {
    state: AppState,
}

impl TaskLauncher {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl Launcher for TaskLauncher {
    async fn launch(&self, bot: &Bot) -> Result<WorkerHandle> {
        let state = self.state.clone();
        let bot = bot.clone();
        let object_id = bot.object_id.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::worker::controller::run_bot(state, bot).await {
                tracing::error!(error = %e, "in-process worker failed");
            }
        });
        Ok(WorkerHandle {
            description: format!("task {object_id}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use qm_domain::bot::{BotKind, BotState};
    use qm_domain::platform::Platform;
    use qm_domain::settings::BotSettings;
    use uuid::Uuid;

    fn bot(platform: Platform) -> Bot {
        Bot {
            id: Uuid::new_v4(),
            object_id: "bot_m".into(),
            project_id: Uuid::new_v4(),
            kind: BotKind::Meeting,
            meeting_url: "https://zoom.us/j/1".into(),
            platform,
            name: "n".into(),
            state: BotState::Staged,
            sub_state: None,
            join_at: None,
            deduplication_key: None,
            settings: BotSettings::default(),
            metadata: serde_json::Value::Null,
            desired_action: None,
            heartbeat_at: None,
            first_ready_at: None,
            launch_attempts: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn manifest_resources_scale_with_platform() {
        let launcher = ContainerLauncher::new(ContainerLauncherConfig {
            endpoint: "http://orchestrator/jobs".into(),
            image: "quorum:latest".into(),
            namespace: "bots".into(),
        });

        let native = launcher.manifest(&bot(Platform::ZoomNative));
        assert_eq!(native["resources"]["cpu"], "2000m");
        assert_eq!(native["namespace"], "bots");
        assert_eq!(native["command"][2], "--bot-id");

        let ingest = launcher.manifest(&bot(Platform::ZoomRtms));
        assert_eq!(ingest["resources"]["cpu"], "250m");
        assert_eq!(ingest["resources"]["memory"], "512Mi");
    }
}
