use serde::{Deserialize, Serialize};

/// Dispatcher and launcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Seconds between dispatcher ticks.
    #[serde(default = "d_tick")]
    pub tick_secs: u64,
    /// Launch this many seconds before `join_at` to absorb spawn latency.
    #[serde(default = "d_pre_roll")]
    pub pre_roll_secs: u64,
    /// A worker whose heartbeat is older than this is presumed dead.
    #[serde(default = "d_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Base delay for launch-failure backoff; doubles per attempt.
    #[serde(default = "d_launch_backoff_base")]
    pub launch_backoff_base_secs: u64,
    /// Give up relaunching a bot this long after it first became ready.
    #[serde(default = "d_launch_retry_cap")]
    pub launch_retry_cap_secs: u64,
    /// Leader-lease TTL per tenant shard.
    #[serde(default = "d_lease_ttl")]
    pub lease_ttl_secs: u64,
    /// Number of tenant shards; projects hash onto shards and each shard
    /// has one dispatcher leader at a time.
    #[serde(default = "d_shards")]
    pub shards: u32,
    #[serde(default)]
    pub launcher: LauncherConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_secs: d_tick(),
            pre_roll_secs: d_pre_roll(),
            heartbeat_timeout_secs: d_heartbeat_timeout(),
            launch_backoff_base_secs: d_launch_backoff_base(),
            launch_retry_cap_secs: d_launch_retry_cap(),
            lease_ttl_secs: d_lease_ttl(),
            shards: d_shards(),
            launcher: LauncherConfig::default(),
        }
    }
}

/// How workers are spawned.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LauncherConfig {
    /// Fork the current executable with `run-worker --bot-id …`.
    #[default]
    Process,
    /// Submit a job manifest to a container orchestrator.
    Container(ContainerLauncherConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLauncherConfig {
    /// Orchestrator job-submission endpoint.
    pub endpoint: String,
    /// Worker image reference.
    pub image: String,
    #[serde(default = "d_namespace")]
    pub namespace: String,
}

fn d_tick() -> u64 {
    5
}
fn d_pre_roll() -> u64 {
    60
}
fn d_heartbeat_timeout() -> u64 {
    120
}
fn d_launch_backoff_base() -> u64 {
    5
}
fn d_launch_retry_cap() -> u64 {
    600
}
fn d_lease_ttl() -> u64 {
    15
}
fn d_shards() -> u32 {
    1
}
fn d_namespace() -> String {
    "default".into()
}
