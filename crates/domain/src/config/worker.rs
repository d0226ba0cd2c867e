use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-bot worker process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between heartbeat writes to the bot row.
    #[serde(default = "d_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Hard ceiling on the leave → post-processing handover. When it
    /// expires, unflushed transcription sessions are abandoned.
    #[serde(default = "d_shutdown_guard")]
    pub shutdown_guard_secs: u64,
    /// How long the adapter gets to deliver its terminal event after
    /// `leave()` (contract says 60 s).
    #[serde(default = "d_adapter_close")]
    pub adapter_close_timeout_secs: u64,
    /// Scratch directory for in-progress recording files.
    #[serde(default = "d_scratch_dir")]
    pub scratch_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: d_heartbeat_interval(),
            shutdown_guard_secs: d_shutdown_guard(),
            adapter_close_timeout_secs: d_adapter_close(),
            scratch_dir: d_scratch_dir(),
        }
    }
}

fn d_heartbeat_interval() -> u64 {
    15
}
fn d_shutdown_guard() -> u64 {
    120
}
fn d_adapter_close() -> u64 {
    60
}
fn d_scratch_dir() -> PathBuf {
    PathBuf::from("./data/scratch")
}
