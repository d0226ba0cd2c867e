use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Quorum — a meeting-bot orchestration service.
#[derive(Debug, Parser)]
#[command(name = "quorum", version, about)]
pub struct Cli {
    /// Path to the configuration file (defaults to $QUORUM_CONFIG, then
    /// ./quorum.toml, then built-in defaults).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the internal HTTP API (embeds the dispatcher when
    /// `server.embedded_dispatcher` is set).
    ServeApi,
    /// Run the dispatcher: materialize scheduled bots, launch workers,
    /// reap dead ones.
    RunDispatcher,
    /// Run a single bot worker. This is the per-bot isolation unit the
    /// launchers spawn.
    RunWorker {
        /// The bot's opaque id (`bot_…` / `sess_…`).
        #[arg(long, env = "QUORUM_BOT_ID")]
        bot_id: String,
    },
    /// Run the webhook delivery worker pool.
    RunWebhookDelivery,
    /// Validate configuration and prepare the store's on-disk layout.
    Migrate,
}
