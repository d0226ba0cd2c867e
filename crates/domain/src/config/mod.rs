mod billing;
mod dispatcher;
mod media;
mod server;
mod storage;
mod transcription;
mod webhooks;
mod worker;

pub use billing::*;
pub use dispatcher::*;
pub use media::*;
pub use server::*;
pub use storage::*;
pub use transcription::*;
pub use webhooks::*;
pub use worker::*;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

impl Config {
    /// Load configuration from `path`, or from `$QUORUM_CONFIG`, or from
    /// `./quorum.toml` when present, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let explicit = path.map(|p| p.to_path_buf()).or_else(|| {
            std::env::var("QUORUM_CONFIG")
                .ok()
                .filter(|v| !v.is_empty())
                .map(std::path::PathBuf::from)
        });

        let candidate = match explicit {
            Some(p) => {
                if !p.exists() {
                    return Err(Error::Config(format!(
                        "config file not found: {}",
                        p.display()
                    )));
                }
                Some(p)
            }
            None => {
                let default = std::path::PathBuf::from("quorum.toml");
                default.exists().then_some(default)
            }
        };

        match candidate {
            Some(p) => {
                let raw = std::fs::read_to_string(&p)?;
                let config: Config = toml::from_str(&raw)
                    .map_err(|e| Error::Config(format!("{}: {e}", p.display())))?;
                tracing::info!(path = %p.display(), "loaded configuration");
                Ok(config)
            }
            None => Ok(Config::default()),
        }
    }

    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error("server.port", "port must be greater than 0"));
        }
        if self.server.host.is_empty() {
            issues.push(ConfigIssue::error("server.host", "host must not be empty"));
        }

        if self.dispatcher.tick_secs == 0 {
            issues.push(ConfigIssue::error(
                "dispatcher.tick_secs",
                "tick interval must be greater than 0",
            ));
        }
        if self.dispatcher.lease_ttl_secs <= self.dispatcher.tick_secs {
            issues.push(ConfigIssue::warning(
                "dispatcher.lease_ttl_secs",
                "lease TTL should exceed the tick interval or leadership will flap",
            ));
        }
        if let LauncherConfig::Container(c) = &self.dispatcher.launcher {
            if c.endpoint.is_empty() {
                issues.push(ConfigIssue::error(
                    "dispatcher.launcher.endpoint",
                    "container launcher requires an orchestrator endpoint",
                ));
            } else if !c.endpoint.starts_with("http://") && !c.endpoint.starts_with("https://") {
                issues.push(ConfigIssue::error(
                    "dispatcher.launcher.endpoint",
                    format!(
                        "endpoint must start with http:// or https:// (got \"{}\")",
                        c.endpoint
                    ),
                ));
            }
            if c.image.is_empty() {
                issues.push(ConfigIssue::error(
                    "dispatcher.launcher.image",
                    "container launcher requires an image",
                ));
            }
        }

        if self.worker.heartbeat_interval_secs * 2 >= self.dispatcher.heartbeat_timeout_secs {
            issues.push(ConfigIssue::warning(
                "worker.heartbeat_interval_secs",
                "heartbeat interval is close to the janitor timeout; healthy workers may be reaped",
            ));
        }

        if self.webhooks.retry_offsets_secs.is_empty() {
            issues.push(ConfigIssue::error(
                "webhooks.retry_offsets_secs",
                "at least one delivery attempt offset is required",
            ));
        }
        if self.webhooks.retry_offsets_secs.first() != Some(&0) {
            issues.push(ConfigIssue::warning(
                "webhooks.retry_offsets_secs",
                "first offset is not 0; initial delivery will be delayed",
            ));
        }

        match &self.storage {
            StorageConfig::Memory => issues.push(ConfigIssue::warning(
                "storage.backend",
                "memory backend persists nothing; recordings are lost on restart",
            )),
            StorageConfig::S3(s3) => {
                if s3.bucket.is_empty() {
                    issues.push(ConfigIssue::error("storage.s3.bucket", "bucket must not be empty"));
                }
                if s3.endpoint.is_empty() {
                    issues.push(ConfigIssue::error(
                        "storage.s3.endpoint",
                        "endpoint must not be empty",
                    ));
                }
            }
            StorageConfig::Swift(swift) => {
                if swift.auth_url.is_empty() {
                    issues.push(ConfigIssue::error(
                        "storage.swift.auth_url",
                        "auth_url must not be empty",
                    ));
                }
                if swift.container.is_empty() {
                    issues.push(ConfigIssue::error(
                        "storage.swift.container",
                        "container must not be empty",
                    ));
                }
            }
        }

        for (key, rate) in self.billing.rates_table() {
            if rate == 0 {
                issues.push(ConfigIssue::warning(
                    "billing.rates",
                    format!("rate for {key} is 0; such bots run for free"),
                ));
            }
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credential sealing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Environment variable holding the 32-byte (64 hex chars) AES key that
    /// seals rows in the credential table.
    #[serde(default = "d_credentials_key_env")]
    pub key_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            key_env: d_credentials_key_env(),
        }
    }
}

fn d_credentials_key_env() -> String {
    "QUORUM_CREDENTIALS_KEY".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}
