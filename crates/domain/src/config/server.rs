use serde::{Deserialize, Serialize};

/// Inbound API server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Environment variable holding the API bearer token. When the variable
    /// is unset the API runs unauthenticated (local development only).
    #[serde(default = "d_token_env")]
    pub token_env: String,
    /// Run the dispatcher inside `serve-api` instead of as its own process.
    #[serde(default)]
    pub embedded_dispatcher: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            token_env: d_token_env(),
            embedded_dispatcher: false,
        }
    }
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8311
}
fn d_token_env() -> String {
    "QUORUM_API_TOKEN".into()
}
