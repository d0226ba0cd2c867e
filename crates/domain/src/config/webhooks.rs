use serde::{Deserialize, Serialize};

/// Webhook delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default = "d_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "d_total_timeout")]
    pub total_timeout_secs: u64,
    /// Delivery worker pool size.
    #[serde(default = "d_workers")]
    pub workers: usize,
    /// Attempt offsets from enqueue time, in seconds. The list length is
    /// the maximum attempt count.
    #[serde(default = "d_retry_offsets")]
    pub retry_offsets_secs: Vec<u64>,
    /// Non-2xx response bodies are truncated to this many bytes before
    /// being recorded.
    #[serde(default = "d_max_response_bytes")]
    pub max_response_bytes: usize,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: d_connect_timeout(),
            total_timeout_secs: d_total_timeout(),
            workers: d_workers(),
            retry_offsets_secs: d_retry_offsets(),
            max_response_bytes: d_max_response_bytes(),
        }
    }
}

fn d_connect_timeout() -> u64 {
    10
}
fn d_total_timeout() -> u64 {
    30
}
fn d_workers() -> usize {
    4
}
fn d_retry_offsets() -> Vec<u64> {
    vec![0, 30, 120, 600, 3600]
}
fn d_max_response_bytes() -> usize {
    4096
}
