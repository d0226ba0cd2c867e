/// Shared error type used across all Quorum crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("store: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("config: {0}")]
    Config(String),

    #[error("credential: {0}")]
    Credential(String),

    #[error("adapter: {0}")]
    Adapter(String),

    #[error("pipeline: {0}")]
    Pipeline(String),

    #[error("transcription {provider}: {message}")]
    Transcription { provider: String, message: String },

    #[error("object storage: {0}")]
    Storage(String),

    #[error("billing: {0}")]
    Billing(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
