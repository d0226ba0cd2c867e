use serde::{Deserialize, Serialize};

/// Object storage backend selection, tagged by `backend` in the
/// `[storage]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In-memory store; tests and local development only.
    #[default]
    Memory,
    S3(S3Config),
    Swift(SwiftConfig),
}

/// S3-compatible backend (AWS, MinIO, Ceph RGW).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "d_region")]
    pub region: String,
    /// Path-style addressing (`endpoint/bucket/key`) instead of
    /// virtual-host style; required by most self-hosted S3 clones.
    #[serde(default = "d_true")]
    pub path_style: bool,
    #[serde(default = "d_access_key_env")]
    pub access_key_env: String,
    #[serde(default = "d_secret_key_env")]
    pub secret_key_env: String,
}

/// OpenStack Swift with application-credential auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwiftConfig {
    /// Keystone v3 auth endpoint.
    pub auth_url: String,
    pub container: String,
    #[serde(default = "d_app_cred_id_env")]
    pub application_credential_id_env: String,
    #[serde(default = "d_app_cred_secret_env")]
    pub application_credential_secret_env: String,
    /// Account Temp-URL key used to mint signed download links.
    #[serde(default = "d_temp_url_key_env")]
    pub temp_url_key_env: String,
}

fn d_region() -> String {
    "us-east-1".into()
}
fn d_true() -> bool {
    true
}
fn d_access_key_env() -> String {
    "QUORUM_S3_ACCESS_KEY".into()
}
fn d_secret_key_env() -> String {
    "QUORUM_S3_SECRET_KEY".into()
}
fn d_app_cred_id_env() -> String {
    "QUORUM_SWIFT_CREDENTIAL_ID".into()
}
fn d_app_cred_secret_env() -> String {
    "QUORUM_SWIFT_CREDENTIAL_SECRET".into()
}
fn d_temp_url_key_env() -> String {
    "QUORUM_SWIFT_TEMP_URL_KEY".into()
}
