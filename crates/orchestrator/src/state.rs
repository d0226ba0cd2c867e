//! Shared application state.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use qm_adapter::AdapterRegistry;
use qm_blobstore::ObjectStore;
use qm_domain::config::Config;
use qm_domain::Result;
use qm_store::{CredentialCipher, MemoryStore, Store};
use qm_webhooks::WebhookEmitter;

use crate::partials::PartialCache;

/// Shared state passed to API handlers, the dispatcher and workers.
///
/// Process-wide state is exactly this (plus the tracing subscriber);
/// everything else is owned by a component and passed explicitly.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub blobs: Arc<dyn ObjectStore>,
    pub adapters: Arc<AdapterRegistry>,
    pub emitter: WebhookEmitter,
    /// Read-through cache of interim transcripts per bot.
    pub partials: Arc<PartialCache>,
    /// Sealer for the credential table; `None` when no key is configured
    /// (credentials unusable, bots relying on them fail at STAGED).
    pub credential_cipher: Option<CredentialCipher>,
    /// SHA-256 of the API bearer token; `None` = unauthenticated dev mode.
    pub api_token_hash: Option<Vec<u8>>,
}

impl AppState {
    /// Assemble state from configuration with the in-memory store.
    pub fn build(config: Arc<Config>) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        Self::with_store(config, store)
    }

    /// Assemble state around an existing store (tests, alternative
    /// store implementations).
    pub fn with_store(config: Arc<Config>, store: Arc<dyn Store>) -> Result<Self> {
        let blobs = qm_blobstore::from_config(&config.storage)?;
        let adapters = Arc::new(AdapterRegistry::with_defaults());
        let emitter = WebhookEmitter::new(store.clone());

        let credential_cipher = match CredentialCipher::from_env(&config.credentials.key_env) {
            Ok(cipher) => Some(cipher),
            Err(e) => {
                tracing::warn!(error = %e, "credential cipher unavailable");
                None
            }
        };

        let api_token_hash = std::env::var(&config.server.token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .map(|token| Sha256::digest(token.as_bytes()).to_vec());
        if api_token_hash.is_none() {
            tracing::warn!(
                var = %config.server.token_env,
                "API token not set; the API is unauthenticated"
            );
        }

        Ok(Self {
            config,
            store,
            blobs,
            adapters,
            emitter,
            partials: Arc::new(PartialCache::new()),
            credential_cipher,
            api_token_hash,
        })
    }
}
