//! In-memory object store for tests and local development.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;

use qm_domain::{Error, Result};

use crate::ObjectStore;

#[derive(Default)]
pub struct MemoryObjectStore {
    blobs: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<String> {
        let etag = format!("\"{:x}\"", data.len() ^ 0x9E3779B9);
        self.blobs
            .write()
            .insert(key.to_owned(), (data, content_type.to_owned()));
        Ok(etag)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| Error::NotFound(format!("object {key}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().remove(key);
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "memory://{key}?expires_in={}",
            ttl.as_secs()
        ))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.read().contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = MemoryObjectStore::new();
        store
            .put("recordings/bot_x.wav", vec![1, 2, 3], "audio/wav")
            .await
            .unwrap();
        assert!(store.exists("recordings/bot_x.wav").await.unwrap());
        assert_eq!(store.get("recordings/bot_x.wav").await.unwrap(), vec![1, 2, 3]);

        store.delete("recordings/bot_x.wav").await.unwrap();
        assert!(!store.exists("recordings/bot_x.wav").await.unwrap());
        assert!(store.get("recordings/bot_x.wav").await.is_err());
    }

    #[tokio::test]
    async fn overwrite_is_last_write_wins() {
        let store = MemoryObjectStore::new();
        store.put("k", vec![1], "a").await.unwrap();
        store.put("k", vec![2], "b").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), vec![2]);
        assert_eq!(store.len(), 1);
    }
}
