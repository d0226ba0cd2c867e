//! OpenStack Swift backend.
//!
//! Authenticates against Keystone v3 with an application credential,
//! caches the issued token until shortly before expiry, and re-auths
//! once on a 401. Signed download links use Temp-URL signatures
//! (HMAC-SHA256 variant) minted from the account's Temp-URL key.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;

use qm_domain::config::SwiftConfig;
use qm_domain::{Error, Result};

use crate::ObjectStore;

type HmacSha256 = Hmac<Sha256>;

/// Tokens are refreshed this long before their actual expiry.
const TOKEN_SLACK: chrono::Duration = chrono::Duration::minutes(5);

#[derive(Clone)]
struct Token {
    value: String,
    storage_url: String,
    expires_at: DateTime<Utc>,
}

pub struct SwiftStore {
    auth_url: String,
    container: String,
    credential_id: String,
    credential_secret: String,
    temp_url_key: String,
    client: reqwest::Client,
    token: RwLock<Option<Token>>,
}

impl SwiftStore {
    pub fn from_config(config: &SwiftConfig) -> Result<Self> {
        let credential_id = std::env::var(&config.application_credential_id_env).map_err(|_| {
            Error::Credential(format!("{} is not set", config.application_credential_id_env))
        })?;
        let credential_secret =
            std::env::var(&config.application_credential_secret_env).map_err(|_| {
                Error::Credential(format!(
                    "{} is not set",
                    config.application_credential_secret_env
                ))
            })?;
        let temp_url_key = std::env::var(&config.temp_url_key_env).unwrap_or_default();
        Ok(Self {
            auth_url: config.auth_url.trim_end_matches('/').to_owned(),
            container: config.container.clone(),
            credential_id,
            credential_secret,
            temp_url_key,
            client: reqwest::Client::new(),
            token: RwLock::new(None),
        })
    }

    async fn token(&self) -> Result<Token> {
        if let Some(token) = self.token.read().clone() {
            if token.expires_at - TOKEN_SLACK > Utc::now() {
                return Ok(token);
            }
        }
        let token = self.authenticate().await?;
        *self.token.write() = Some(token.clone());
        Ok(token)
    }

    async fn authenticate(&self) -> Result<Token> {
        let body = serde_json::json!({
            "auth": {
                "identity": {
                    "methods": ["application_credential"],
                    "application_credential": {
                        "id": self.credential_id,
                        "secret": self.credential_secret,
                    }
                }
            }
        });
        let response = self
            .client
            .post(format!("{}/auth/tokens", self.auth_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("keystone auth: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "keystone auth: {}",
                response.status()
            )));
        }

        let value = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::Storage("keystone auth: no X-Subject-Token".into()))?
            .to_owned();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("keystone auth body: {e}")))?;

        let storage_url = object_store_endpoint(&payload).ok_or_else(|| {
            Error::Storage("keystone catalog has no public object-store endpoint".into())
        })?;
        let expires_at = payload["token"]["expires_at"]
            .as_str()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(1));

        tracing::debug!(storage_url = %storage_url, "swift token issued");
        Ok(Token {
            value,
            storage_url,
            expires_at,
        })
    }

    fn object_path(&self, token: &Token, key: &str) -> String {
        format!("{}/{}/{key}", token.storage_url, self.container)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        key: &str,
        body: Option<(Vec<u8>, &str)>,
    ) -> Result<reqwest::Response> {
        // One retry on 401: the token may have been revoked early.
        for attempt in 0..2 {
            let token = self.token().await?;
            let url = self.object_path(&token, key);
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("X-Auth-Token", &token.value);
            if let Some((data, content_type)) = &body {
                request = request
                    .header("Content-Type", *content_type)
                    .body(data.clone());
            }
            let response = request
                .send()
                .await
                .map_err(|e| Error::Storage(format!("swift request: {e}")))?;
            if response.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                *self.token.write() = None;
                continue;
            }
            return Ok(response);
        }
        unreachable!("loop always returns by the second attempt")
    }
}

#[async_trait::async_trait]
impl ObjectStore for SwiftStore {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<String> {
        let response = self
            .request(reqwest::Method::PUT, key, Some((data, content_type)))
            .await?;
        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "swift put {key}: {}",
                response.status()
            )));
        }
        Ok(response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self.request(reqwest::Method::GET, key, None).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("object {key}")));
        }
        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "swift get {key}: {}",
                response.status()
            )));
        }
        Ok(response
            .bytes()
            .await
            .map_err(|e| Error::Storage(format!("swift body: {e}")))?
            .to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self.request(reqwest::Method::DELETE, key, None).await?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::Storage(format!(
                "swift delete {key}: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if self.temp_url_key.is_empty() {
            return Err(Error::Storage(
                "swift temp-url key is not configured".into(),
            ));
        }
        let token = self.token().await?;
        let url = self.object_path(&token, key);
        // Path part of the storage URL (strip scheme and host).
        let path = url
            .splitn(4, '/')
            .nth(3)
            .map(|rest| format!("/{rest}"))
            .ok_or_else(|| Error::Storage(format!("malformed storage url: {url}")))?;

        let expires = (Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default()).timestamp();
        let message = format!("GET\n{expires}\n{path}");
        let mut mac = HmacSha256::new_from_slice(self.temp_url_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(message.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!(
            "{url}?temp_url_sig=sha256:{signature}&temp_url_expires={expires}"
        ))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let response = self.request(reqwest::Method::HEAD, key, None).await?;
        Ok(response.status().is_success())
    }
}

/// Find the public object-store endpoint in a Keystone token catalog.
fn object_store_endpoint(payload: &serde_json::Value) -> Option<String> {
    payload["token"]["catalog"]
        .as_array()?
        .iter()
        .find(|service| service["type"] == "object-store")?["endpoints"]
        .as_array()?
        .iter()
        .find(|endpoint| endpoint["interface"] == "public")?["url"]
        .as_str()
        .map(|url| url.trim_end_matches('/').to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_endpoint_extraction() {
        let payload = serde_json::json!({
            "token": {
                "expires_at": "2026-08-01T12:00:00Z",
                "catalog": [
                    { "type": "compute", "endpoints": [] },
                    {
                        "type": "object-store",
                        "endpoints": [
                            { "interface": "internal", "url": "http://internal/swift/v1/acct" },
                            { "interface": "public", "url": "https://swift.example.com/v1/acct/" }
                        ]
                    }
                ]
            }
        });
        assert_eq!(
            object_store_endpoint(&payload).unwrap(),
            "https://swift.example.com/v1/acct"
        );
    }

    #[test]
    fn missing_catalog_is_none() {
        assert!(object_store_endpoint(&serde_json::json!({})).is_none());
        let no_public = serde_json::json!({
            "token": { "catalog": [{ "type": "object-store", "endpoints": [] }] }
        });
        assert!(object_store_endpoint(&no_public).is_none());
    }
}
