//! S3-compatible backend with AWS Signature Version 4 request signing.
//!
//! Works against AWS, MinIO and Ceph RGW. Path-style addressing is the
//! default because most self-hosted deployments require it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use qm_domain::config::S3Config;
use qm_domain::{Error, Result};

use crate::ObjectStore;

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

pub struct S3Store {
    endpoint: String,
    bucket: String,
    region: String,
    path_style: bool,
    access_key: String,
    secret_key: String,
    client: reqwest::Client,
}

impl S3Store {
    pub fn from_config(config: &S3Config) -> Result<Self> {
        let access_key = std::env::var(&config.access_key_env)
            .map_err(|_| Error::Credential(format!("{} is not set", config.access_key_env)))?;
        let secret_key = std::env::var(&config.secret_key_env)
            .map_err(|_| Error::Credential(format!("{} is not set", config.secret_key_env)))?;
        Ok(Self::new(
            &config.endpoint,
            &config.bucket,
            &config.region,
            config.path_style,
            access_key,
            secret_key,
        ))
    }

    pub fn new(
        endpoint: &str,
        bucket: &str,
        region: &str,
        path_style: bool,
        access_key: String,
        secret_key: String,
    ) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            bucket: bucket.to_owned(),
            region: region.to_owned(),
            path_style,
            access_key,
            secret_key,
            client: reqwest::Client::new(),
        }
    }

    /// `(url, host, uri_path)` for a key.
    fn object_url(&self, key: &str) -> Result<(String, String, String)> {
        let host = self
            .endpoint
            .strip_prefix("https://")
            .or_else(|| self.endpoint.strip_prefix("http://"))
            .ok_or_else(|| Error::Storage(format!("bad endpoint: {}", self.endpoint)))?;
        if self.path_style {
            let path = format!("/{}/{}", self.bucket, uri_encode(key, false));
            Ok((format!("{}{path}", self.endpoint), host.to_owned(), path))
        } else {
            let host = format!("{}.{host}", self.bucket);
            let scheme = if self.endpoint.starts_with("https") {
                "https"
            } else {
                "http"
            };
            let path = format!("/{}", uri_encode(key, false));
            Ok((format!("{scheme}://{host}{path}"), host, path))
        }
    }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let mut key = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        for part in [self.region.as_str(), "s3", "aws4_request"] {
            key = hmac_sha256(&key, part.as_bytes());
        }
        key
    }

    /// Sign one request; returns the `Authorization` header value plus
    /// the amz-date header it covers.
    fn authorization(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query: &str,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> (String, String) {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let canonical_headers = format!(
            "host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n"
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{method}\n{path}\n{query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let scope = format!("{date}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date),
            string_to_sign.as_bytes(),
        ));

        (
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.access_key
            ),
            amz_date,
        )
    }

    async fn request(
        &self,
        method: reqwest::Method,
        key: &str,
        body: Option<(Vec<u8>, &str)>,
    ) -> Result<reqwest::Response> {
        let (url, host, path) = self.object_url(key)?;
        let payload_hash = match &body {
            Some((data, _)) => hex::encode(Sha256::digest(data)),
            None => hex::encode(Sha256::digest(b"")),
        };
        let (authorization, amz_date) = self.authorization(
            method.as_str(),
            &host,
            &path,
            "",
            &payload_hash,
            Utc::now(),
        );

        let mut request = self
            .client
            .request(method, &url)
            .header("Host", &host)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("Authorization", authorization);
        if let Some((data, content_type)) = body {
            request = request.header("Content-Type", content_type).body(data);
        }
        request
            .send()
            .await
            .map_err(|e| Error::Storage(format!("s3 request: {e}")))
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<String> {
        let response = self
            .request(reqwest::Method::PUT, key, Some((data, content_type)))
            .await?;
        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "s3 put {key}: {}",
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
                "s3 get {key}: {}",
                response.status()
            )));
        }
        Ok(response
            .bytes()
            .await
            .map_err(|e| Error::Storage(format!("s3 body: {e}")))?
            .to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self.request(reqwest::Method::DELETE, key, None).await?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::Storage(format!(
                "s3 delete {key}: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let (url, host, path) = self.object_url(key)?;
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/s3/aws4_request", self.region);
        let credential = uri_encode(&format!("{}/{scope}", self.access_key), true);

        let query = format!(
            "X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential={credential}&X-Amz-Date={amz_date}&X-Amz-Expires={}&X-Amz-SignedHeaders=host",
            ttl.as_secs()
        );
        let canonical_request = format!(
            "GET\n{path}\n{query}\nhost:{host}\n\nhost\n{UNSIGNED_PAYLOAD}"
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date),
            string_to_sign.as_bytes(),
        ));

        let base = url
            .split_once('?')
            .map(|(base, _)| base.to_owned())
            .unwrap_or(url);
        Ok(format!("{base}?{query}&X-Amz-Signature={signature}"))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let response = self.request(reqwest::Method::HEAD, key, None).await?;
        Ok(response.status().is_success())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// AWS-style URI encoding: unreserved characters pass, everything else
/// becomes `%XX`; `/` survives in paths but not in query values.
fn uri_encode(raw: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
