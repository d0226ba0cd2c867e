//! HMAC-SHA256 payload signatures.
//!
//! `X-Webhook-Signature: sha256=<hex>` over the exact request body.
//! Verification is constant-time.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// The signature header name.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Mint a new base64 subscription secret (32 random bytes).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Header value for a body: `sha256=<hex>`.
pub fn signature_header(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a received `sha256=<hex>` header value.
pub fn verify_signature(secret: &str, body: &[u8], header_value: &str) -> bool {
    let received = header_value
        .strip_prefix("sha256=")
        .unwrap_or(header_value);
    let expected = signature_header(secret, body);
    let expected = expected.strip_prefix("sha256=").expect("added above");
    expected.as_bytes().ct_eq(received.as_bytes()).unwrap_u8() == 1
}
