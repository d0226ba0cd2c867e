//! The webhook engine: payload assembly, signing, and delivery.
//!
//! Emission and delivery are decoupled through the store's delivery
//! queue. [`WebhookEmitter`] matches a trigger against a project's
//! active subscriptions and enqueues one attempt per match;
//! [`DeliveryWorker`]s claim due attempts, POST with an HMAC signature
//! over the exact body bytes, and record retries on the configured
//! offset schedule.

pub mod engine;
pub mod payload;
pub mod sign;

pub use engine::{DeliveryWorker, WebhookEmitter};
pub use payload::build_payload;
pub use sign::{generate_secret, signature_header, verify_signature};
