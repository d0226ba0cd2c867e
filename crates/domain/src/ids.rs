//! Opaque public identifiers.
//!
//! Row ids are plain [`uuid::Uuid`]s and never leave the service. Anything
//! that crosses the API or appears in a storage key uses a prefixed opaque
//! id (`bot_…`, `sess_…`) so the backing store can change without breaking
//! external references.

use uuid::Uuid;

/// Opaque id for a meeting bot (`bot_<32 hex>`).
pub fn bot_object_id() -> String {
    format!("bot_{}", Uuid::new_v4().simple())
}

/// Opaque id for an RTMS app session (`sess_<32 hex>`).
pub fn app_session_object_id() -> String {
    format!("sess_{}", Uuid::new_v4().simple())
}

/// Opaque id for a chat message (`msg_<32 hex>`).
pub fn chat_message_object_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// Idempotency key for a webhook payload.
pub fn idempotency_key() -> String {
    Uuid::new_v4().to_string()
}
