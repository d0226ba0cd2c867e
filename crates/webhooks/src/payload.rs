//! Webhook payload assembly.

use chrono::Utc;

use qm_domain::trigger::TriggerType;
use qm_domain::{ids, Error, Result};
use qm_store::Bot;

/// Build the JSON payload for a trigger. Returns the payload and its
/// idempotency key (shared by every subscription receiving this event).
///
/// Meeting bots carry `bot_id`, app sessions `app_session_id`;
/// organization-level triggers carry neither.
pub fn build_payload(
    trigger: TriggerType,
    bot: Option<&Bot>,
    data: serde_json::Value,
) -> Result<(serde_json::Value, String)> {
    let idempotency_key = ids::idempotency_key();
    let mut payload = serde_json::json!({
        "trigger": trigger,
        "data": data,
        "idempotency_key": idempotency_key,
        "timestamp": Utc::now().to_rfc3339(),
    });

    if let Some(bot) = bot {
        let object = payload
            .as_object_mut()
            .ok_or_else(|| Error::Other("payload is always an object".into()))?;
        let key = if bot.is_app_session() {
            "app_session_id"
        } else {
            "bot_id"
        };
        object.insert(key.into(), serde_json::Value::String(bot.object_id.clone()));
    }

    Ok((payload, idempotency_key))
}
