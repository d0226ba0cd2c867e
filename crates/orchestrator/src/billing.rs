//! Runtime credit accounting.

use qm_domain::config::BillingConfig;
use qm_domain::platform::Platform;
use qm_domain::settings::RecordingType;
use qm_store::CreditDebit;

/// Compute the debit for a bot's runtime: rate × started minutes.
/// Zero-duration runs are free (the bot never reached the meeting).
pub fn runtime_debit(
    billing: &BillingConfig,
    platform: Platform,
    recording_type: RecordingType,
    duration_ms: u64,
) -> Option<CreditDebit> {
    if duration_ms == 0 {
        return None;
    }
    let minutes = duration_ms.div_ceil(60_000) as i64;
    let rate = billing.rate_mc_per_minute(platform.class(), recording_type);
    Some(CreditDebit {
        amount_mc: rate * minutes,
        description: format!(
            "{} minute(s) on {} ({:?})",
            minutes, platform, recording_type
        ),
    })
}
